//! Export of one ingested file back through the point source writer
//! collaborator. Tombstoned points stay in storage but are skipped
//! here; overlay revisions override the written classification.

use crate::archive::TileArchive;
use crate::codec;
use crate::error::{Result, ResultExt, StoreError};
use crate::header::{FileEntry, ProjectHeader};
use crate::overlay::{ClassificationSidecar, TOMBSTONE_CLASS};
use crate::source::{PointSourceWriter, SourceRecord};
use log::info;
use std::path::Path;

/// Millimeter quantization used for the exported raw integers; matches
/// the stored local-offset resolution.
const EXPORT_SCALE: f64 = 0.001;

pub fn export_file(
	project_root: &Path,
	header: &ProjectHeader,
	entry: &FileEntry,
	writer: &mut dyn PointSourceWriter,
) -> Result<u64> {
	let sidecar = ClassificationSidecar::load(&project_root.join(&entry.sidecar))
		.context("loading classification sidecar")?;
	let mut archive = TileArchive::open(&project_root.join(&entry.archive))
		.context("opening tile archive")?;
	let depth = header.config.color_depth;
	let record_size = codec::record_size(&sidecar.existence, depth);

	let mut skipped_tombstones = 0u64;
	for tile in &entry.tiles {
		let key = tile.key;
		let name = key.name();
		let bytes = archive.read_tile(&name)?;
		let classes = sidecar.tiles.get(&name).ok_or_else(|| {
			StoreError::Consistency(format!(
				"tile {} missing from sidecar {}",
				name, entry.sidecar
			))
		})?;
		let count = bytes.len() / record_size;
		if classes.original.len() != count || bytes.len() % record_size != 0 {
			return Err(StoreError::Consistency(format!(
				"tile {} of {}: stored bytes disagree with the class array",
				name, entry.archive
			)));
		}

		let mut cursor = std::io::Cursor::new(bytes);
		for position in 0..count as u32 {
			let decoded = codec::decode_point(&mut cursor, &sidecar.existence, depth)?;
			let effective = classes
				.effective(position)
				.unwrap_or(classes.original[position as usize]);
			if effective == TOMBSTONE_CLASS {
				skipped_tombstones += 1;
				continue;
			}

			let x = key.x as f64 + decoded.ix as f64 / 1000.0;
			let y = key.y as f64 + decoded.iy as f64 / 1000.0;
			let record = SourceRecord {
				raw: [
					(x / EXPORT_SCALE).round() as i64,
					(y / EXPORT_SCALE).round() as i64,
					(decoded.z / EXPORT_SCALE).round() as i64,
				],
				classification: classes.original[position as usize],
				color: decoded.color,
				gps_time: decoded.gps.map(|g| g.seconds_of_week()),
				user_data: decoded.user_data,
				intensity: decoded.intensity,
				source_id: decoded.source_id,
				nir: decoded.nir,
				return_number: decoded.return_number,
				number_of_returns: decoded.number_of_returns,
			};
			writer.write_record(&record, Some(effective))?;
		}
	}

	let written = writer.finish()?;
	info!(
		"exported {} points from {} ({} tombstoned points skipped)",
		written, entry.source_path, skipped_tombstones
	);
	Ok(written)
}
