//! Ingestion pipeline: reads source points, routes them into per-tile
//! binary streams, and produces the archive + classification sidecar
//! pair for each file. Task bodies work purely on local state; every
//! shared-registry mutation happens in the merge step.

use crate::archive::ScratchDir;
use crate::codec::{self, PointAttributes};
use crate::error::{Result, ResultExt, StoreError};
use crate::geometry::region_contains_point;
use crate::grid::{tile_roi_standing, RoiStanding};
use crate::header::{FileEntry, FileTile, ProjectConfig, ProjectHeader};
use crate::model::schema::AttributeSchema;
use crate::model::tile::{tile_of, TileKey};
use crate::overlay::ClassificationSidecar;
use crate::source::{PointSource, SourceFormat, SourceRecord};
use geo_types::MultiPolygon;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct IngestOptions {
	/// Rewrite the project header after the pipeline finishes.
	pub persist_header: bool,
	/// Worker threads; 0 uses the available parallelism.
	pub threads: usize,
}

impl Default for IngestOptions {
	fn default() -> IngestOptions {
		IngestOptions {
			persist_header: true,
			threads: 0,
		}
	}
}

/// What one file's ingestion handed back for the merge step.
#[derive(Debug)]
pub struct FileIngestResult {
	pub source_path: PathBuf,
	/// `None` when the file contributed nothing (not an error).
	pub contribution: Option<FileContribution>,
}

#[derive(Debug)]
pub struct FileContribution {
	pub archive_name: String,
	pub sidecar_name: String,
	pub tiles: BTreeMap<TileKey, TileContribution>,
	pub retained_points: u64,
	pub min_x: f64,
	pub min_y: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TileContribution {
	pub points: u64,
	pub standing: RoiStanding,
}

/// Totals over one `ingest_files` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
	pub files_ingested: u64,
	pub files_empty: u64,
	pub points_retained: u64,
}

/// Scan the source until every requested attribute has been observed
/// non-trivially, or the file is exhausted. Returns the requested
/// schema narrowed to what the file actually carries.
pub fn probe_existence(
	source: &mut dyn PointSource,
	requested: &AttributeSchema,
) -> Result<AttributeSchema> {
	let mut seen = AttributeSchema::none();
	while let Some(record) = source.next_record()? {
		seen.color |= record.color.map_or(false, |c| c.iter().any(|&s| s != 0));
		seen.gps_time |= record.gps_time.map_or(false, |t| t != 0.0);
		seen.user_data |= record.user_data.map_or(false, |v| v != 0);
		seen.intensity |= record.intensity.map_or(false, |v| v != 0);
		seen.source_id |= record.source_id.map_or(false, |v| v != 0);
		seen.nir |= record.nir.map_or(false, |v| v != 0);
		seen.return_number |= record.return_number.map_or(false, |v| v != 0);
		seen.number_of_returns |= record.number_of_returns.map_or(false, |v| v != 0);
		if requested.covered_by(&seen) {
			break;
		}
	}
	Ok(requested.intersect(&seen))
}

fn attributes_of(record: &SourceRecord) -> PointAttributes {
	PointAttributes {
		color: record.color,
		gps_time: record.gps_time,
		user_data: record.user_data,
		intensity: record.intensity,
		source_id: record.source_id,
		nir: record.nir,
		return_number: record.return_number,
		number_of_returns: record.number_of_returns,
	}
}

fn file_stem(path: &Path) -> Result<String> {
	path.file_stem()
		.and_then(|s| s.to_str())
		.map(str::to_string)
		.ok_or_else(|| StoreError::Config(format!("unusable source path {}", path.display())))
}

/// Tiles a file may contribute to: every grid cell its bounding box
/// touches, minus cells outside the ROI union.
fn plan_tiles(
	min: [f64; 3],
	max: [f64; 3],
	grid_size: f64,
	roi_union: Option<&MultiPolygon<f64>>,
) -> BTreeMap<TileKey, RoiStanding> {
	let mut plan = BTreeMap::new();
	let origin = tile_of(min[0], min[1], grid_size);
	let mut y = origin.y as f64;
	while y <= max[1] {
		let mut x = origin.x as f64;
		while x <= max[0] {
			let key = tile_of(x, y, grid_size);
			let standing = tile_roi_standing(key, grid_size, roi_union);
			if standing != RoiStanding::Outside {
				plan.insert(key, standing);
			}
			x += grid_size;
		}
		y += grid_size;
	}
	plan
}

/// Ingest one source file. Local work only: the scratch directory, the
/// per-tile sinks and class arrays belong to this call alone.
pub fn ingest_file(
	project_root: &Path,
	config: &ProjectConfig,
	roi_union: Option<&MultiPolygon<f64>>,
	format: &dyn SourceFormat,
	source_path: &Path,
) -> Result<FileIngestResult> {
	let stem = file_stem(source_path)?;

	// Header checks come before any record is read.
	let mut source = format.open(source_path)?;
	let header = source.header().clone();
	if let Some(source_crs) = &header.crs {
		if *source_crs != config.crs {
			return Err(StoreError::Config(format!(
				"{}: source CRS '{}' does not match project CRS '{}'",
				source_path.display(),
				source_crs,
				config.crs
			)));
		}
	}

	// Existence probe: one extra pass, only when the schema asks for
	// optional attributes at all.
	let effective = if config.schema.any() {
		let mut probe = format.open(source_path)?;
		probe_existence(probe.as_mut(), &config.schema)
			.context("existence probe")?
	} else {
		AttributeSchema::none()
	};

	let plan = plan_tiles(header.min, header.max, config.grid_size, roi_union);
	if plan.is_empty() {
		info!(
			"{}: bounding box entirely outside the ROI union, nothing to ingest",
			source_path.display()
		);
		return Ok(FileIngestResult {
			source_path: source_path.to_path_buf(),
			contribution: None,
		});
	}

	let mut scratch = ScratchDir::create(project_root, &stem)?;
	let mut classes: BTreeMap<TileKey, Vec<u8>> = BTreeMap::new();
	let mut counts: BTreeMap<TileKey, u64> = BTreeMap::new();
	let mut retained = 0u64;
	let mut min_x = f64::INFINITY;
	let mut min_y = f64::INFINITY;

	loop {
		let record = match source.next_record() {
			Ok(Some(record)) => record,
			Ok(None) => break,
			Err(e) => {
				scratch.discard()?;
				return Err(e);
			}
		};
		let (x, y, z) = header.world(record.raw);
		let key = tile_of(x, y, config.grid_size);
		let standing = match plan.get(&key) {
			Some(standing) => *standing,
			// Outside the processed bounding box / ROI: skipped, not an error.
			None => continue,
		};
		if standing == RoiStanding::Overlapping {
			if let Some(union) = roi_union {
				if !region_contains_point(union, x, y) {
					continue;
				}
			}
		}

		let ix = codec::local_offset_mm(x, key.x);
		let iy = codec::local_offset_mm(y, key.y);
		let encoded = codec::encode_point(
			scratch.sink(key)?,
			ix,
			iy,
			z,
			&attributes_of(&record),
			&effective,
			config.color_depth,
		);
		if let Err(e) = encoded {
			// Height-domain violations abort the whole file; the scratch
			// directory goes with it so no orphaned tile data survives.
			scratch.discard()?;
			return Err(e.context(format!("ingesting {}", source_path.display())));
		}

		classes.entry(key).or_default().push(record.classification);
		*counts.entry(key).or_default() += 1;
		retained += 1;
		min_x = min_x.min(x);
		min_y = min_y.min(y);
	}

	if retained == 0 {
		debug!("{}: no points retained", source_path.display());
		scratch.discard()?;
		return Ok(FileIngestResult {
			source_path: source_path.to_path_buf(),
			contribution: None,
		});
	}

	let archive_name = format!("{}.tiles.zip", stem);
	let sidecar_name = format!("{}.classes.json", stem);
	scratch
		.finalize(&project_root.join(&archive_name))
		.context("finalizing tile archive")?;

	let mut sidecar = ClassificationSidecar::new(effective);
	for (key, original) in classes {
		sidecar.insert_tile(key.name(), original);
	}
	sidecar
		.save(&project_root.join(&sidecar_name))
		.context("writing classification sidecar")?;

	let tiles = counts
		.into_iter()
		.map(|(key, points)| {
			let standing = plan.get(&key).copied().unwrap_or(RoiStanding::Unrestricted);
			(key, TileContribution { points, standing })
		})
		.collect();

	info!(
		"{}: retained {} points across {} tiles",
		source_path.display(),
		retained,
		sidecar.tiles.len()
	);
	Ok(FileIngestResult {
		source_path: source_path.to_path_buf(),
		contribution: Some(FileContribution {
			archive_name,
			sidecar_name,
			tiles,
			retained_points: retained,
			min_x,
			min_y,
		}),
	})
}

/// Merge one file's result into the shared header. Runs under the
/// coordinator's mutex.
pub fn merge_result(
	header: &mut ProjectHeader,
	result: FileIngestResult,
	summary: &mut IngestSummary,
) -> Result<()> {
	let contribution = match result.contribution {
		Some(contribution) => contribution,
		None => {
			summary.files_empty += 1;
			return Ok(());
		}
	};

	let source_path = result.source_path.to_string_lossy().to_string();
	let index = header.assign_file_index(&source_path);

	// Re-ingesting a path replaces its earlier contribution; back the
	// old per-tile shares out of the registry before the new ones land,
	// pruning tiles only the old version fed.
	let previous: Vec<FileTile> = header
		.file_by_index(index)
		.map(|entry| entry.tiles.clone())
		.unwrap_or_default();
	for tile in &previous {
		header.registry.add_points(&tile.key, -(tile.points as i64));
		header.registry.remove_if_empty(&tile.key);
	}

	let mut tile_shares = Vec::with_capacity(contribution.tiles.len());
	for (key, tile) in &contribution.tiles {
		header.registry.ensure_tile(*key, tile.standing);
		let total = header.registry.add_points(key, tile.points as i64);
		header.max_tile_density = header.max_tile_density.max(total);
		tile_shares.push(FileTile {
			key: *key,
			points: tile.points,
		});
	}

	header.expand_min_extents(contribution.min_x, contribution.min_y);

	match header.file_by_index_mut(index) {
		Some(entry) => {
			entry.archive = contribution.archive_name;
			entry.sidecar = contribution.sidecar_name;
			entry.tiles = tile_shares;
		}
		None => header.files.push(FileEntry {
			index,
			source_path,
			archive: contribution.archive_name,
			sidecar: contribution.sidecar_name,
			tiles: tile_shares,
		}),
	}

	summary.files_ingested += 1;
	summary.points_retained += contribution.retained_points;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::geometry::region_from_wkt;
	use crate::model::schema::ColorDepth;
	use crate::source::SourceHeader;

	struct DeclaredCrsFormat;

	struct DeclaredCrsSource {
		header: SourceHeader,
	}

	impl PointSource for DeclaredCrsSource {
		fn header(&self) -> &SourceHeader {
			&self.header
		}

		fn next_record(&mut self) -> Result<Option<SourceRecord>> {
			Err(StoreError::Source(
				"record read before header checks".to_string(),
			))
		}
	}

	impl SourceFormat for DeclaredCrsFormat {
		fn open(&self, _path: &Path) -> Result<Box<dyn PointSource>> {
			Ok(Box::new(DeclaredCrsSource {
				header: SourceHeader {
					min: [0.0; 3],
					max: [1.0; 3],
					point_count: 1,
					scale: [0.001; 3],
					offset: [0.0; 3],
					crs: Some("EPSG:4326".to_string()),
				},
			}))
		}
	}

	#[test]
	fn test_crs_mismatch_rejected_before_any_read() {
		let dir = tempfile::tempdir().unwrap();
		let config = ProjectConfig {
			srid: Some(25832),
			crs: "ETRS89 / UTM zone 32N".to_string(),
			grid_size: 10.0,
			schema: AttributeSchema {
				intensity: true,
				..AttributeSchema::none()
			},
			color_depth: ColorDepth::Bits16,
		};

		// The schema would trigger an existence probe; the mismatched
		// header must fail the file before a single record is read.
		let result = ingest_file(
			dir.path(),
			&config,
			None,
			&DeclaredCrsFormat,
			Path::new("declared.xyz"),
		);
		assert!(matches!(result, Err(StoreError::Config(_))));
		assert!(!dir.path().join("declared_tiles").exists());
	}

	#[test]
	fn test_plan_tiles_covers_bbox() {
		let plan = plan_tiles([12.0, 12.0, 0.0], [35.0, 22.0, 0.0], 10.0, None);
		let keys: Vec<TileKey> = plan.keys().copied().collect();
		assert_eq!(
			keys,
			vec![
				TileKey::new(10, 10),
				TileKey::new(10, 20),
				TileKey::new(20, 10),
				TileKey::new(20, 20),
				TileKey::new(30, 10),
				TileKey::new(30, 20),
			]
		);
		assert!(plan.values().all(|&s| s == RoiStanding::Unrestricted));
	}

	#[test]
	fn test_plan_tiles_respects_roi() {
		let union = region_from_wkt("POLYGON ((0 0, 15 0, 15 15, 0 15, 0 0))").unwrap();
		let plan = plan_tiles([0.0, 0.0, 0.0], [39.0, 9.0, 0.0], 10.0, Some(&union));

		assert_eq!(plan.get(&TileKey::new(0, 0)), Some(&RoiStanding::Contained));
		assert_eq!(
			plan.get(&TileKey::new(10, 0)),
			Some(&RoiStanding::Overlapping)
		);
		assert!(!plan.contains_key(&TileKey::new(20, 0)));
		assert!(!plan.contains_key(&TileKey::new(30, 0)));
	}
}
