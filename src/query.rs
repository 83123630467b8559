//! Region queries: resolve overlapping tiles, stream their archived
//! point bytes per contributing file, decode, attach effective classes
//! from the overlay, and exact-filter points of boundary tiles.

use crate::archive::TileArchive;
use crate::codec::{self, DecodedPoint};
use crate::error::{Result, ResultExt, StoreError};
use crate::geometry::{
	region_contains_point, relate_region_tile, CoverRelation, CrsTransform,
};
use crate::header::{FileEntry, ProjectHeader};
use crate::model::tile::{tile_polygon, TileKey};
use crate::overlay::ClassificationSidecar;
use crate::pool::WorkerPool;
use geo_types::{Geometry, MultiPolygon};
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;

/// Query-time knobs. `crs` is the CRS of the query region text; when it
/// differs from the project CRS a `transform` must be supplied.
#[derive(Default)]
pub struct QueryOptions<'a> {
	pub crs: Option<&'a str>,
	pub transform: Option<&'a dyn CrsTransform>,
	/// Tiles the caller wants left out regardless of overlap.
	pub exclude_tiles: &'a [TileKey],
	pub threads: usize,
}

/// One matched point with its storage address, so follow-up
/// reclassification can target it.
#[derive(Debug, Clone, Copy)]
pub struct QueryPoint {
	pub x: f64,
	pub y: f64,
	pub z: f64,
	pub original_class: u8,
	pub effective_class: u8,
	/// Position within the tile's stream for this source file.
	pub position: u32,
	pub decoded: DecodedPoint,
}

/// Points grouped per source file, then per tile name. Tiles that
/// matched nothing are absent.
#[derive(Debug, Default)]
pub struct QueryResult {
	pub files: BTreeMap<u32, BTreeMap<String, Vec<QueryPoint>>>,
}

impl QueryResult {
	pub fn total_points(&self) -> u64 {
		self.files
			.values()
			.flat_map(|tiles| tiles.values())
			.map(|points| points.len() as u64)
			.sum()
	}
}

/// Resolve the query region into project CRS.
fn project_region(
	header: &ProjectHeader,
	region_wkt: &str,
	options: &QueryOptions<'_>,
) -> Result<MultiPolygon<f64>> {
	let region = crate::geometry::region_from_wkt(region_wkt)?;
	match options.crs {
		Some(crs) if crs != header.config.crs => {
			let transform = options.transform.ok_or_else(|| {
				StoreError::Config(format!(
					"query region CRS '{}' differs from project CRS '{}' and no transform was supplied",
					crs, header.config.crs
				))
			})?;
			match transform.transform(
				&Geometry::MultiPolygon(region),
				crs,
				&header.config.crs,
			)? {
				Geometry::MultiPolygon(mp) => Ok(mp),
				Geometry::Polygon(p) => Ok(MultiPolygon(vec![p])),
				_ => Err(StoreError::Config(
					"CRS transform changed the region's geometry type".to_string(),
				)),
			}
		}
		_ => Ok(region),
	}
}

/// Tiles overlapping the region, each with whether an exact per-point
/// filter is still needed. Independent per tile, so mapped over the
/// pool.
fn resolve_tiles(
	header: &ProjectHeader,
	region: &MultiPolygon<f64>,
	options: &QueryOptions<'_>,
	pool: &WorkerPool,
) -> Result<BTreeMap<TileKey, bool>> {
	let grid_size = header.config.grid_size;
	let candidates: Vec<TileKey> = header
		.registry
		.keys()
		.filter(|key| !options.exclude_tiles.contains(key))
		.copied()
		.collect();

	let matched: Mutex<BTreeMap<TileKey, bool>> = Mutex::new(BTreeMap::new());
	pool.run(
		candidates,
		&matched,
		|key| {
			let relation = relate_region_tile(region, &tile_polygon(key, grid_size));
			Ok((key, relation))
		},
		|matched, (key, relation)| {
			match relation {
				CoverRelation::Full => {
					matched.insert(key, false);
				}
				CoverRelation::Partial => {
					matched.insert(key, true);
				}
				CoverRelation::Disjoint => {}
			}
			Ok(())
		},
	)?;
	Ok(matched.into_inner().expect("tile resolution lock poisoned"))
}

/// Decode one file's share of the matched tiles.
fn read_file_tiles(
	project_root: &Path,
	header: &ProjectHeader,
	entry: &FileEntry,
	tiles: &[(TileKey, bool)],
	region: &MultiPolygon<f64>,
) -> Result<BTreeMap<String, Vec<QueryPoint>>> {
	let sidecar = ClassificationSidecar::load(&project_root.join(&entry.sidecar))
		.context("loading classification sidecar")?;
	let mut archive = TileArchive::open(&project_root.join(&entry.archive))
		.context("opening tile archive")?;
	let depth = header.config.color_depth;
	let record_size = codec::record_size(&sidecar.existence, depth);

	let mut out = BTreeMap::new();
	for &(key, needs_filter) in tiles {
		let name = key.name();
		let bytes = archive.read_tile(&name)?;
		if bytes.len() % record_size != 0 {
			return Err(StoreError::Consistency(format!(
				"tile {} of {} holds {} bytes, not a multiple of the {}-byte record",
				name,
				entry.archive,
				bytes.len(),
				record_size
			)));
		}
		let classes = sidecar.tiles.get(&name).ok_or_else(|| {
			StoreError::Consistency(format!(
				"tile {} present in archive {} but missing from its sidecar",
				name, entry.archive
			))
		})?;
		let count = bytes.len() / record_size;
		if classes.original.len() != count {
			return Err(StoreError::Consistency(format!(
				"tile {} of {}: {} stored points but {} original classes",
				name,
				entry.archive,
				count,
				classes.original.len()
			)));
		}

		let mut cursor = Cursor::new(bytes);
		let mut points = Vec::new();
		for position in 0..count as u32 {
			let decoded = codec::decode_point(&mut cursor, &sidecar.existence, depth)?;
			let x = key.x as f64 + decoded.ix as f64 / 1000.0;
			let y = key.y as f64 + decoded.iy as f64 / 1000.0;
			if needs_filter && !region_contains_point(region, x, y) {
				continue;
			}
			let original_class = classes.original[position as usize];
			let effective_class = classes.effective(position).unwrap_or(original_class);
			points.push(QueryPoint {
				x,
				y,
				z: decoded.z,
				original_class,
				effective_class,
				position,
				decoded,
			});
		}
		if !points.is_empty() {
			out.insert(name, points);
		}
	}
	Ok(out)
}

/// Run a region query. Files are independent work units; their per-tile
/// vectors merge into the shared result under the coordinator's mutex.
pub fn query_region(
	project_root: &Path,
	header: &ProjectHeader,
	region_wkt: &str,
	options: &QueryOptions<'_>,
) -> Result<QueryResult> {
	let pool = WorkerPool::new(options.threads)?;
	let region = project_region(header, region_wkt, options)?;

	let matched = resolve_tiles(header, &region, options, &pool)?;
	debug!("query region overlaps {} tiles", matched.len());
	if matched.is_empty() {
		return Ok(QueryResult::default());
	}

	// Work units: one task per contributing file, carrying the matched
	// tiles it actually touched.
	let work: Vec<(&FileEntry, Vec<(TileKey, bool)>)> = header
		.files
		.iter()
		.filter_map(|entry| {
			let tiles: Vec<(TileKey, bool)> = entry
				.tiles
				.iter()
				.filter_map(|tile| matched.get(&tile.key).map(|&filter| (tile.key, filter)))
				.collect();
			if tiles.is_empty() {
				None
			} else {
				Some((entry, tiles))
			}
		})
		.collect();

	let result = Mutex::new(QueryResult::default());
	pool.run(
		work,
		&result,
		|(entry, tiles)| {
			let points = read_file_tiles(project_root, header, entry, &tiles, &region)?;
			Ok((entry.index, points))
		},
		|result, (index, points)| {
			if !points.is_empty() {
				result.files.insert(index, points);
			}
			Ok(())
		},
	)?;

	let result = result.into_inner().expect("query result lock poisoned");
	info!(
		"query matched {} points in {} files",
		result.total_points(),
		result.files.len()
	);
	Ok(result)
}
