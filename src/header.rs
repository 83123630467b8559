//! The single persisted record of project-wide state: CRS, grid size,
//! attribute schema, registries and ROIs. Created once, reloaded on
//! open, rewritten after structural mutations when the caller asks for
//! persistence.

use crate::error::{Result, StoreError};
use crate::geometry::{region_from_wkt, region_to_wkt, union_all};
use crate::grid::TileRegistry;
use crate::model::schema::{AttributeSchema, ColorDepth};
use crate::model::tile::TileKey;
use geo_types::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const HEADER_FILE: &str = "project.json";
pub const HEADER_VERSION: u32 = 1;

/// The 16-bit millimeter local offsets wrap above this grid size, so
/// project creation rejects anything larger.
pub const MAX_GRID_SIZE: f64 = 65.535;

/// Write `bytes` to `path` through a temporary sibling plus rename, so
/// a crash mid-write never leaves a truncated file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);
	fs::write(&tmp, bytes)?;
	fs::rename(&tmp, path)?;
	Ok(())
}

/// Immutable per-project configuration, validated once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
	/// Spatial reference identifier, when the CRS has one.
	pub srid: Option<u32>,
	/// CRS description text.
	pub crs: String,
	/// Edge length of every tile, in CRS length units.
	pub grid_size: f64,
	pub schema: AttributeSchema,
	pub color_depth: ColorDepth,
}

impl ProjectConfig {
	pub fn validate(&self) -> Result<()> {
		if !self.grid_size.is_finite() || self.grid_size <= 0.0 {
			return Err(StoreError::Config(format!(
				"grid size must be positive, got {}",
				self.grid_size
			)));
		}
		if self.grid_size.fract() != 0.0 {
			return Err(StoreError::Config(format!(
				"grid size {} is not a whole number of length units; tile keys are integral",
				self.grid_size
			)));
		}
		if self.grid_size > MAX_GRID_SIZE {
			return Err(StoreError::Config(format!(
				"grid size {} exceeds {} and would wrap the 16-bit local offsets",
				self.grid_size, MAX_GRID_SIZE
			)));
		}
		if self.crs.trim().is_empty() {
			return Err(StoreError::Config("CRS description is empty".to_string()));
		}
		Ok(())
	}
}

/// One tile a source file contributed points to, with the file's share
/// of the tile's cumulative count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileTile {
	pub key: TileKey,
	pub points: u64,
}

/// One ingested source file and the sidecars keyed by its base name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
	pub index: u32,
	pub source_path: String,
	/// Archive file name, relative to the project root.
	pub archive: String,
	/// Classification sidecar file name, relative to the project root.
	pub sidecar: String,
	/// Tiles this file contributed points to, with per-tile shares so a
	/// replaced or removed file can be backed out of the registry.
	pub tiles: Vec<FileTile>,
}

/// A named region of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiEntry {
	pub name: String,
	pub wkt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectHeader {
	pub version: u32,
	pub config: ProjectConfig,
	/// Running minimum extents over every retained point.
	pub min_extent_x: Option<f64>,
	pub min_extent_y: Option<f64>,
	/// Largest cumulative point count any tile has reached.
	pub max_tile_density: u64,
	pub next_file_index: u32,
	pub files: Vec<FileEntry>,
	pub registry: TileRegistry,
	pub rois: Vec<RoiEntry>,
	/// Cached union of all ROI polygons, as WKT.
	pub roi_union_wkt: Option<String>,
}

impl ProjectHeader {
	pub fn new(config: ProjectConfig) -> ProjectHeader {
		ProjectHeader {
			version: HEADER_VERSION,
			config,
			min_extent_x: None,
			min_extent_y: None,
			max_tile_density: 0,
			next_file_index: 0,
			files: Vec::new(),
			registry: TileRegistry::new(),
			rois: Vec::new(),
			roi_union_wkt: None,
		}
	}

	pub fn load(path: &Path) -> Result<ProjectHeader> {
		let text = fs::read_to_string(path)?;
		let header: ProjectHeader = serde_json::from_str(&text)?;
		if header.version != HEADER_VERSION {
			return Err(StoreError::Config(format!(
				"header version {} not supported (expected {})",
				header.version, HEADER_VERSION
			)));
		}
		header.config.validate()?;
		Ok(header)
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
	}

	pub fn file_by_path(&self, source_path: &str) -> Option<&FileEntry> {
		self.files.iter().find(|f| f.source_path == source_path)
	}

	pub fn file_by_index(&self, index: u32) -> Option<&FileEntry> {
		self.files.iter().find(|f| f.index == index)
	}

	pub fn file_by_index_mut(&mut self, index: u32) -> Option<&mut FileEntry> {
		self.files.iter_mut().find(|f| f.index == index)
	}

	/// The file index for a source path: the existing one when the path
	/// was ingested before, otherwise the next free index.
	pub fn assign_file_index(&mut self, source_path: &str) -> u32 {
		if let Some(entry) = self.file_by_path(source_path) {
			return entry.index;
		}
		let index = self.next_file_index;
		self.next_file_index += 1;
		index
	}

	/// Fold new point minima into the running extents.
	pub fn expand_min_extents(&mut self, min_x: f64, min_y: f64) {
		self.min_extent_x = Some(self.min_extent_x.map_or(min_x, |v| v.min(min_x)));
		self.min_extent_y = Some(self.min_extent_y.map_or(min_y, |v| v.min(min_y)));
	}

	/// Add an ROI and refresh the cached union.
	pub fn add_roi(&mut self, name: String, wkt: String) -> Result<()> {
		if self.rois.iter().any(|r| r.name == name) {
			return Err(StoreError::Config(format!("ROI {} already exists", name)));
		}
		// Validate before storing.
		region_from_wkt(&wkt)?;
		self.rois.push(RoiEntry { name, wkt });
		self.recompute_roi_union()
	}

	fn recompute_roi_union(&mut self) -> Result<()> {
		let regions = self
			.rois
			.iter()
			.map(|r| region_from_wkt(&r.wkt))
			.collect::<Result<Vec<MultiPolygon<f64>>>>()?;
		self.roi_union_wkt = union_all(&regions).map(|u| region_to_wkt(&u));
		Ok(())
	}

	/// The cached ROI union, parsed. `None` while no ROI is configured.
	pub fn roi_union(&self) -> Result<Option<MultiPolygon<f64>>> {
		match &self.roi_union_wkt {
			Some(wkt) => Ok(Some(region_from_wkt(wkt)?)),
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> ProjectConfig {
		ProjectConfig {
			srid: Some(25832),
			crs: "ETRS89 / UTM zone 32N".to_string(),
			grid_size: 10.0,
			schema: AttributeSchema::none(),
			color_depth: ColorDepth::Bits16,
		}
	}

	#[test]
	fn test_config_validation() {
		assert!(config().validate().is_ok());

		let mut bad = config();
		bad.grid_size = 0.0;
		assert!(matches!(bad.validate(), Err(StoreError::Config(_))));

		// Fractional grid sizes would truncate in the tile keys, so the
		// tile polygon would no longer contain the tile's own points.
		let mut fractional = config();
		fractional.grid_size = 0.5;
		assert!(matches!(fractional.validate(), Err(StoreError::Config(_))));
		fractional.grid_size = 65.535;
		assert!(matches!(fractional.validate(), Err(StoreError::Config(_))));

		// 16-bit millimeter offsets cap the grid size at 65.535.
		let mut too_big = config();
		too_big.grid_size = 66.0;
		assert!(matches!(too_big.validate(), Err(StoreError::Config(_))));
		too_big.grid_size = 65.0;
		assert!(too_big.validate().is_ok());

		let mut no_crs = config();
		no_crs.crs = "  ".to_string();
		assert!(matches!(no_crs.validate(), Err(StoreError::Config(_))));
	}

	#[test]
	fn test_file_index_assignment_reuses_paths() {
		let mut header = ProjectHeader::new(config());
		let first = header.assign_file_index("a.csv");
		header.files.push(FileEntry {
			index: first,
			source_path: "a.csv".to_string(),
			archive: "a.tiles.zip".to_string(),
			sidecar: "a.classes.json".to_string(),
			tiles: vec![],
		});

		assert_eq!(header.assign_file_index("a.csv"), first);
		assert_eq!(header.assign_file_index("b.csv"), first + 1);
	}

	#[test]
	fn test_roi_union_caching() {
		let mut header = ProjectHeader::new(config());
		assert!(header.roi_union().unwrap().is_none());

		header
			.add_roi(
				"west".to_string(),
				"POLYGON ((0 0, 50 0, 50 50, 0 50, 0 0))".to_string(),
			)
			.unwrap();
		header
			.add_roi(
				"east".to_string(),
				"POLYGON ((50 0, 100 0, 100 50, 50 50, 50 0))".to_string(),
			)
			.unwrap();

		let union = header.roi_union().unwrap().unwrap();
		assert!(crate::geometry::region_contains_point(&union, 75.0, 25.0));

		let duplicate = header.add_roi("west".to_string(), "POLYGON EMPTY".to_string());
		assert!(duplicate.is_err());
	}

	#[test]
	fn test_header_save_load_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(HEADER_FILE);

		let mut header = ProjectHeader::new(config());
		header.expand_min_extents(100.0, 200.0);
		header.expand_min_extents(50.0, 300.0);
		header.max_tile_density = 12;
		header.save(&path).unwrap();

		let back = ProjectHeader::load(&path).unwrap();
		assert_eq!(back.min_extent_x, Some(50.0));
		assert_eq!(back.min_extent_y, Some(200.0));
		assert_eq!(back.max_tile_density, 12);
		assert_eq!(back.config.grid_size, 10.0);
	}
}
