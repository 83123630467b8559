use geo_types::{coord, Polygon, Rect};
use serde::{Deserialize, Serialize};

/// Grid-aligned coordinates of a tile's lower-left corner. The key of the
/// unit of physical point storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
	pub x: i64,
	pub y: i64,
}

impl TileKey {
	pub fn new(x: i64, y: i64) -> TileKey {
		TileKey { x, y }
	}

	/// Name used for archive entries and sidecar keys.
	pub fn name(&self) -> String {
		format!("{}_{}", self.x, self.y)
	}
}

/// Map a world coordinate to its tile: `floor(floor(w) / g) * g`,
/// independently per axis. Grid sizes are whole length units (enforced
/// at project creation), so the product is integral.
pub fn tile_of(x: f64, y: f64, grid_size: f64) -> TileKey {
	TileKey {
		x: ((x.floor() / grid_size).floor() * grid_size) as i64,
		y: ((y.floor() / grid_size).floor() * grid_size) as i64,
	}
}

/// The exact square a tile spans: `[x, x+g) x [y, y+g)`. Reproduces the
/// geometry used when the tile was registered.
pub fn tile_polygon(key: TileKey, grid_size: f64) -> Polygon<f64> {
	let min_x = key.x as f64;
	let min_y = key.y as f64;
	Rect::new(
		coord! { x: min_x, y: min_y },
		coord! { x: min_x + grid_size, y: min_y + grid_size },
	)
	.to_polygon()
}

/// One registered tile: cumulative point count over all contributing
/// source files plus its relation to the ROI union.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileRecord {
	pub key: TileKey,
	pub point_count: u64,
	pub contained_in_roi: bool,
	pub overlaps_roi: bool,
}

impl TileRecord {
	/// A point inside this tile still needs an exact ROI containment test
	/// when the tile straddles the union boundary.
	pub fn needs_roi_point_test(&self) -> bool {
		self.overlaps_roi && !self.contained_in_roi
	}
}
