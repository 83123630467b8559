//! Grid index: the registry of tile records and the tile/ROI relation.
//!
//! The coordinate -> tile mapping itself lives in `model::tile`; this
//! module owns the mutable registry the ingestion and query pipelines
//! consult.

use crate::geometry::{relate_region_tile, CoverRelation};
use crate::model::tile::{tile_polygon, TileKey, TileRecord};
use geo_types::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tile's standing against the ROI union, decided when the tile is
/// first touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiStanding {
	/// No ROI is configured; every tile is fair game.
	Unrestricted,
	/// Fully inside the union; points need no containment test.
	Contained,
	/// Straddles the union boundary; every point needs a test.
	Overlapping,
	/// Outside the union; the tile is never created.
	Outside,
}

/// Relate a tile square to the ROI union, if one is active.
pub fn tile_roi_standing(
	key: TileKey,
	grid_size: f64,
	roi_union: Option<&MultiPolygon<f64>>,
) -> RoiStanding {
	match roi_union {
		None => RoiStanding::Unrestricted,
		Some(union) => match relate_region_tile(union, &tile_polygon(key, grid_size)) {
			CoverRelation::Full => RoiStanding::Contained,
			CoverRelation::Partial => RoiStanding::Overlapping,
			CoverRelation::Disjoint => RoiStanding::Outside,
		},
	}
}

/// Registry of every tile the project currently holds points for.
/// Serialized as a flat record list; JSON maps cannot key on the
/// composite tile coordinates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TileRecord>", into = "Vec<TileRecord>")]
pub struct TileRegistry {
	tiles: BTreeMap<TileKey, TileRecord>,
}

impl From<Vec<TileRecord>> for TileRegistry {
	fn from(records: Vec<TileRecord>) -> TileRegistry {
		TileRegistry {
			tiles: records.into_iter().map(|r| (r.key, r)).collect(),
		}
	}
}

impl From<TileRegistry> for Vec<TileRecord> {
	fn from(registry: TileRegistry) -> Vec<TileRecord> {
		registry.tiles.into_values().collect()
	}
}

impl TileRegistry {
	pub fn new() -> TileRegistry {
		TileRegistry::default()
	}

	pub fn len(&self) -> usize {
		self.tiles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tiles.is_empty()
	}

	pub fn get(&self, key: &TileKey) -> Option<&TileRecord> {
		self.tiles.get(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = &TileRecord> {
		self.tiles.values()
	}

	pub fn keys(&self) -> impl Iterator<Item = &TileKey> {
		self.tiles.keys()
	}

	/// Create the tile record unless one exists. Returns whether a new
	/// record was created; an `Outside` standing never creates one.
	pub fn ensure_tile(&mut self, key: TileKey, standing: RoiStanding) -> bool {
		if standing == RoiStanding::Outside || self.tiles.contains_key(&key) {
			return false;
		}
		let (contained, overlaps) = match standing {
			RoiStanding::Contained => (true, true),
			RoiStanding::Overlapping => (false, true),
			_ => (false, false),
		};
		self.tiles.insert(
			key,
			TileRecord {
				key,
				point_count: 0,
				contained_in_roi: contained,
				overlaps_roi: overlaps,
			},
		);
		true
	}

	/// Add (or, with a negative delta, subtract) points contributed to a
	/// tile. Returns the new cumulative count; 0 for an unknown tile.
	pub fn add_points(&mut self, key: &TileKey, delta: i64) -> u64 {
		match self.tiles.get_mut(key) {
			Some(record) => {
				record.point_count = if delta < 0 {
					record.point_count.saturating_sub(delta.unsigned_abs())
				} else {
					record.point_count + delta as u64
				};
				record.point_count
			}
			None => 0,
		}
	}

	/// Drop the tile record when its point count has returned to zero.
	/// Used after failed or empty ingestions and after source-file
	/// removal. Returns whether a record was removed.
	pub fn remove_if_empty(&mut self, key: &TileKey) -> bool {
		match self.tiles.get(key) {
			Some(record) if record.point_count == 0 => {
				self.tiles.remove(key);
				true
			}
			_ => false,
		}
	}
}
