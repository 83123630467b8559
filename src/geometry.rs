//! Thin layer over the polygon engine: WKT import/export, union caching,
//! region/tile relations and the CRS reprojection seam.
//!
//! Geometry values are plain `geo-types` values owned by whoever holds
//! them; there are no manually paired create/destroy calls anywhere.

use crate::error::{Result, StoreError};
use geo::{BooleanOps, Contains, Intersects};
use geo_types::{Geometry, MultiPolygon, Point, Polygon};
use std::str::FromStr;
use wkt::ToWkt;

/// Parse WKT text into a geometry.
pub fn parse_wkt(text: &str) -> Result<Geometry<f64>> {
	wkt::Wkt::from_str(text)
		.map_err(|e| StoreError::WktParse(format!("{:?}", e)))
		.and_then(|w| {
			w.try_into()
				.map_err(|e: wkt::conversion::Error| StoreError::WktParse(format!("{:?}", e)))
		})
}

/// Parse WKT text that must describe an areal region (POLYGON or
/// MULTIPOLYGON).
pub fn region_from_wkt(text: &str) -> Result<MultiPolygon<f64>> {
	match parse_wkt(text)? {
		Geometry::Polygon(p) => Ok(MultiPolygon(vec![p])),
		Geometry::MultiPolygon(mp) => Ok(mp),
		other => Err(StoreError::WktParse(format!(
			"expected POLYGON or MULTIPOLYGON, got {:?}",
			kind_of(&other)
		))),
	}
}

fn kind_of(geom: &Geometry<f64>) -> &'static str {
	match geom {
		Geometry::Point(_) => "POINT",
		Geometry::Line(_) | Geometry::LineString(_) => "LINESTRING",
		Geometry::Polygon(_) => "POLYGON",
		Geometry::MultiPoint(_) => "MULTIPOINT",
		Geometry::MultiLineString(_) => "MULTILINESTRING",
		Geometry::MultiPolygon(_) => "MULTIPOLYGON",
		_ => "GEOMETRY",
	}
}

/// WKT text for a region.
pub fn region_to_wkt(region: &MultiPolygon<f64>) -> String {
	region.wkt_string()
}

/// Union of any number of regions. `None` when the input is empty.
pub fn union_all(regions: &[MultiPolygon<f64>]) -> Option<MultiPolygon<f64>> {
	let mut iter = regions.iter();
	let first = iter.next()?.clone();
	Some(iter.fold(first, |acc, next| acc.union(next)))
}

/// How a region relates to a tile square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverRelation {
	/// No shared area; the tile is out of play.
	Disjoint,
	/// The region crosses the tile boundary; per-point tests required.
	Partial,
	/// The tile lies fully inside the region; no per-point test needed.
	Full,
}

/// Relate a region to a tile square. Full containment wins over overlap.
pub fn relate_region_tile(region: &MultiPolygon<f64>, tile: &Polygon<f64>) -> CoverRelation {
	if region.contains(tile) {
		CoverRelation::Full
	} else if region.intersects(tile) {
		CoverRelation::Partial
	} else {
		CoverRelation::Disjoint
	}
}

/// Exact containment test for a single point.
pub fn region_contains_point(region: &MultiPolygon<f64>, x: f64, y: f64) -> bool {
	region.contains(&Point::new(x, y))
}

/// CRS-aware reprojection between two coordinate reference systems.
/// External collaborator seam: the store never reprojects on its own, a
/// caller with CRS needs supplies an implementation.
pub trait CrsTransform {
	fn transform(&self, geom: &Geometry<f64>, from: &str, to: &str) -> Result<Geometry<f64>>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::tile::{tile_polygon, TileKey};

	#[test]
	fn test_region_from_wkt_rejects_non_areal() {
		assert!(region_from_wkt("POINT (1 2)").is_err());
		assert!(region_from_wkt("not wkt at all").is_err());
		assert!(region_from_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").is_ok());
	}

	#[test]
	fn test_relate_region_tile() {
		let region = region_from_wkt("POLYGON ((0 0, 100 0, 100 100, 0 100, 0 0))").unwrap();

		let inside = tile_polygon(TileKey::new(10, 10), 10.0);
		let straddling = tile_polygon(TileKey::new(90, 90), 20.0);
		let outside = tile_polygon(TileKey::new(200, 200), 10.0);

		assert_eq!(relate_region_tile(&region, &inside), CoverRelation::Full);
		assert_eq!(relate_region_tile(&region, &straddling), CoverRelation::Partial);
		assert_eq!(relate_region_tile(&region, &outside), CoverRelation::Disjoint);
	}

	#[test]
	fn test_union_all_merges_adjacent() {
		let a = region_from_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
		let b = region_from_wkt("POLYGON ((10 0, 20 0, 20 10, 10 10, 10 0))").unwrap();

		let union = union_all(&[a, b]).unwrap();
		assert!(region_contains_point(&union, 5.0, 5.0));
		assert!(region_contains_point(&union, 15.0, 5.0));
		assert!(!region_contains_point(&union, 25.0, 5.0));
	}

	#[test]
	fn test_wkt_round_trip() {
		let region = region_from_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
		let text = region_to_wkt(&region);
		let back = region_from_wkt(&text).unwrap();
		assert!(region_contains_point(&back, 5.0, 5.0));
	}
}
