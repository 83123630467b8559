//! Point source collaborator contracts. The engine consumes raw points
//! through these traits and never decodes source file formats itself.

pub mod csv;

use crate::error::Result;
use std::path::Path;

pub use csv::{CsvPointWriter, CsvSourceFormat};

/// Header fields every point source exposes.
#[derive(Debug, Clone)]
pub struct SourceHeader {
	pub min: [f64; 3],
	pub max: [f64; 3],
	pub point_count: u64,
	/// Per-axis scale applied to the raw integer coordinates.
	pub scale: [f64; 3],
	/// Per-axis offset applied after scaling.
	pub offset: [f64; 3],
	/// CRS description, when the source declares one.
	pub crs: Option<String>,
}

impl SourceHeader {
	/// World coordinates of one raw integer triple.
	pub fn world(&self, raw: [i64; 3]) -> (f64, f64, f64) {
		(
			raw[0] as f64 * self.scale[0] + self.offset[0],
			raw[1] as f64 * self.scale[1] + self.offset[1],
			raw[2] as f64 * self.scale[2] + self.offset[2],
		)
	}
}

/// One raw source point: integer XYZ plus classification and whatever
/// optional attributes the format carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceRecord {
	pub raw: [i64; 3],
	pub classification: u8,
	pub color: Option<[u16; 3]>,
	/// GPS time as seconds-of-week.
	pub gps_time: Option<f64>,
	pub user_data: Option<u8>,
	pub intensity: Option<u16>,
	pub source_id: Option<u16>,
	pub nir: Option<u16>,
	pub return_number: Option<u8>,
	pub number_of_returns: Option<u8>,
}

/// An open point source, consumed record by record in file order.
pub trait PointSource {
	fn header(&self) -> &SourceHeader;
	fn next_record(&mut self) -> Result<Option<SourceRecord>>;
}

/// Opens point sources of one on-disk format. Ingestion opens each file
/// twice: once for the existence probe, once for the point pass.
pub trait SourceFormat: Sync {
	fn open(&self, path: &Path) -> Result<Box<dyn PointSource>>;
}

/// Point source writer: opened from a cloned input header, accepts
/// points with a possibly overridden classification, tracks inventory.
pub trait PointSourceWriter {
	fn write_record(&mut self, record: &SourceRecord, class_override: Option<u8>) -> Result<()>;
	/// Flush and close, returning the number of points written.
	fn finish(&mut self) -> Result<u64>;
}
