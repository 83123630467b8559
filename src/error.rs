//! Error types for the tile store.

use crate::codec::{HEIGHT_MAX, HEIGHT_MIN};
use thiserror::Error;

/// Tile store errors, grouped by failure class: configuration errors are
/// rejected before any disk access, domain errors abort the current source
/// file, consistency errors are always fatal.
#[derive(Error, Debug)]
pub enum StoreError {
	/// Invalid or conflicting project configuration (bad grid size, CRS
	/// mismatch between project and input, missing header).
	#[error("configuration error: {0}")]
	Config(String),

	/// I/O failure while touching the project directory, a scratch file,
	/// an archive or a sidecar.
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// Point height outside the representable band. Aborts the whole
	/// source file; no archive is kept for it.
	#[error("height {z} outside [{HEIGHT_MIN}, {HEIGHT_MAX}]")]
	HeightOutOfRange { z: f64 },

	/// The registry references a tile or point position that the stored
	/// data does not actually contain.
	#[error("consistency error: {0}")]
	Consistency(String),

	/// WKT text could not be parsed into a geometry.
	#[error("WKT parse error: {0}")]
	WktParse(String),

	/// Header or sidecar (de)serialization failure.
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),

	/// Tile archive creation or extraction failure.
	#[error("archive error: {0}")]
	Archive(String),

	/// Point source reader/writer failure.
	#[error("source error: {0}")]
	Source(String),

	/// A failure wrapped with the name of the operation that hit it.
	#[error("{op}: {source}")]
	Op {
		op: String,
		#[source]
		source: Box<StoreError>,
	},
}

impl StoreError {
	/// Wrap this error with the name of the failing operation.
	pub fn context(self, op: impl Into<String>) -> StoreError {
		StoreError::Op {
			op: op.into(),
			source: Box::new(self),
		}
	}
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Extension adding `.context("operation")` to store results.
pub trait ResultExt<T> {
	fn context(self, op: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
	fn context(self, op: &str) -> Result<T> {
		self.map_err(|e| e.context(op))
	}
}
