//! Filesystem-resident tiled point store for classified LIDAR data.
//!
//! Points land in fixed square grid tiles, each stored as a compact
//! quantized binary stream inside a per-source-file zip archive. The
//! original classification of every point is immutable; edits and
//! deletions live in a sparse overlay sidecar next to each archive.
//! A single JSON header carries the project configuration, the tile
//! registry and the named regions of interest.

pub mod archive;
pub mod codec;
pub mod error;
pub mod export;
pub mod geometry;
pub mod grid;
pub mod header;
pub mod ingest;
pub mod model;
pub mod overlay;
pub mod pool;
pub mod project;
pub mod query;
pub mod source;

pub use error::{Result, StoreError};
pub use header::{ProjectConfig, ProjectHeader};
pub use ingest::{IngestOptions, IngestSummary};
pub use model::schema::{AttributeSchema, ColorDepth};
pub use model::tile::TileKey;
pub use overlay::{ClassAction, TOMBSTONE_CLASS};
pub use project::{PointSelection, Project};
pub use query::{QueryOptions, QueryResult};
