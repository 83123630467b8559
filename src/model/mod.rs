pub mod bounds;
pub mod schema;
pub mod tile;

pub use bounds::Bounds;
pub use schema::{AttributeSchema, ColorDepth};
pub use tile::{tile_of, tile_polygon, TileKey, TileRecord};
