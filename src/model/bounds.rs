use serde::{Deserialize, Serialize};

/// World-space axis-aligned bounding box.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
	pub min_x: f64,
	pub min_y: f64,
	pub min_z: f64,
	pub max_x: f64,
	pub max_y: f64,
	pub max_z: f64,
}

impl Bounds {
	pub fn new(min_x: f64, min_y: f64, min_z: f64, max_x: f64, max_y: f64, max_z: f64) -> Bounds {
		Bounds {
			min_x,
			min_y,
			min_z,
			max_x,
			max_y,
			max_z,
		}
	}

	/// A box that any expansion will overwrite.
	pub fn empty() -> Bounds {
		Bounds {
			min_x: f64::INFINITY,
			min_y: f64::INFINITY,
			min_z: f64::INFINITY,
			max_x: f64::NEG_INFINITY,
			max_y: f64::NEG_INFINITY,
			max_z: f64::NEG_INFINITY,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.min_x > self.max_x
	}

	pub fn expand(&mut self, x: f64, y: f64, z: f64) {
		self.min_x = self.min_x.min(x);
		self.min_y = self.min_y.min(y);
		self.min_z = self.min_z.min(z);
		self.max_x = self.max_x.max(x);
		self.max_y = self.max_y.max(y);
		self.max_z = self.max_z.max(z);
	}
}
