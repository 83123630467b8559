use serde::{Deserialize, Serialize};

/// Sample width used for color and near-infrared values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorDepth {
	Bits8,
	Bits16,
}

impl ColorDepth {
	pub fn sample_bytes(&self) -> usize {
		match self {
			ColorDepth::Bits8 => 1,
			ColorDepth::Bits16 => 2,
		}
	}
}

/// Which optional point attributes a project (or a single source file)
/// carries. Fixed at project creation; narrowed per source file by the
/// existence probe. Field order matches the binary record order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
	pub color: bool,
	pub gps_time: bool,
	pub user_data: bool,
	pub intensity: bool,
	pub source_id: bool,
	pub nir: bool,
	pub return_number: bool,
	pub number_of_returns: bool,
}

impl AttributeSchema {
	/// Schema with no optional attributes.
	pub fn none() -> AttributeSchema {
		AttributeSchema::default()
	}

	pub fn all() -> AttributeSchema {
		AttributeSchema {
			color: true,
			gps_time: true,
			user_data: true,
			intensity: true,
			source_id: true,
			nir: true,
			return_number: true,
			number_of_returns: true,
		}
	}

	pub fn any(&self) -> bool {
		self.color
			|| self.gps_time
			|| self.user_data
			|| self.intensity
			|| self.source_id
			|| self.nir
			|| self.return_number
			|| self.number_of_returns
	}

	/// Attributes requested by both schemas. Used to narrow the project
	/// schema with a file's probe result.
	pub fn intersect(&self, other: &AttributeSchema) -> AttributeSchema {
		AttributeSchema {
			color: self.color && other.color,
			gps_time: self.gps_time && other.gps_time,
			user_data: self.user_data && other.user_data,
			intensity: self.intensity && other.intensity,
			source_id: self.source_id && other.source_id,
			nir: self.nir && other.nir,
			return_number: self.return_number && other.return_number,
			number_of_returns: self.number_of_returns && other.number_of_returns,
		}
	}

	/// True when every attribute requested by `self` is set in `other`.
	pub fn covered_by(&self, other: &AttributeSchema) -> bool {
		self.intersect(other) == *self
	}
}
