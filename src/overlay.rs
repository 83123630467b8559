//! Per-source-file classification sidecar: the immutable original class
//! of every stored point plus a sparse overlay of revisions and
//! tombstones. Points are addressed by their position in a tile's
//! stream; absence of an overlay entry means "unchanged".

use crate::error::{Result, StoreError};
use crate::header::write_atomic;
use crate::model::schema::AttributeSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Reserved overlay class marking a point as logically deleted. The
/// point's bytes stay in the archive and can be recovered.
pub const TOMBSTONE_CLASS: u8 = 255;

/// Classes of one tile: the append-ordered original array plus the
/// sparse overlay, kept sorted by position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TileClasses {
	pub original: Vec<u8>,
	pub overlay: Vec<(u32, u8)>,
}

impl TileClasses {
	pub fn new(original: Vec<u8>) -> TileClasses {
		TileClasses {
			original,
			overlay: Vec::new(),
		}
	}

	/// Overlay value if present, else the original class.
	pub fn effective(&self, position: u32) -> Option<u8> {
		let original = *self.original.get(position as usize)?;
		match self.overlay.binary_search_by_key(&position, |e| e.0) {
			Ok(i) => Some(self.overlay[i].1),
			Err(_) => Some(original),
		}
	}

	fn set_overlay(&mut self, position: u32, class: u8) -> bool {
		// Storing the original value again just removes the entry.
		if self.original[position as usize] == class {
			return self.clear_overlay(position);
		}
		match self.overlay.binary_search_by_key(&position, |e| e.0) {
			Ok(i) => {
				if self.overlay[i].1 == class {
					false
				} else {
					self.overlay[i].1 = class;
					true
				}
			}
			Err(i) => {
				self.overlay.insert(i, (position, class));
				true
			}
		}
	}

	fn clear_overlay(&mut self, position: u32) -> bool {
		match self.overlay.binary_search_by_key(&position, |e| e.0) {
			Ok(i) => {
				self.overlay.remove(i);
				true
			}
			Err(_) => false,
		}
	}
}

/// A non-destructive reclassification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassAction {
	/// Set the effective class; tombstoned points are left alone.
	Change { target: u8 },
	/// Drop the overlay entry, optionally only for points whose current
	/// effective class matches the filter.
	RecoverOriginal { only_effective: Option<u8> },
	/// Tombstone the point.
	Delete,
	/// Restore tombstoned points to their original class, optionally
	/// only those whose original class matches the filter.
	RecoverDeleted { only_original: Option<u8> },
}

/// One source file's classification sidecar. Serialization order: tile
/// point counts, existence flags, original class arrays (inside
/// `tiles`), then the sparse overlays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationSidecar {
	pub version: u32,
	pub point_counts: BTreeMap<String, u64>,
	pub existence: AttributeSchema,
	pub tiles: BTreeMap<String, TileClasses>,
}

pub const SIDECAR_VERSION: u32 = 1;

impl ClassificationSidecar {
	pub fn new(existence: AttributeSchema) -> ClassificationSidecar {
		ClassificationSidecar {
			version: SIDECAR_VERSION,
			point_counts: BTreeMap::new(),
			existence,
			tiles: BTreeMap::new(),
		}
	}

	/// Record one tile's original class array.
	pub fn insert_tile(&mut self, tile_name: String, original: Vec<u8>) {
		self.point_counts
			.insert(tile_name.clone(), original.len() as u64);
		self.tiles.insert(tile_name, TileClasses::new(original));
	}

	pub fn load(path: &Path) -> Result<ClassificationSidecar> {
		let text = fs::read_to_string(path)?;
		let sidecar: ClassificationSidecar = serde_json::from_str(&text)?;
		for (name, classes) in &sidecar.tiles {
			let counted = sidecar.point_counts.get(name).copied().unwrap_or(0);
			if counted != classes.original.len() as u64 {
				return Err(StoreError::Consistency(format!(
					"sidecar {}: tile {} counts {} points but carries {} classes",
					path.display(),
					name,
					counted,
					classes.original.len()
				)));
			}
		}
		Ok(sidecar)
	}

	/// Rewrite the sidecar. Atomic: the new content lands under a
	/// temporary name and replaces the old file in one rename.
	pub fn save(&self, path: &Path) -> Result<()> {
		write_atomic(path, serde_json::to_string(self)?.as_bytes())
	}

	/// Apply `action` to every addressed position. Positions are grouped
	/// by tile name. Any address missing from the loaded arrays fails
	/// the whole call before anything is mutated. Returns the number of
	/// positions whose stored value actually changed.
	pub fn apply(
		&mut self,
		action: ClassAction,
		selection: &BTreeMap<String, Vec<u32>>,
		locked_classes: &[u8],
	) -> Result<u64> {
		// Validate every address first; partial application would leave
		// the sidecar out of sync with the caller's view.
		for (tile_name, positions) in selection {
			let classes = self.tiles.get(tile_name).ok_or_else(|| {
				StoreError::Consistency(format!("tile {} not present in sidecar", tile_name))
			})?;
			for &position in positions {
				if position as usize >= classes.original.len() {
					return Err(StoreError::Consistency(format!(
						"position {} beyond tile {} ({} points)",
						position,
						tile_name,
						classes.original.len()
					)));
				}
			}
		}

		let mut changed = 0u64;
		for (tile_name, positions) in selection {
			let classes = self
				.tiles
				.get_mut(tile_name)
				.ok_or_else(|| StoreError::Consistency(format!("tile {} vanished", tile_name)))?;
			for &position in positions {
				let original = classes.original[position as usize];
				let current = classes.effective(position).ok_or_else(|| {
					StoreError::Consistency(format!(
						"position {} beyond tile {}",
						position, tile_name
					))
				})?;
				if locked_classes.contains(&current) {
					continue;
				}
				let did_change = match action {
					ClassAction::Change { target } => {
						if current == TOMBSTONE_CLASS {
							false
						} else {
							classes.set_overlay(position, target)
						}
					}
					ClassAction::RecoverOriginal { only_effective } => {
						if only_effective.map_or(false, |f| current != f) {
							false
						} else {
							classes.clear_overlay(position)
						}
					}
					ClassAction::Delete => {
						if current == TOMBSTONE_CLASS {
							false
						} else {
							classes.set_overlay(position, TOMBSTONE_CLASS)
						}
					}
					ClassAction::RecoverDeleted { only_original } => {
						if current != TOMBSTONE_CLASS
							|| only_original.map_or(false, |f| original != f)
						{
							false
						} else {
							classes.clear_overlay(position)
						}
					}
				};
				if did_change {
					changed += 1;
				}
			}
		}
		Ok(changed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sidecar_with_tile(classes: Vec<u8>) -> ClassificationSidecar {
		let mut sidecar = ClassificationSidecar::new(AttributeSchema::none());
		sidecar.insert_tile("0_0".to_string(), classes);
		sidecar
	}

	fn select(positions: &[u32]) -> BTreeMap<String, Vec<u32>> {
		let mut selection = BTreeMap::new();
		selection.insert("0_0".to_string(), positions.to_vec());
		selection
	}

	#[test]
	fn test_change_and_effective() {
		let mut sidecar = sidecar_with_tile(vec![2, 2, 5]);
		let changed = sidecar
			.apply(ClassAction::Change { target: 6 }, &select(&[0, 2]), &[])
			.unwrap();
		assert_eq!(changed, 2);

		let tile = &sidecar.tiles["0_0"];
		assert_eq!(tile.effective(0), Some(6));
		assert_eq!(tile.effective(1), Some(2));
		assert_eq!(tile.effective(2), Some(6));
		assert_eq!(tile.original, vec![2, 2, 5]);
	}

	#[test]
	fn test_change_back_to_original_drops_entry() {
		let mut sidecar = sidecar_with_tile(vec![2]);
		sidecar
			.apply(ClassAction::Change { target: 6 }, &select(&[0]), &[])
			.unwrap();
		sidecar
			.apply(ClassAction::Change { target: 2 }, &select(&[0]), &[])
			.unwrap();
		assert!(sidecar.tiles["0_0"].overlay.is_empty());
	}

	#[test]
	fn test_recover_original_is_idempotent() {
		let mut sidecar = sidecar_with_tile(vec![2, 3]);
		sidecar
			.apply(ClassAction::Change { target: 9 }, &select(&[0, 1]), &[])
			.unwrap();

		let first = sidecar
			.apply(
				ClassAction::RecoverOriginal {
					only_effective: None,
				},
				&select(&[0, 1]),
				&[],
			)
			.unwrap();
		assert_eq!(first, 2);

		let second = sidecar
			.apply(
				ClassAction::RecoverOriginal {
					only_effective: None,
				},
				&select(&[0, 1]),
				&[],
			)
			.unwrap();
		assert_eq!(second, 0);
		assert_eq!(sidecar.tiles["0_0"].effective(0), Some(2));
	}

	#[test]
	fn test_tombstone_and_recover_deleted() {
		let mut sidecar = sidecar_with_tile(vec![4, 4]);
		sidecar
			.apply(ClassAction::Delete, &select(&[0]), &[])
			.unwrap();
		assert_eq!(sidecar.tiles["0_0"].effective(0), Some(TOMBSTONE_CLASS));

		// Change must not resurrect a tombstoned point.
		let changed = sidecar
			.apply(ClassAction::Change { target: 7 }, &select(&[0]), &[])
			.unwrap();
		assert_eq!(changed, 0);
		assert_eq!(sidecar.tiles["0_0"].effective(0), Some(TOMBSTONE_CLASS));

		// Recover with a non-matching original filter is a no-op.
		let miss = sidecar
			.apply(
				ClassAction::RecoverDeleted {
					only_original: Some(9),
				},
				&select(&[0]),
				&[],
			)
			.unwrap();
		assert_eq!(miss, 0);

		let hit = sidecar
			.apply(
				ClassAction::RecoverDeleted {
					only_original: Some(4),
				},
				&select(&[0]),
				&[],
			)
			.unwrap();
		assert_eq!(hit, 1);
		assert_eq!(sidecar.tiles["0_0"].effective(0), Some(4));
	}

	#[test]
	fn test_locked_class_guard() {
		let mut sidecar = sidecar_with_tile(vec![2, 3, 2]);
		let changed = sidecar
			.apply(ClassAction::Change { target: 9 }, &select(&[0, 1, 2]), &[2])
			.unwrap();
		// Only the class-3 point moves; effective class 2 is locked.
		assert_eq!(changed, 1);
		assert_eq!(sidecar.tiles["0_0"].effective(0), Some(2));
		assert_eq!(sidecar.tiles["0_0"].effective(1), Some(9));
		assert_eq!(sidecar.tiles["0_0"].effective(2), Some(2));
	}

	#[test]
	fn test_missing_address_fails_whole_batch() {
		let mut sidecar = sidecar_with_tile(vec![2, 2]);
		let mut selection = select(&[0]);
		selection.insert("5_5".to_string(), vec![0]);

		let result = sidecar.apply(ClassAction::Change { target: 9 }, &selection, &[]);
		assert!(matches!(result, Err(StoreError::Consistency(_))));
		// Nothing applied, not even the valid half.
		assert!(sidecar.tiles["0_0"].overlay.is_empty());

		let out_of_range = sidecar.apply(ClassAction::Delete, &select(&[0, 17]), &[]);
		assert!(matches!(out_of_range, Err(StoreError::Consistency(_))));
		assert!(sidecar.tiles["0_0"].overlay.is_empty());
	}

	#[test]
	fn test_sidecar_save_load_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file.classes.json");

		let mut sidecar = sidecar_with_tile(vec![1, 2, 3]);
		sidecar
			.apply(ClassAction::Change { target: 8 }, &select(&[1]), &[])
			.unwrap();
		sidecar.save(&path).unwrap();

		let back = ClassificationSidecar::load(&path).unwrap();
		assert_eq!(back.point_counts["0_0"], 3);
		assert_eq!(back.tiles["0_0"].effective(1), Some(8));
		assert_eq!(back.tiles["0_0"].effective(2), Some(3));
	}
}
