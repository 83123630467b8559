//! Tile archive lifecycle: the per-file scratch directory of growing
//! tile streams, its compaction into one zip archive per source file,
//! and random access to archived tile streams.

use crate::error::{Result, StoreError};
use crate::model::tile::TileKey;
use log::debug;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Transient working area for one file's ingestion: one appendable
/// binary file per touched tile, opened lazily on the first point
/// routed there.
pub struct ScratchDir {
	dir: PathBuf,
	sinks: HashMap<TileKey, BufWriter<File>>,
}

impl ScratchDir {
	/// Create the scratch directory, replacing any stale leftover from
	/// an earlier crashed or aborted run.
	pub fn create(scratch_root: &Path, stem: &str) -> Result<ScratchDir> {
		let dir = scratch_root.join(format!("{}_tiles", stem));
		if dir.exists() {
			debug!("removing stale scratch directory {}", dir.display());
			fs::remove_dir_all(&dir)?;
		}
		fs::create_dir_all(&dir)?;
		Ok(ScratchDir {
			dir,
			sinks: HashMap::new(),
		})
	}

	/// The appendable sink for one tile's stream.
	pub fn sink(&mut self, key: TileKey) -> Result<&mut BufWriter<File>> {
		match self.sinks.entry(key) {
			Entry::Occupied(entry) => Ok(entry.into_mut()),
			Entry::Vacant(entry) => {
				let path = self.dir.join(format!("{}.bin", key.name()));
				Ok(entry.insert(BufWriter::new(File::create(path)?)))
			}
		}
	}

	pub fn tile_count(&self) -> usize {
		self.sinks.len()
	}

	/// Close every sink and compress the scratch directory into one
	/// archive, then remove the scratch directory. On any failure the
	/// partial archive is removed; no archive is left behind.
	pub fn finalize(mut self, archive_path: &Path) -> Result<()> {
		let mut keys: Vec<TileKey> = self.sinks.keys().copied().collect();
		keys.sort();
		for (_, sink) in self.sinks.drain() {
			sink.into_inner()
				.map_err(|e| StoreError::Archive(format!("flush failed: {}", e)))?
				.sync_all()?;
		}

		let result = self.write_archive(&keys, archive_path);
		if result.is_err() && archive_path.exists() {
			let _ = fs::remove_file(archive_path);
		}
		result?;

		fs::remove_dir_all(&self.dir)?;
		Ok(())
	}

	fn write_archive(&self, keys: &[TileKey], archive_path: &Path) -> Result<()> {
		let file = File::create(archive_path)?;
		let mut writer = ZipWriter::new(file);
		let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

		let mut buf = Vec::new();
		for key in keys {
			let tile_path = self.dir.join(format!("{}.bin", key.name()));
			buf.clear();
			File::open(&tile_path)?.read_to_end(&mut buf)?;
			writer
				.start_file(key.name(), options)
				.map_err(zip_error)?;
			writer.write_all(&buf)?;
		}
		writer.finish().map_err(zip_error)?;
		Ok(())
	}

	/// Remove the scratch directory and everything in it. Used for
	/// empty files and for the height-domain abort path.
	pub fn discard(mut self) -> Result<()> {
		self.sinks.clear();
		fs::remove_dir_all(&self.dir)?;
		Ok(())
	}
}

fn zip_error(e: ZipError) -> StoreError {
	StoreError::Archive(e.to_string())
}

/// Read handle over one source file's finalized tile archive.
pub struct TileArchive {
	path: PathBuf,
	zip: ZipArchive<File>,
}

impl TileArchive {
	pub fn open(path: &Path) -> Result<TileArchive> {
		let file = File::open(path)?;
		let zip = ZipArchive::new(file).map_err(zip_error)?;
		Ok(TileArchive {
			path: path.to_path_buf(),
			zip,
		})
	}

	/// The full byte stream of one tile. A tile the registry claims but
	/// the archive lacks is a consistency failure, never skipped.
	pub fn read_tile(&mut self, tile_name: &str) -> Result<Vec<u8>> {
		let mut entry = match self.zip.by_name(tile_name) {
			Ok(entry) => entry,
			Err(ZipError::FileNotFound) => {
				return Err(StoreError::Consistency(format!(
					"tile {} missing from archive {}",
					tile_name,
					self.path.display()
				)))
			}
			Err(e) => return Err(zip_error(e)),
		};
		let mut bytes = Vec::with_capacity(entry.size() as usize);
		entry.read_to_end(&mut bytes)?;
		Ok(bytes)
	}

	pub fn tile_names(&self) -> Vec<String> {
		self.zip.file_names().map(str::to_string).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_scratch_finalize_and_read_back() {
		let dir = tempfile::tempdir().unwrap();
		let archive_path = dir.path().join("input.tiles.zip");

		let mut scratch = ScratchDir::create(dir.path(), "input").unwrap();
		scratch
			.sink(TileKey::new(0, 0))
			.unwrap()
			.write_all(b"tile zero")
			.unwrap();
		scratch
			.sink(TileKey::new(10, 0))
			.unwrap()
			.write_all(b"tile ten")
			.unwrap();
		assert_eq!(scratch.tile_count(), 2);

		scratch.finalize(&archive_path).unwrap();
		assert!(!dir.path().join("input_tiles").exists());

		let mut archive = TileArchive::open(&archive_path).unwrap();
		assert_eq!(archive.read_tile("0_0").unwrap(), b"tile zero");
		assert_eq!(archive.read_tile("10_0").unwrap(), b"tile ten");
	}

	#[test]
	fn test_missing_tile_is_consistency_error() {
		let dir = tempfile::tempdir().unwrap();
		let archive_path = dir.path().join("input.tiles.zip");

		let mut scratch = ScratchDir::create(dir.path(), "input").unwrap();
		scratch
			.sink(TileKey::new(0, 0))
			.unwrap()
			.write_all(b"x")
			.unwrap();
		scratch.finalize(&archive_path).unwrap();

		let mut archive = TileArchive::open(&archive_path).unwrap();
		assert!(matches!(
			archive.read_tile("99_99"),
			Err(StoreError::Consistency(_))
		));
	}

	#[test]
	fn test_discard_leaves_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let mut scratch = ScratchDir::create(dir.path(), "input").unwrap();
		scratch
			.sink(TileKey::new(0, 0))
			.unwrap()
			.write_all(b"x")
			.unwrap();
		scratch.discard().unwrap();
		assert!(!dir.path().join("input_tiles").exists());
	}

	#[test]
	fn test_create_replaces_stale_scratch() {
		let dir = tempfile::tempdir().unwrap();
		let stale = dir.path().join("input_tiles");
		fs::create_dir_all(&stale).unwrap();
		fs::write(stale.join("0_0.bin"), b"stale").unwrap();

		let scratch = ScratchDir::create(dir.path(), "input").unwrap();
		assert_eq!(scratch.tile_count(), 0);
		assert!(!stale.join("0_0.bin").exists());
		scratch.discard().unwrap();
	}
}
