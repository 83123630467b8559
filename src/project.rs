//! Project lifecycle and the operations built on the engine: ingestion,
//! region queries, reclassification, source-file removal and export.

use crate::error::{Result, ResultExt, StoreError};
use crate::export;
use crate::header::{FileEntry, ProjectConfig, ProjectHeader, HEADER_FILE};
use crate::ingest::{self, IngestOptions, IngestSummary};
use crate::overlay::{ClassAction, ClassificationSidecar};
use crate::pool::WorkerPool;
use crate::query::{self, QueryOptions, QueryResult};
use crate::source::{PointSourceWriter, SourceFormat};
use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Addresses of points to reclassify: file index -> tile name ->
/// positions within that tile's stream.
#[derive(Debug, Default, Clone)]
pub struct PointSelection {
	pub by_file: BTreeMap<u32, BTreeMap<String, Vec<u32>>>,
}

impl PointSelection {
	pub fn add(&mut self, file_index: u32, tile_name: String, position: u32) {
		self.by_file
			.entry(file_index)
			.or_default()
			.entry(tile_name)
			.or_default()
			.push(position);
	}

	pub fn is_empty(&self) -> bool {
		self.by_file.is_empty()
	}
}

/// A filesystem-resident tiled point store.
pub struct Project {
	root: PathBuf,
	header: ProjectHeader,
}

impl Project {
	/// Create a new project directory with a validated configuration.
	pub fn create(root: &Path, config: ProjectConfig) -> Result<Project> {
		config.validate()?;
		let header_path = root.join(HEADER_FILE);
		if header_path.exists() {
			return Err(StoreError::Config(format!(
				"project already exists at {}",
				root.display()
			)));
		}
		fs::create_dir_all(root)?;

		let header = ProjectHeader::new(config);
		header.save(&header_path)?;
		info!("created project at {}", root.display());
		Ok(Project {
			root: root.to_path_buf(),
			header,
		})
	}

	/// Open an existing project from its persisted header.
	pub fn open(root: &Path) -> Result<Project> {
		let header = ProjectHeader::load(&root.join(HEADER_FILE)).context("opening project")?;
		Ok(Project {
			root: root.to_path_buf(),
			header,
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn header(&self) -> &ProjectHeader {
		&self.header
	}

	fn save_header(&self) -> Result<()> {
		self.header.save(&self.root.join(HEADER_FILE))
	}

	/// Add a named ROI polygon and refresh the cached union. ROIs gate
	/// which tiles future ingestions may create.
	pub fn add_roi(&mut self, name: &str, wkt: &str, persist: bool) -> Result<()> {
		self.header.add_roi(name.to_string(), wkt.to_string())?;
		if persist {
			self.save_header()?;
		}
		Ok(())
	}

	/// Ingest a batch of source files, one worker task per file. Shared
	/// registries are only touched in the merge step, under the
	/// coordinator's single lock.
	pub fn ingest_files(
		&mut self,
		paths: &[PathBuf],
		format: &dyn SourceFormat,
		options: &IngestOptions,
	) -> Result<IngestSummary> {
		let pool = WorkerPool::new(options.threads)?;
		let roi_union = self.header.roi_union()?;
		let config = self.header.config.clone();
		let root = self.root.clone();

		let shared = Mutex::new((&mut self.header, IngestSummary::default()));
		let run = pool.run(
			paths.to_vec(),
			&shared,
			|path| ingest::ingest_file(&root, &config, roi_union.as_ref(), format, &path),
			|(header, summary), result| ingest::merge_result(header, result, summary),
		);
		let summary = shared.into_inner().expect("ingest state lock poisoned").1;
		run?;

		if options.persist_header {
			self.save_header()?;
		}
		info!(
			"ingested {} files ({} empty), {} points retained",
			summary.files_ingested, summary.files_empty, summary.points_retained
		);
		Ok(summary)
	}

	/// Query all points inside a region given as WKT.
	pub fn query(&self, region_wkt: &str, options: &QueryOptions<'_>) -> Result<QueryResult> {
		query::query_region(&self.root, &self.header, region_wkt, options)
	}

	/// Apply a reclassification action to the selected points. Every
	/// address is validated against the loaded sidecars before anything
	/// is written; sidecars are only rewritten when a value actually
	/// changed. The caller must serialize this against concurrent
	/// queries of the same files.
	pub fn update_points(
		&self,
		action: ClassAction,
		selection: &PointSelection,
		locked_classes: &[u8],
	) -> Result<u64> {
		// Load and validate everything up front so a bad address in one
		// file cannot leave another file half-applied.
		let mut loaded: Vec<(&FileEntry, ClassificationSidecar, u64)> = Vec::new();
		for (&file_index, tiles) in &selection.by_file {
			let entry = self.header.file_by_index(file_index).ok_or_else(|| {
				StoreError::Consistency(format!("file index {} not in project", file_index))
			})?;
			let mut sidecar = ClassificationSidecar::load(&self.root.join(&entry.sidecar))
				.context("loading classification sidecar")?;
			let changed = sidecar.apply(action, tiles, locked_classes)?;
			loaded.push((entry, sidecar, changed));
		}

		let mut total_changed = 0u64;
		for (entry, sidecar, changed) in loaded {
			if changed > 0 {
				sidecar.save(&self.root.join(&entry.sidecar))?;
				total_changed += changed;
			}
		}
		if total_changed > 0 {
			info!("reclassified {} points", total_changed);
		}
		Ok(total_changed)
	}

	/// Remove an ingested source file: delete its archive and sidecar,
	/// then subtract its tile shares and prune tiles left empty.
	pub fn remove_file(&mut self, file_index: u32, persist: bool) -> Result<()> {
		let position = self
			.header
			.files
			.iter()
			.position(|f| f.index == file_index)
			.ok_or_else(|| {
				StoreError::Consistency(format!("file index {} not in project", file_index))
			})?;

		// Disk first: a failed deletion leaves the header untouched.
		{
			let entry = &self.header.files[position];
			fs::remove_file(self.root.join(&entry.archive))?;
			fs::remove_file(self.root.join(&entry.sidecar))?;
		}

		let entry = self.header.files.remove(position);
		for tile in &entry.tiles {
			self.header
				.registry
				.add_points(&tile.key, -(tile.points as i64));
			self.header.registry.remove_if_empty(&tile.key);
		}
		info!("removed source file {} from project", entry.source_path);

		if persist {
			self.save_header()?;
		}
		Ok(())
	}

	/// Export one ingested file through a point source writer, skipping
	/// tombstoned points and applying overlay classes.
	pub fn export_file(
		&self,
		file_index: u32,
		writer: &mut dyn PointSourceWriter,
	) -> Result<u64> {
		let entry = self.header.file_by_index(file_index).ok_or_else(|| {
			StoreError::Consistency(format!("file index {} not in project", file_index))
		})?;
		export::export_file(&self.root, &self.header, entry, writer)
	}
}
