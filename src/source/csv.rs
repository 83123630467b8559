//! CSV-backed point source: one row per point, world coordinates plus a
//! classification column and any of the optional attribute columns.
//! Raw integers are derived with a fixed millimeter scale so the trait
//! contract (integer XYZ, scale, offset) holds.

use super::{PointSource, PointSourceWriter, SourceFormat, SourceHeader, SourceRecord};
use crate::error::{Result, StoreError};
use crate::model::bounds::Bounds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const MM_SCALE: f64 = 0.001;

#[derive(Debug, Deserialize)]
struct CsvRow {
	pub x: f64,
	pub y: f64,
	pub z: f64,
	pub classification: u8,
	pub red: Option<u16>,
	pub green: Option<u16>,
	pub blue: Option<u16>,
	pub gps_time: Option<f64>,
	pub user_data: Option<u8>,
	pub intensity: Option<u16>,
	pub source_id: Option<u16>,
	pub nir: Option<u16>,
	pub return_number: Option<u8>,
	pub number_of_returns: Option<u8>,
}

fn csv_error(e: csv::Error) -> StoreError {
	StoreError::Source(e.to_string())
}

fn record_from_row(row: CsvRow) -> SourceRecord {
	let color = match (row.red, row.green, row.blue) {
		(Some(r), Some(g), Some(b)) => Some([r, g, b]),
		_ => None,
	};
	SourceRecord {
		raw: [
			(row.x / MM_SCALE).round() as i64,
			(row.y / MM_SCALE).round() as i64,
			(row.z / MM_SCALE).round() as i64,
		],
		classification: row.classification,
		color,
		gps_time: row.gps_time,
		user_data: row.user_data,
		intensity: row.intensity,
		source_id: row.source_id,
		nir: row.nir,
		return_number: row.return_number,
		number_of_returns: row.number_of_returns,
	}
}

/// Opens CSV point files.
#[derive(Debug, Default)]
pub struct CsvSourceFormat;

impl SourceFormat for CsvSourceFormat {
	fn open(&self, path: &Path) -> Result<Box<dyn PointSource>> {
		Ok(Box::new(CsvSource::open(path)?))
	}
}

pub struct CsvSource {
	header: SourceHeader,
	records: std::vec::IntoIter<SourceRecord>,
}

impl CsvSource {
	pub fn open(path: &Path) -> Result<CsvSource> {
		let buffer = fs::read(path)?;
		let mut reader = csv::Reader::from_reader(&buffer[..]);

		let mut bounds = Bounds::empty();
		let mut records = Vec::new();
		for row in reader.deserialize() {
			let row: CsvRow = row.map_err(csv_error)?;
			bounds.expand(row.x, row.y, row.z);
			records.push(record_from_row(row));
		}

		if bounds.is_empty() {
			bounds = Bounds::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
		}
		let header = SourceHeader {
			min: [bounds.min_x, bounds.min_y, bounds.min_z],
			max: [bounds.max_x, bounds.max_y, bounds.max_z],
			point_count: records.len() as u64,
			scale: [MM_SCALE; 3],
			offset: [0.0; 3],
			crs: None,
		};
		Ok(CsvSource {
			header,
			records: records.into_iter(),
		})
	}
}

impl PointSource for CsvSource {
	fn header(&self) -> &SourceHeader {
		&self.header
	}

	fn next_record(&mut self) -> Result<Option<SourceRecord>> {
		Ok(self.records.next())
	}
}

#[derive(Debug, Serialize)]
struct CsvOutRow {
	x: f64,
	y: f64,
	z: f64,
	classification: u8,
	red: Option<u16>,
	green: Option<u16>,
	blue: Option<u16>,
	gps_time: Option<f64>,
	user_data: Option<u8>,
	intensity: Option<u16>,
	source_id: Option<u16>,
	nir: Option<u16>,
	return_number: Option<u8>,
	number_of_returns: Option<u8>,
}

/// CSV point writer opened from a cloned input header.
pub struct CsvPointWriter {
	header: SourceHeader,
	writer: csv::Writer<fs::File>,
	written: u64,
}

impl CsvPointWriter {
	pub fn create(path: &Path, header: SourceHeader) -> Result<CsvPointWriter> {
		let writer = csv::Writer::from_path(path).map_err(csv_error)?;
		Ok(CsvPointWriter {
			header,
			writer,
			written: 0,
		})
	}
}

impl PointSourceWriter for CsvPointWriter {
	fn write_record(&mut self, record: &SourceRecord, class_override: Option<u8>) -> Result<()> {
		let (x, y, z) = self.header.world(record.raw);
		let [red, green, blue] = match record.color {
			Some([r, g, b]) => [Some(r), Some(g), Some(b)],
			None => [None, None, None],
		};
		self.writer
			.serialize(CsvOutRow {
				x,
				y,
				z,
				classification: class_override.unwrap_or(record.classification),
				red,
				green,
				blue,
				gps_time: record.gps_time,
				user_data: record.user_data,
				intensity: record.intensity,
				source_id: record.source_id,
				nir: record.nir,
				return_number: record.return_number,
				number_of_returns: record.number_of_returns,
			})
			.map_err(csv_error)?;
		self.written += 1;
		Ok(())
	}

	fn finish(&mut self) -> Result<u64> {
		self.writer.flush()?;
		Ok(self.written)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_fixture(dir: &Path) -> std::path::PathBuf {
		let path = dir.join("points.csv");
		let mut f = fs::File::create(&path).unwrap();
		writeln!(
			f,
			"x,y,z,classification,red,green,blue,gps_time,user_data,intensity,source_id,nir,return_number,number_of_returns"
		)
		.unwrap();
		writeln!(f, "12.3,45.6,1.5,2,,,,,,120,,,,").unwrap();
		writeln!(f, "13.0,44.0,2.5,5,,,,,,0,,,,").unwrap();
		path
	}

	#[test]
	fn test_read_csv_header_and_records() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_fixture(dir.path());

		let mut source = CsvSource::open(&path).unwrap();
		assert_eq!(source.header().point_count, 2);
		assert_eq!(source.header().min[0], 12.3);
		assert_eq!(source.header().max[2], 2.5);

		let first = source.next_record().unwrap().unwrap();
		assert_eq!(first.classification, 2);
		assert_eq!(first.intensity, Some(120));
		assert!(first.color.is_none());

		let (x, y, z) = source.header().world(first.raw);
		assert!((x - 12.3).abs() < 1e-9);
		assert!((y - 45.6).abs() < 1e-9);
		assert!((z - 1.5).abs() < 1e-9);

		assert!(source.next_record().unwrap().is_some());
		assert!(source.next_record().unwrap().is_none());
	}

	#[test]
	fn test_writer_round_trip_with_override() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_fixture(dir.path());
		let out_path = dir.path().join("out.csv");

		let mut source = CsvSource::open(&path).unwrap();
		let header = source.header().clone();
		let mut writer = CsvPointWriter::create(&out_path, header).unwrap();

		while let Some(record) = source.next_record().unwrap() {
			writer.write_record(&record, Some(9)).unwrap();
		}
		assert_eq!(writer.finish().unwrap(), 2);

		let mut back = CsvSource::open(&out_path).unwrap();
		let first = back.next_record().unwrap().unwrap();
		assert_eq!(first.classification, 9);
	}
}
