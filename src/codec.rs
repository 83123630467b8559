//! Quantized point binary codec.
//!
//! One encoded point, little-endian unless noted (field presence is
//! schema-driven, never inferred from content):
//!
//!   u16     ix            millimeters from the tile x origin
//!   u16     iy            millimeters from the tile y origin
//!   u8      height_hi     decimeter count above HEIGHT_MIN, high byte
//!   u8      height_lo     decimeter count, low byte
//!   u8      height_frac   millimeter remainder within the decimeter
//!   -- optional fields, in this order, each gated by the effective
//!      schema (project flags narrowed by the file's existence probe) --
//!   color         3 x u8 or 3 x u16 by project color depth
//!   gps time      u8 packed (day_of_week << 3 | hour_of_day),
//!                 then a 3-byte big-endian sub-hour microsecond counter
//!   user data     u8
//!   intensity     u16
//!   source id     u16
//!   nir           u8 or u16 by project color depth
//!   return number u8
//!   number of returns u8
//!
//! Classification bytes are NOT part of the record; they live in the
//! per-file classification sidecar, indexed by the point's position in
//! the tile stream.

use crate::error::{Result, StoreError};
use crate::model::schema::{AttributeSchema, ColorDepth};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Lowest representable height. `HEIGHT_MAX - HEIGHT_MIN` must stay
/// under 6553.5 so the decimeter count fits sixteen bits.
pub const HEIGHT_MIN: f64 = -500.0;
pub const HEIGHT_MAX: f64 = 5500.0;

/// Optional attribute values of one point, as read from a source file.
/// GPS time is the raw seconds-of-week from the source.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointAttributes {
	pub color: Option<[u16; 3]>,
	pub gps_time: Option<f64>,
	pub user_data: Option<u8>,
	pub intensity: Option<u16>,
	pub source_id: Option<u16>,
	pub nir: Option<u16>,
	pub return_number: Option<u8>,
	pub number_of_returns: Option<u8>,
}

/// Packed GPS time as stored on disk. Kept raw; the packed byte is not
/// uniquely invertible, so decoding does not guess a seconds-of-week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsTime {
	/// `day_of_week << 3 | hour_of_day`.
	pub packed: u8,
	/// Sub-hour microsecond counter, 24 bits.
	pub counter: u32,
}

impl GpsTime {
	pub fn from_seconds_of_week(sow: f64) -> GpsTime {
		let day = (sow / 86_400.0).floor();
		let hour = ((sow - day * 86_400.0) / 3_600.0).floor();
		let sub_hour = sow - day * 86_400.0 - hour * 3_600.0;
		GpsTime {
			packed: ((day as u8) << 3) | hour as u8,
			counter: ((sub_hour * 1_000_000.0).round() as u64 & 0xFF_FF_FF) as u32,
		}
	}

	/// Best-effort reconstruction for export.
	pub fn seconds_of_week(&self) -> f64 {
		let day = (self.packed >> 3) as f64;
		let hour = (self.packed & 0x07) as f64;
		day * 86_400.0 + hour * 3_600.0 + self.counter as f64 / 1_000_000.0
	}
}

/// One decoded point, local to its tile. World coordinates are
/// `tile_origin + i/1000`.
#[derive(Debug, Clone, Copy)]
pub struct DecodedPoint {
	pub ix: u16,
	pub iy: u16,
	pub z: f64,
	pub color: Option<[u16; 3]>,
	pub gps: Option<GpsTime>,
	pub user_data: Option<u8>,
	pub intensity: Option<u16>,
	pub source_id: Option<u16>,
	pub nir: Option<u16>,
	pub return_number: Option<u8>,
	pub number_of_returns: Option<u8>,
}

/// Quantize a world coordinate to millimeters from the tile origin.
/// Valid only while the grid size stays within 65.535 length units,
/// which project creation enforces.
pub fn local_offset_mm(world: f64, tile_origin: i64) -> u16 {
	((world - tile_origin as f64) * 1000.0).round() as u16
}

/// Height triple: `zt = z - HEIGHT_MIN`, decimeter count split into two
/// bytes, then the millimeter remainder within the decimeter bucket.
pub fn encode_height(z: f64) -> Result<(u8, u8, u8)> {
	if !(HEIGHT_MIN..=HEIGHT_MAX).contains(&z) {
		return Err(StoreError::HeightOutOfRange { z });
	}
	let zt = z - HEIGHT_MIN;
	let decimeters = (zt * 10.0).floor() as u32;
	let hi = (decimeters / 256) as u8;
	let lo = (decimeters % 256) as u8;
	let frac = ((zt * 1000.0).round() as i64 - decimeters as i64 * 100) as u8;
	Ok((hi, lo, frac))
}

pub fn decode_height(hi: u8, lo: u8, frac: u8) -> f64 {
	(hi as f64 * 256.0 + lo as f64) / 10.0 + frac as f64 / 1000.0 + HEIGHT_MIN
}

fn color_sample<W: Write>(w: &mut W, sample: u16, depth: ColorDepth) -> Result<()> {
	match depth {
		ColorDepth::Bits8 => w.write_u8(((sample >> 8) as u8).min(255))?,
		ColorDepth::Bits16 => w.write_u16::<LittleEndian>(sample)?,
	}
	Ok(())
}

/// Encode one point into a tile's stream. `flags` is the effective
/// schema for the source file being ingested.
pub fn encode_point<W: Write>(
	w: &mut W,
	ix: u16,
	iy: u16,
	z: f64,
	attrs: &PointAttributes,
	flags: &AttributeSchema,
	depth: ColorDepth,
) -> Result<()> {
	let (hi, lo, frac) = encode_height(z)?;

	w.write_u16::<LittleEndian>(ix)?;
	w.write_u16::<LittleEndian>(iy)?;
	w.write_u8(hi)?;
	w.write_u8(lo)?;
	w.write_u8(frac)?;

	if flags.color {
		let [r, g, b] = attrs.color.unwrap_or([0, 0, 0]);
		color_sample(w, r, depth)?;
		color_sample(w, g, depth)?;
		color_sample(w, b, depth)?;
	}
	if flags.gps_time {
		let gps = GpsTime::from_seconds_of_week(attrs.gps_time.unwrap_or(0.0));
		w.write_u8(gps.packed)?;
		w.write_u8((gps.counter >> 16) as u8)?;
		w.write_u8((gps.counter >> 8) as u8)?;
		w.write_u8(gps.counter as u8)?;
	}
	if flags.user_data {
		w.write_u8(attrs.user_data.unwrap_or(0))?;
	}
	if flags.intensity {
		w.write_u16::<LittleEndian>(attrs.intensity.unwrap_or(0))?;
	}
	if flags.source_id {
		w.write_u16::<LittleEndian>(attrs.source_id.unwrap_or(0))?;
	}
	if flags.nir {
		match depth {
			ColorDepth::Bits8 => {
				w.write_u8(((attrs.nir.unwrap_or(0) >> 8) as u8).min(255))?
			}
			ColorDepth::Bits16 => w.write_u16::<LittleEndian>(attrs.nir.unwrap_or(0))?,
		}
	}
	if flags.return_number {
		w.write_u8(attrs.return_number.unwrap_or(0))?;
	}
	if flags.number_of_returns {
		w.write_u8(attrs.number_of_returns.unwrap_or(0))?;
	}
	Ok(())
}

fn read_color_sample<R: Read>(r: &mut R, depth: ColorDepth) -> Result<u16> {
	Ok(match depth {
		ColorDepth::Bits8 => r.read_u8()? as u16,
		ColorDepth::Bits16 => r.read_u16::<LittleEndian>()?,
	})
}

/// Decode one point. `flags` and `depth` must match the values the
/// stream was encoded with.
pub fn decode_point<R: Read>(
	r: &mut R,
	flags: &AttributeSchema,
	depth: ColorDepth,
) -> Result<DecodedPoint> {
	let ix = r.read_u16::<LittleEndian>()?;
	let iy = r.read_u16::<LittleEndian>()?;
	let hi = r.read_u8()?;
	let lo = r.read_u8()?;
	let frac = r.read_u8()?;

	let mut point = DecodedPoint {
		ix,
		iy,
		z: decode_height(hi, lo, frac),
		color: None,
		gps: None,
		user_data: None,
		intensity: None,
		source_id: None,
		nir: None,
		return_number: None,
		number_of_returns: None,
	};

	if flags.color {
		point.color = Some([
			read_color_sample(r, depth)?,
			read_color_sample(r, depth)?,
			read_color_sample(r, depth)?,
		]);
	}
	if flags.gps_time {
		let packed = r.read_u8()?;
		let b0 = r.read_u8()? as u32;
		let b1 = r.read_u8()? as u32;
		let b2 = r.read_u8()? as u32;
		point.gps = Some(GpsTime {
			packed,
			counter: (b0 << 16) | (b1 << 8) | b2,
		});
	}
	if flags.user_data {
		point.user_data = Some(r.read_u8()?);
	}
	if flags.intensity {
		point.intensity = Some(r.read_u16::<LittleEndian>()?);
	}
	if flags.source_id {
		point.source_id = Some(r.read_u16::<LittleEndian>()?);
	}
	if flags.nir {
		point.nir = Some(match depth {
			ColorDepth::Bits8 => r.read_u8()? as u16,
			ColorDepth::Bits16 => r.read_u16::<LittleEndian>()?,
		});
	}
	if flags.return_number {
		point.return_number = Some(r.read_u8()?);
	}
	if flags.number_of_returns {
		point.number_of_returns = Some(r.read_u8()?);
	}
	Ok(point)
}

/// Bytes one encoded point occupies under the given flags and depth.
pub fn record_size(flags: &AttributeSchema, depth: ColorDepth) -> usize {
	let mut size = 2 + 2 + 3;
	if flags.color {
		size += 3 * depth.sample_bytes();
	}
	if flags.gps_time {
		size += 4;
	}
	if flags.user_data {
		size += 1;
	}
	if flags.intensity {
		size += 2;
	}
	if flags.source_id {
		size += 2;
	}
	if flags.nir {
		size += depth.sample_bytes();
	}
	if flags.return_number {
		size += 1;
	}
	if flags.number_of_returns {
		size += 1;
	}
	size
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::prelude::*;
	use std::io::Cursor;

	#[test]
	fn test_height_round_trip_within_a_millimeter() {
		let mut rng = rand::thread_rng();
		for _ in 0..10_000 {
			let z = rng.gen_range(HEIGHT_MIN..HEIGHT_MIN + 6000.0);
			let (hi, lo, frac) = encode_height(z).unwrap();
			let back = decode_height(hi, lo, frac);
			assert!(
				(back - z).abs() <= 0.001,
				"z={} decoded={} delta={}",
				z,
				back,
				back - z
			);
		}
	}

	#[test]
	fn test_height_example() {
		// HEIGHT_MIN=-500, z=1234.567 => decoded in [1234.566, 1234.568]
		let (hi, lo, frac) = encode_height(1234.567).unwrap();
		let back = decode_height(hi, lo, frac);
		assert!((1234.566..=1234.568).contains(&back));
	}

	#[test]
	fn test_height_out_of_range() {
		assert!(matches!(
			encode_height(HEIGHT_MIN - 0.001),
			Err(StoreError::HeightOutOfRange { .. })
		));
		assert!(matches!(
			encode_height(HEIGHT_MAX + 0.001),
			Err(StoreError::HeightOutOfRange { .. })
		));
		assert!(encode_height(HEIGHT_MIN).is_ok());
		assert!(encode_height(HEIGHT_MAX).is_ok());
	}

	#[test]
	fn test_local_offset_exact() {
		// Millimeter offsets survive exactly for any grid size <= 65.535.
		let tile_origin = 40;
		for mm in [0u16, 1, 999, 10_000, 65_535] {
			let world = tile_origin as f64 + mm as f64 / 1000.0;
			assert_eq!(local_offset_mm(world, tile_origin), mm);
		}
	}

	#[test]
	fn test_mandatory_only_round_trip() {
		let flags = AttributeSchema::none();
		let mut buf = Vec::new();
		encode_point(
			&mut buf,
			123,
			456,
			12.345,
			&PointAttributes::default(),
			&flags,
			ColorDepth::Bits16,
		)
		.unwrap();
		assert_eq!(buf.len(), record_size(&flags, ColorDepth::Bits16));

		let point = decode_point(&mut Cursor::new(buf), &flags, ColorDepth::Bits16).unwrap();
		assert_eq!(point.ix, 123);
		assert_eq!(point.iy, 456);
		assert!((point.z - 12.345).abs() <= 0.001);
		assert!(point.color.is_none());
		assert!(point.intensity.is_none());
	}

	#[test]
	fn test_full_schema_round_trip_16_bit() {
		let flags = AttributeSchema::all();
		let attrs = PointAttributes {
			color: Some([65_000, 300, 7]),
			gps_time: Some(432_000.5),
			user_data: Some(42),
			intensity: Some(1234),
			source_id: Some(77),
			nir: Some(513),
			return_number: Some(2),
			number_of_returns: Some(3),
		};

		let mut buf = Vec::new();
		encode_point(&mut buf, 1, 2, 0.0, &attrs, &flags, ColorDepth::Bits16).unwrap();
		assert_eq!(buf.len(), record_size(&flags, ColorDepth::Bits16));

		let point = decode_point(&mut Cursor::new(buf), &flags, ColorDepth::Bits16).unwrap();
		assert_eq!(point.color, Some([65_000, 300, 7]));
		assert_eq!(point.user_data, Some(42));
		assert_eq!(point.intensity, Some(1234));
		assert_eq!(point.source_id, Some(77));
		assert_eq!(point.nir, Some(513));
		assert_eq!(point.return_number, Some(2));
		assert_eq!(point.number_of_returns, Some(3));
		assert_eq!(point.gps, Some(GpsTime::from_seconds_of_week(432_000.5)));
	}

	#[test]
	fn test_color_down_shift_at_8_bit_depth() {
		let flags = AttributeSchema {
			color: true,
			..AttributeSchema::none()
		};
		let attrs = PointAttributes {
			color: Some([65_535, 256, 255]),
			..PointAttributes::default()
		};

		let mut buf = Vec::new();
		encode_point(&mut buf, 0, 0, 0.0, &attrs, &flags, ColorDepth::Bits8).unwrap();
		let point = decode_point(&mut Cursor::new(buf), &flags, ColorDepth::Bits8).unwrap();
		// 16-bit samples are right-shifted by 8 and clamped to 255.
		assert_eq!(point.color, Some([255, 1, 0]));
	}

	#[test]
	fn test_gps_time_packing() {
		// Day 5, hour 2, 30.25 seconds into the hour.
		let sow = 5.0 * 86_400.0 + 2.0 * 3_600.0 + 30.25;
		let gps = GpsTime::from_seconds_of_week(sow);
		assert_eq!(gps.packed, (5 << 3) | 2);
		assert_eq!(gps.counter, 30_250_000 & 0xFF_FF_FF);
	}

	#[test]
	fn test_decode_is_schema_driven_not_content_driven() {
		// The same bytes decode differently under different flags; the
		// reader must follow the flags it is given.
		let flags_a = AttributeSchema {
			intensity: true,
			..AttributeSchema::none()
		};
		let attrs = PointAttributes {
			intensity: Some(513),
			..PointAttributes::default()
		};
		let mut buf = Vec::new();
		encode_point(&mut buf, 9, 9, 1.0, &attrs, &flags_a, ColorDepth::Bits16).unwrap();

		let narrow =
			decode_point(&mut Cursor::new(&buf[..7]), &AttributeSchema::none(), ColorDepth::Bits16)
				.unwrap();
		assert!(narrow.intensity.is_none());

		let full = decode_point(&mut Cursor::new(&buf[..]), &flags_a, ColorDepth::Bits16).unwrap();
		assert_eq!(full.intensity, Some(513));
	}
}
