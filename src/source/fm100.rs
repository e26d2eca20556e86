//! E-SURFMAR Format #100 (S-AWS) payload decoding.
//!
//! Shipborne automated weather stations compress one synoptic observation
//! into a 30 byte message (235 bits of fields plus padding) for transmission
//! over Iridium short-burst data. Fields are packed MSB-first at fixed bit
//! widths in a fixed order, each with a linear `physical = raw * scale +
//! offset` mapping and, for measurement fields, a missing-data pattern of
//! all bits set for the field's width.
//!
//! Unit conversions are applied after the linear mapping: pressures are
//! encoded in Pascal and reported in hectopascal, temperatures in Kelvin and
//! reported in degrees Celsius, and true wind speed additionally derives a
//! knots value.
//!
//! The trailing four bits flag the presence of optional visual, wave, ice
//! and "other" observation blocks. Those blocks are not decoded, only their
//! flags are kept.
//!
//! - [E-SURFMAR data format documentation][1]
//!
//! [1]: https://doi.org/10.5281/zenodo.1324186

use chrono::{
    DateTime,
    TimeZone,
    Utc,
};
use serde::Serialize;

use crate::source::bits::{
    BitCursor,
    BufferExhausted,
};

/// Leading format identifier of a Format #100 payload.
pub const FORMAT_ID: u8 = 100;

/// Fixed payload size in bytes.
pub const PAYLOAD_SIZE: usize = 30;

/// Layout revision implemented by [`decode`], stored with every decoded
/// record so reprocessed data can be told apart from live-decoded data.
pub const DECODER_VERSION: &str = "E-SURFMAR Format #100 v1.9";

const KNOTS_PER_METER_PER_SECOND: f64 = 1.94384;
const KELVIN_OFFSET: f64 = 273.15;

/// Format #100 decode error
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload too short: {length} bytes, expected at least {PAYLOAD_SIZE}")]
    PayloadTooShort { length: usize },

    #[error("truncated payload: {0}")]
    Bits(#[from] BufferExhausted),

    #[error("unsupported format identifier: {found}, expected {FORMAT_ID}")]
    UnsupportedFormat { found: u8 },
}

/// One decoded station observation.
///
/// Every measurement field is optional: its encoding reserves the all-bits-set
/// pattern for missing data, which decodes to `None` here. A field is only
/// ever `Some` when the station actually reported it.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Observation {
    /// Format identifier as read from the payload. Always [`FORMAT_ID`].
    pub format_version: u8,

    /// Time of observation as encoded by the station, or the fallback time
    /// if the encoded calendar fields were invalid.
    pub observation_time: DateTime<Utc>,

    pub callsign_encrypted: bool,

    /// degrees
    pub course_over_ground: Option<f64>,
    /// m/s
    pub speed_over_ground: Option<f64>,
    /// degrees
    pub heading: Option<f64>,
    /// m
    pub draft: Option<f64>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    /// Station-level pressure, hPa
    pub pressure: Option<f64>,
    /// Pressure reduced to mean sea level, hPa
    pub pressure_msl: Option<f64>,
    /// 3 hour pressure tendency, hPa
    pub pressure_tendency: Option<f64>,
    /// WMO code table 0200, 0 to 8
    pub tendency_characteristic: Option<u8>,

    /// degrees
    pub wind_direction: Option<f64>,
    /// m/s
    pub wind_speed: Option<f64>,
    /// Derived from [`Self::wind_speed`].
    pub wind_speed_knots: Option<f64>,
    /// degrees, relative to the bow
    pub relative_wind_direction: Option<f64>,
    /// m/s
    pub relative_wind_speed: Option<f64>,
    /// m/s
    pub gust_speed: Option<f64>,
    /// degrees
    pub gust_direction: Option<f64>,

    /// °C
    pub air_temperature: Option<f64>,
    /// %
    pub relative_humidity: Option<f64>,
    /// °C
    pub sea_surface_temperature: Option<f64>,

    /// V
    pub battery_voltage: Option<f64>,
    /// °C
    pub processor_temperature: Option<f64>,
    /// m
    pub gps_antenna_height: Option<f64>,

    pub has_visual_block: bool,
    pub has_wave_block: bool,
    pub has_ice_block: bool,
    pub has_other_block: bool,
}

/// Decodes one Format #100 payload.
///
/// `fallback_time` is used as the observation time when the encoded calendar
/// fields don't form a valid UTC instant; without a fallback the current time
/// is used. Extra bytes after the 30 byte layout are ignored.
pub fn decode(
    payload: &[u8],
    fallback_time: Option<DateTime<Utc>>,
) -> Result<Observation, DecodeError> {
    if payload.len() < PAYLOAD_SIZE {
        return Err(DecodeError::PayloadTooShort {
            length: payload.len(),
        });
    }

    let mut cursor = BitCursor::new(payload);

    let format_version = cursor.read_unsigned(8)? as u8;
    if format_version != FORMAT_ID {
        return Err(DecodeError::UnsupportedFormat {
            found: format_version,
        });
    }

    // a cleared bit means the callsign in the station registry is encrypted
    let callsign_encrypted = cursor.read_unsigned(1)? == 0;

    let course_over_ground = unsigned_field(&mut cursor, 7, 5.0, 0.0)?;
    let speed_over_ground = unsigned_field(&mut cursor, 6, 0.5, 0.0)?;
    let heading = unsigned_field(&mut cursor, 7, 5.0, 0.0)?;
    let draft = signed_field(&mut cursor, 5, 1.0, -10.0)?;

    // calendar fields carry no missing-data pattern
    let year = cursor.read_unsigned(7)? as i32 + 2000;
    let month = cursor.read_unsigned(4)? as u32;
    let day = cursor.read_unsigned(6)? as u32;
    let hour = cursor.read_unsigned(5)? as u32;
    let minute = cursor.read_unsigned(6)? as u32;

    let observation_time = match Utc
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
    {
        Some(time) => time,
        None => {
            tracing::debug!(
                year,
                month,
                day,
                hour,
                minute,
                "invalid observation time, falling back"
            );
            fallback_time.unwrap_or_else(Utc::now)
        }
    };

    let latitude = signed_field(&mut cursor, 15, 0.01, -90.0)?;
    let longitude = signed_field(&mut cursor, 16, 0.01, -180.0)?;

    let pressure = unsigned_field(&mut cursor, 11, 10.0, 85000.0)?.map(pascal_to_hectopascal);
    let pressure_msl = unsigned_field(&mut cursor, 11, 10.0, 85000.0)?.map(pascal_to_hectopascal);
    let pressure_tendency = signed_field(&mut cursor, 10, 10.0, -5000.0)?.map(pascal_to_hectopascal);
    let tendency_characteristic = unsigned_field(&mut cursor, 4, 1.0, 0.0)?.map(|code| code as u8);

    let wind_direction = unsigned_field(&mut cursor, 7, 5.0, 0.0)?;
    let wind_speed = unsigned_field(&mut cursor, 10, 0.1, 0.0)?;
    let wind_speed_knots = wind_speed.map(|speed| speed * KNOTS_PER_METER_PER_SECOND);
    let relative_wind_direction = unsigned_field(&mut cursor, 7, 5.0, 0.0)?;
    let relative_wind_speed = unsigned_field(&mut cursor, 8, 0.5, 0.0)?;
    let gust_speed = unsigned_field(&mut cursor, 8, 0.5, 0.0)?;
    let gust_direction = unsigned_field(&mut cursor, 7, 5.0, 0.0)?;

    let air_temperature = unsigned_field(&mut cursor, 10, 0.1, 223.2)?.map(kelvin_to_celsius);
    let relative_humidity = unsigned_field(&mut cursor, 10, 0.1, 0.0)?;
    let sea_surface_temperature =
        unsigned_field(&mut cursor, 12, 0.01, 268.15)?.map(kelvin_to_celsius);

    let battery_voltage = unsigned_field(&mut cursor, 7, 0.2, 5.0)?;
    let processor_temperature = unsigned_field(&mut cursor, 8, 0.5, 233.15)?.map(kelvin_to_celsius);
    let gps_antenna_height = signed_field(&mut cursor, 8, 1.0, -50.0)?;

    let has_visual_block = cursor.read_unsigned(1)? != 0;
    let has_wave_block = cursor.read_unsigned(1)? != 0;
    let has_ice_block = cursor.read_unsigned(1)? != 0;
    let has_other_block = cursor.read_unsigned(1)? != 0;

    Ok(Observation {
        format_version,
        observation_time,
        callsign_encrypted,
        course_over_ground,
        speed_over_ground,
        heading,
        draft,
        latitude,
        longitude,
        pressure,
        pressure_msl,
        pressure_tendency,
        tendency_characteristic,
        wind_direction,
        wind_speed,
        wind_speed_knots,
        relative_wind_direction,
        relative_wind_speed,
        gust_speed,
        gust_direction,
        air_temperature,
        relative_humidity,
        sea_surface_temperature,
        battery_voltage,
        processor_temperature,
        gps_antenna_height,
        has_visual_block,
        has_wave_block,
        has_ice_block,
        has_other_block,
    })
}

/// All bits set for a field width, the reserved missing-data pattern.
const fn missing(count: u32) -> u64 {
    (1 << count) - 1
}

fn unsigned_field(
    cursor: &mut BitCursor,
    count: u32,
    scale: f64,
    offset: f64,
) -> Result<Option<f64>, BufferExhausted> {
    let raw = cursor.read_unsigned(count)?;
    Ok((raw != missing(count)).then(|| raw as f64 * scale + offset))
}

fn signed_field(
    cursor: &mut BitCursor,
    count: u32,
    scale: f64,
    offset: f64,
) -> Result<Option<f64>, BufferExhausted> {
    let raw = cursor.read_signed(count)?;
    // the all-bits-set missing-data pattern sign-extends to -1 at any width
    Ok((raw != -1).then(|| raw as f64 * scale + offset))
}

fn pascal_to_hectopascal(pascal: f64) -> f64 {
    pascal / 100.0
}

fn kelvin_to_celsius(kelvin: f64) -> f64 {
    kelvin - KELVIN_OFFSET
}
