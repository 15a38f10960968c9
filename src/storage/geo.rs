//! Geohash encoding for geo sets.
//!
//! Coordinates are packed into a 52-bit interleaved geohash (26 bits per
//! axis) that is stored as the member's sorted-set score. The latitude range
//! is clipped to the Web Mercator limits so scores line up with the usual
//! Redis encoding.

pub const LONGITUDE_MIN: f64 = -180.0;
pub const LONGITUDE_MAX: f64 = 180.0;
pub const LATITUDE_MIN: f64 = -85.051_128_78;
pub const LATITUDE_MAX: f64 = 85.051_128_78;

/// Bits per axis.
const STEP: u32 = 26;

/// Mean earth radius used by the haversine formula, in meters.
const EARTH_RADIUS_METERS: f64 = 6_372_797.560_856;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Distance units accepted by `GEODIST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Meters,
    Kilometers,
    Feet,
    Miles,
}

impl Unit {
    pub fn parse(s: &[u8]) -> Option<Self> {
        match s.to_ascii_lowercase().as_slice() {
            b"m" => Some(Unit::Meters),
            b"km" => Some(Unit::Kilometers),
            b"ft" => Some(Unit::Feet),
            b"mi" => Some(Unit::Miles),
            _ => None,
        }
    }

    /// Meters per unit.
    pub fn factor(self) -> f64 {
        match self {
            Unit::Meters => 1.0,
            Unit::Kilometers => 1000.0,
            Unit::Feet => 0.3048,
            Unit::Miles => 1609.34,
        }
    }
}

/// Which coordinate failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateError {
    Longitude,
    Latitude,
}

pub fn validate(longitude: f64, latitude: f64) -> Result<(), CoordinateError> {
    if !(LONGITUDE_MIN..=LONGITUDE_MAX).contains(&longitude) {
        return Err(CoordinateError::Longitude);
    }
    if !(LATITUDE_MIN..=LATITUDE_MAX).contains(&latitude) {
        return Err(CoordinateError::Latitude);
    }
    Ok(())
}

/// Spreads the low 32 bits of `v` into the even bit positions of a u64.
fn spread(v: u32) -> u64 {
    let mut out = 0u64;
    for i in 0..32 {
        out |= (((v >> i) & 1) as u64) << (2 * i);
    }
    out
}

/// Inverse of [`spread`]: collects the even bit positions of `v`.
fn squash(v: u64) -> u32 {
    let mut out = 0u32;
    for i in 0..32 {
        out |= (((v >> (2 * i)) & 1) as u32) << i;
    }
    out
}

fn encode_with_ranges(
    longitude: f64,
    latitude: f64,
    (lon_min, lon_max): (f64, f64),
    (lat_min, lat_max): (f64, f64),
) -> u64 {
    let scale = (1u64 << STEP) as f64;
    let lat_offset = ((latitude - lat_min) / (lat_max - lat_min) * scale) as u64;
    let lon_offset = ((longitude - lon_min) / (lon_max - lon_min) * scale) as u64;
    let max = (1u64 << STEP) - 1;

    // latitude on even bits, longitude on odd bits
    spread(lat_offset.min(max) as u32) | (spread(lon_offset.min(max) as u32) << 1)
}

/// Encodes a coordinate pair as a 52-bit geohash.
pub fn encode(longitude: f64, latitude: f64) -> u64 {
    encode_with_ranges(
        longitude,
        latitude,
        (LONGITUDE_MIN, LONGITUDE_MAX),
        (LATITUDE_MIN, LATITUDE_MAX),
    )
}

/// Decodes a geohash to the center of its cell as `(longitude, latitude)`.
pub fn decode(hash: u64) -> (f64, f64) {
    let lat_cell = squash(hash) as f64;
    let lon_cell = squash(hash >> 1) as f64;
    let scale = (1u64 << STEP) as f64;

    let lat_step = (LATITUDE_MAX - LATITUDE_MIN) / scale;
    let lon_step = (LONGITUDE_MAX - LONGITUDE_MIN) / scale;

    let latitude = LATITUDE_MIN + (lat_cell + 0.5) * lat_step;
    let longitude = LONGITUDE_MIN + (lon_cell + 0.5) * lon_step;

    (
        longitude.clamp(LONGITUDE_MIN, LONGITUDE_MAX),
        latitude.clamp(LATITUDE_MIN, LATITUDE_MAX),
    )
}

/// Great-circle distance between two points in meters.
pub fn distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let u = ((lat2r - lat1r) / 2.0).sin();
    let v = ((lon2 - lon1).to_radians() / 2.0).sin();
    let a = u * u + lat1r.cos() * lat2r.cos() * v * v;
    2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
}

/// Standard 11-character base32 geohash string for a stored score.
pub fn to_geohash_string(hash: u64) -> String {
    let (longitude, latitude) = decode(hash);
    // the textual geohash uses the full [-90, 90] latitude range
    let bits = encode_with_ranges(
        longitude,
        latitude,
        (LONGITUDE_MIN, LONGITUDE_MAX),
        (-90.0, 90.0),
    );

    (0..11)
        .map(|i| {
            let idx = if i == 10 {
                0
            } else {
                ((bits >> (52 - (i + 1) * 5)) & 0x1f) as usize
            };
            BASE32[idx] as char
        })
        .collect()
}

/// Rounds a distance to four decimals, as returned by `GEODIST`.
pub fn round_distance(meters: f64, unit: Unit) -> f64 {
    (meters / unit.factor() * 10_000.0).round() / 10_000.0
}
