use crate::error::{WalError, WalResult};

/// Null sentinel for 32-bit integer columns.
pub const INT_NULL: i32 = i32::MIN;
/// Null sentinel for 64-bit integer, date and timestamp columns.
pub const LONG_NULL: i64 = i64::MIN;
/// Null key for symbol columns.
pub const SYMBOL_NULL: i32 = -1;
/// Null sentinels for geo-hash columns, one per storage width.
pub const GEO_BYTE_NULL: i8 = -1;
pub const GEO_SHORT_NULL: i16 = -1;
pub const GEO_INT_NULL: i32 = -1;
pub const GEO_LONG_NULL: i64 = -1;
/// Null sentinel for 128-bit integers: `(hi, lo)`.
pub const LONG128_NULL_HI: i64 = i64::MIN;
pub const LONG128_NULL_LO: i64 = 0;
/// Length header marking a null var-length string value.
pub const STR_HEADER_NULL: i32 = -1;
/// Length header marking a null var-length binary value.
pub const BIN_HEADER_NULL: i64 = -1;

/// Geo-hash base-32 alphabet.
const GEO_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Value type of a table column.
///
/// The discriminant doubles as the on-disk type tag; metadata snapshots store
/// the negated tag for dropped columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ColumnType {
    Bool = 1,
    Byte = 2,
    Short = 3,
    Char = 4,
    Int = 5,
    Long = 6,
    Date = 7,
    Timestamp = 8,
    Float = 9,
    Double = 10,
    String = 11,
    Symbol = 12,
    Long256 = 13,
    GeoByte = 14,
    GeoShort = 15,
    GeoInt = 16,
    GeoLong = 17,
    Binary = 18,
    Long128 = 19,
}

impl ColumnType {
    /// Decodes an on-disk type tag; dropped columns store the negated tag.
    pub fn from_tag(tag: i32) -> WalResult<Self> {
        use ColumnType::*;
        Ok(match tag {
            1 => Bool,
            2 => Byte,
            3 => Short,
            4 => Char,
            5 => Int,
            6 => Long,
            7 => Date,
            8 => Timestamp,
            9 => Float,
            10 => Double,
            11 => String,
            12 => Symbol,
            13 => Long256,
            14 => GeoByte,
            15 => GeoShort,
            16 => GeoInt,
            17 => GeoLong,
            18 => Binary,
            19 => Long128,
            other => return Err(WalError::InvalidColumnType(other)),
        })
    }

    #[inline]
    pub const fn tag(self) -> i32 {
        self as i32
    }

    /// Var-length types store payload in the primary file and 8-byte end
    /// offsets in the secondary file.
    #[inline]
    pub const fn is_var_len(self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Binary)
    }

    #[inline]
    pub const fn is_symbol(self) -> bool {
        matches!(self, ColumnType::Symbol)
    }

    #[inline]
    pub const fn is_geo(self) -> bool {
        matches!(
            self,
            ColumnType::GeoByte | ColumnType::GeoShort | ColumnType::GeoInt | ColumnType::GeoLong
        )
    }

    /// Bytes per value in the primary file; `None` for var-length types.
    ///
    /// The designated timestamp column is special-cased by the writer and
    /// stores 16 bytes per row regardless of this value.
    pub const fn fixed_size(self) -> Option<u64> {
        use ColumnType::*;
        match self {
            Bool | Byte | GeoByte => Some(1),
            Short | Char | GeoShort => Some(2),
            Int | Float | Symbol | GeoInt => Some(4),
            Long | Date | Timestamp | Double | GeoLong => Some(8),
            Long128 => Some(16),
            Long256 => Some(32),
            String | Binary => None,
        }
    }

    /// Valid geo-hash precision range for this kind, in bits.
    pub const fn geo_bits_range(self) -> Option<(u8, u8)> {
        match self {
            ColumnType::GeoByte => Some((1, 7)),
            ColumnType::GeoShort => Some((8, 15)),
            ColumnType::GeoInt => Some((16, 31)),
            ColumnType::GeoLong => Some((32, 60)),
            _ => None,
        }
    }

    /// The geo-hash kind whose storage width fits the given precision.
    pub fn geo_for_bits(bits: u8) -> WalResult<Self> {
        match bits {
            1..=7 => Ok(ColumnType::GeoByte),
            8..=15 => Ok(ColumnType::GeoShort),
            16..=31 => Ok(ColumnType::GeoInt),
            32..=60 => Ok(ColumnType::GeoLong),
            _ => Err(WalError::InvalidGeoBits {
                kind: "geohash",
                bits,
            }),
        }
    }

    pub const fn name(self) -> &'static str {
        use ColumnType::*;
        match self {
            Bool => "boolean",
            Byte => "byte",
            Short => "short",
            Char => "char",
            Int => "int",
            Long => "long",
            Date => "date",
            Timestamp => "timestamp",
            Float => "float",
            Double => "double",
            String => "string",
            Symbol => "symbol",
            Long256 => "long256",
            GeoByte => "geobyte",
            GeoShort => "geoshort",
            GeoInt => "geoint",
            GeoLong => "geolong",
            Binary => "binary",
            Long128 => "long128",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encodes WGS84 coordinates into a geo-hash of the given precision.
///
/// Standard binary geo-hash: alternating longitude/latitude range bisection,
/// longitude first, most significant bit first.
pub fn geohash_from_coordinates(lat: f64, lon: f64, bits: u8) -> WalResult<i64> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(WalError::InvalidValue {
            what: "coordinates",
            value: format!("({lat}, {lon})"),
        });
    }
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut hash = 0_i64;
    for i in 0..bits {
        hash <<= 1;
        if i % 2 == 0 {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                hash |= 1;
                lon_lo = mid;
            } else {
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                hash |= 1;
                lat_lo = mid;
            } else {
                lat_hi = mid;
            }
        }
    }
    Ok(hash)
}

/// Parses a base-32 geo-hash string and truncates it to the given precision.
///
/// The string must carry at least `ceil(bits / 5)` characters; excess
/// precision is discarded from the least significant end.
pub fn geohash_from_str(hash: &str, bits: u8) -> WalResult<i64> {
    let chars_needed = (bits as usize).div_ceil(5);
    let bytes = hash.as_bytes();
    if bytes.len() < chars_needed {
        return Err(WalError::InvalidValue {
            what: "geohash",
            value: hash.to_string(),
        });
    }
    let mut value = 0_i64;
    for &b in &bytes[..chars_needed] {
        let digit = GEO_ALPHABET
            .iter()
            .position(|&a| a == b.to_ascii_lowercase())
            .ok_or_else(|| WalError::InvalidValue {
                what: "geohash",
                value: hash.to_string(),
            })?;
        value = (value << 5) | digit as i64;
    }
    Ok(value >> (chars_needed as u32 * 5 - bits as u32))
}

/// Parses a `0x`-prefixed (or bare) hex string into four little-endian
/// 64-bit limbs of a 256-bit integer.
pub fn long256_from_hex(hex: &str) -> WalResult<[i64; 4]> {
    let digits = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")).unwrap_or(hex);
    if digits.is_empty() || digits.len() > 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(WalError::InvalidValue {
            what: "long256",
            value: hex.to_string(),
        });
    }
    let mut limbs = [0_i64; 4];
    let bytes = digits.as_bytes();
    let mut end = bytes.len();
    for limb in limbs.iter_mut() {
        if end == 0 {
            break;
        }
        let start = end.saturating_sub(16);
        let chunk = std::str::from_utf8(&bytes[start..end]).expect("ascii hex");
        *limb = u64::from_str_radix(chunk, 16).expect("validated hex") as i64;
        end = start;
    }
    Ok(limbs)
}
