//! Capacity unit conversions used by the limit patches and the analyzer.

pub const SECTOR_SIZE: u64 = 512;
pub const BYTES_PER_TB: u64 = 1 << 40;

/// Stock limit, 2 TB in bytes.
pub const ORIGINAL_BYTES_LIMIT: u64 = 2_199_023_255_552;
/// Stock limit, 2 TB in 512-byte sectors.
pub const ORIGINAL_SECTORS_LIMIT: u64 = 4_294_967_296;

pub const DEFAULT_TARGET_TB: u64 = 32;
pub const ORIGINAL_LIMIT_TB: u64 = 2;

/// `None` on overflow.
pub fn tb_to_bytes(tb: u64) -> Option<u64> {
    tb.checked_mul(BYTES_PER_TB)
}

pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes / SECTOR_SIZE
}

pub fn bytes_to_tb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_TB as f64
}

pub fn sectors_to_tb(sectors: u64) -> f64 {
    sectors as f64 * SECTOR_SIZE as f64 / BYTES_PER_TB as f64
}

/// New bytes and sectors limits for a `tb` terabyte ceiling.
pub fn limits_for_tb(tb: u64) -> Option<(u64, u64)> {
    let bytes = tb_to_bytes(tb)?;
    Some((bytes, bytes_to_sectors(bytes)))
}

/// Parses `1234`, `0x4d2` or `0X4D2`.
pub fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim().replace('_', "");
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
