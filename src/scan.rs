//! Searches over a firmware image: known 2TB constants, the neighbourhood of
//! the ">2TB drive" message, and printable strings matching capacity keywords.

use crate::capacity::{ORIGINAL_BYTES_LIMIT, ORIGINAL_SECTORS_LIMIT};
use crate::error::*;
use crate::extract::find;
use log::debug;
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::Path;

pub const TWO_TB_MESSAGE: &str = "DPM::discoverDis: >2TB drive: Setting dislocation to 2TB";
pub const MESSAGE_WINDOW: usize = 5000;
pub const MIN_STRING_LEN: usize = 4;
pub const MAX_HITS_PER_KEYWORD: usize = 5;

pub const TWO_TB_CONSTANTS: &[(&str, u64)] = &[
    ("2TB_sectors", ORIGINAL_SECTORS_LIMIT),
    ("2TB_binary", ORIGINAL_BYTES_LIMIT),
    ("2TB_decimal", 2_000_000_000_000),
];

/// Case-insensitive keywords for capacity-related strings.
pub const CAPACITY_KEYWORDS: &[&str] = &[
    "TB",
    "GB",
    "limit",
    "capacity",
    "exceed",
    "too large",
    "drive size",
];

#[derive(Clone, PartialEq, Debug)]
pub struct ConstantHit {
    pub name: &'static str,
    pub value: u64,
    pub offset: usize,
}

#[derive(Clone, PartialEq, Debug)]
pub struct NearbyHit {
    pub value: u64,
    pub offset: usize,
    /// Signed distance from the start of the message.
    pub distance: i64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct StringHit {
    pub keyword: &'static str,
    pub offset: usize,
    pub text: String,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct ScanReport {
    pub constants: Vec<ConstantHit>,
    pub message_offset: Option<usize>,
    pub nearby: Vec<NearbyHit>,
    pub strings: Vec<StringHit>,
}

/// Little-endian encoding used when searching: 4 bytes if it fits, 8 otherwise.
fn pattern_for(value: u64) -> Vec<u8> {
    if value > u64::from(u32::MAX) {
        value.to_le_bytes().to_vec()
    } else {
        (value as u32).to_le_bytes().to_vec()
    }
}

/// First occurrence of each 2TB constant.
pub fn find_constants(data: &[u8]) -> Vec<ConstantHit> {
    TWO_TB_CONSTANTS
        .iter()
        .filter_map(|&(name, value)| {
            find(data, &pattern_for(value)).map(|offset| ConstantHit { name, value, offset })
        })
        .collect()
}

/// Looks for the binary 2TB constants within `MESSAGE_WINDOW` bytes of the
/// ">2TB drive" message.
pub fn search_near_message(data: &[u8]) -> (Option<usize>, Vec<NearbyHit>) {
    let message_offset = match find(data, TWO_TB_MESSAGE.as_bytes()) {
        Some(offset) => offset,
        None => return (None, Vec::new()),
    };
    let start = message_offset.saturating_sub(MESSAGE_WINDOW);
    let end = (message_offset + MESSAGE_WINDOW).min(data.len());
    let window = &data[start..end];

    let hits = [ORIGINAL_SECTORS_LIMIT, ORIGINAL_BYTES_LIMIT]
        .iter()
        .filter_map(|&value| {
            find(window, &value.to_le_bytes()).map(|pos| {
                let offset = start + pos;
                NearbyHit {
                    value,
                    offset,
                    distance: offset as i64 - message_offset as i64,
                }
            })
        })
        .collect();
    (Some(message_offset), hits)
}

/// Printable ASCII runs of at least `min_len` bytes, like `strings(1)`.
pub fn printable_strings(data: &[u8], min_len: usize) -> Vec<(usize, String)> {
    let mut found = Vec::new();
    let mut start = None;
    for (index, &byte) in data.iter().chain(std::iter::once(&0u8)).enumerate() {
        let printable = byte == b'\t' || (0x20..0x7f).contains(&byte);
        match (printable, start) {
            (true, None) => start = Some(index),
            (false, Some(begin)) => {
                if index - begin >= min_len {
                    found.push((begin, String::from_utf8_lossy(&data[begin..index]).into_owned()));
                }
                start = None;
            }
            _ => {}
        }
    }
    found
}

pub fn search_strings(data: &[u8], keywords: &[&'static str]) -> Vec<StringHit> {
    let strings = printable_strings(data, MIN_STRING_LEN);
    let mut hits = Vec::new();
    for &keyword in keywords {
        let needle = keyword.to_ascii_lowercase();
        hits.extend(
            strings
                .iter()
                .filter(|(_, text)| text.to_ascii_lowercase().contains(&needle))
                .take(MAX_HITS_PER_KEYWORD)
                .map(|(offset, text)| StringHit {
                    keyword,
                    offset: *offset,
                    text: text.trim().to_string(),
                }),
        );
    }
    hits
}

pub fn scan(path: &Path) -> Result<ScanReport> {
    ensure!(path.is_file(), FileNotFound { path });
    let data = fs::read(path).context(ReadFailed { path, offset: 0u64 })?;
    debug!("Scanning {} bytes of {}", data.len(), path.display());

    let (message_offset, nearby) = search_near_message(&data);
    Ok(ScanReport {
        constants: find_constants(&data),
        message_offset,
        nearby,
        strings: search_strings(&data, CAPACITY_KEYWORDS),
    })
}
