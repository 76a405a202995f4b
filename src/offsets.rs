use crate::capacity::{ORIGINAL_BYTES_LIMIT, ORIGINAL_SECTORS_LIMIT};
use crate::error::*;
use hex_buffer_serde::{Hex as _, HexForm};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub const ELF_MAGIC: &[u8] = b"\x7fELF";
pub const CONFIG_BLOCK_LEN: u64 = 0x100;
pub const DEFAULT_COMPONENT_MAX_LEN: u64 = 50 * 1024 * 1024;

/// Width of an integer field, decoded little-endian.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub enum Width {
    Dword,
    Qword,
}

impl Width {
    pub fn len(self) -> usize {
        match self {
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }

    pub fn max_value(self) -> u64 {
        match self {
            Width::Dword => u64::from(u32::MAX),
            Width::Qword => u64::MAX,
        }
    }

    pub fn decode(self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf[..self.len()].copy_from_slice(&bytes[..self.len()]);
        u64::from_le_bytes(buf)
    }

    pub fn encode(self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.len()].to_vec()
    }
}

impl FromStr for Width {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "4" => Ok(Width::Dword),
            "8" => Ok(Width::Qword),
            other => Err(format!("width must be 4 or 8, got {}", other)),
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub enum Category {
    Config,
    Limits,
    Strings,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Config => "Config",
            Category::Limits => "Limits",
            Category::Strings => "Strings",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct OffsetEntry {
    pub name: String,
    pub offset: u64,
    pub width: Width,
    pub category: Category,
    pub description: String,
    /// Value shipped in the stock build, where known.
    #[serde(default)]
    pub original: Option<u64>,
}

/// Start-inclusive, end-exclusive byte range.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct OffsetRange {
    pub start: u64,
    pub end: u64,
}

impl OffsetRange {
    pub fn new(start: u64, len: u64) -> Self {
        OffsetRange {
            start,
            end: start + len,
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// A sub-image inside the firmware container.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Component {
    pub name: String,
    pub offset: u64,
    pub file_name: String,
    pub description: String,
    pub max_len: u64,
    #[serde(with = "HexForm::<Vec<u8>>", default)]
    pub magic: Vec<u8>,
}

/// Location of a known string.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Marker {
    pub name: String,
    pub offset: u64,
    pub text: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct OffsetTable {
    pub firmware_version: String,
    pub device_model: String,
    pub architecture: String,
    pub entries: Vec<OffsetEntry>,
    pub patchable: Vec<OffsetRange>,
    pub components: Vec<Component>,
    pub markers: Vec<Marker>,
}

fn entry(
    name: &str,
    offset: u64,
    width: Width,
    category: Category,
    description: &str,
    original: Option<u64>,
) -> OffsetEntry {
    OffsetEntry {
        name: name.to_string(),
        offset,
        width,
        category,
        description: description.to_string(),
        original,
    }
}

fn component(
    name: &str,
    offset: u64,
    file_name: &str,
    description: &str,
    magic: &[u8],
) -> Component {
    Component {
        name: name.to_string(),
        offset,
        file_name: file_name.to_string(),
        description: description.to_string(),
        max_len: DEFAULT_COMPONENT_MAX_LEN,
        magic: magic.to_vec(),
    }
}

fn marker(name: &str, offset: u64, text: &str) -> Marker {
    Marker {
        name: name.to_string(),
        offset,
        text: text.to_string(),
    }
}

impl OffsetTable {
    pub const PROTECTION_MODE: &'static str = "protection_mode";
    pub const MANAGE_CAPACITY_LEDS: &'static str = "manage_capacity_leds";
    pub const SHOW_CAPACITY_HOST_VIEW: &'static str = "show_capacity_host_view";
    pub const LARGE_PACK_MODE: &'static str = "large_pack_mode";
    pub const LAST_UI_CALL_TIME: &'static str = "last_ui_call_time";
    pub const BYTES_LIMIT: &'static str = "bytes_limit";
    pub const SECTORS_LIMIT: &'static str = "sectors_limit";

    /// Offsets into `secondary.elf` of the Drobo 5D3 firmware 4.2.3.
    pub fn drobo_5d3() -> Self {
        use Category::*;
        use Width::*;

        let config_base = 0x66d6f0;
        let bytes_limit = 0x65b097;
        let sectors_limit = 0x65ada8;

        OffsetTable {
            firmware_version: "4.2.3".to_string(),
            device_model: "Drobo 5D3".to_string(),
            architecture: "ARM 32-bit LSB".to_string(),
            entries: vec![
                entry(
                    Self::PROTECTION_MODE,
                    config_base,
                    Dword,
                    Config,
                    "Protection Mode Setting",
                    None,
                ),
                entry(
                    Self::MANAGE_CAPACITY_LEDS,
                    0x66d710,
                    Dword,
                    Config,
                    "LED Management Setting",
                    None,
                ),
                entry(
                    Self::SHOW_CAPACITY_HOST_VIEW,
                    0x66d730,
                    Dword,
                    Config,
                    "Host Capacity View Setting",
                    None,
                ),
                entry(
                    Self::LARGE_PACK_MODE,
                    0x66d750,
                    Dword,
                    Config,
                    "Large Pack Mode Flag",
                    None,
                ),
                entry(
                    Self::LAST_UI_CALL_TIME,
                    0x66d770,
                    Dword,
                    Config,
                    "Last UI Call Timestamp",
                    None,
                ),
                entry(
                    Self::BYTES_LIMIT,
                    bytes_limit,
                    Qword,
                    Limits,
                    "2TB Bytes Limit (Patchable)",
                    Some(ORIGINAL_BYTES_LIMIT),
                ),
                entry(
                    Self::SECTORS_LIMIT,
                    sectors_limit,
                    Qword,
                    Limits,
                    "2TB Sectors Limit (Patchable)",
                    Some(ORIGINAL_SECTORS_LIMIT),
                ),
            ],
            patchable: vec![
                OffsetRange::new(config_base, CONFIG_BLOCK_LEN),
                OffsetRange::new(bytes_limit, 8),
                OffsetRange::new(sectors_limit, 8),
            ],
            components: vec![
                component(
                    "main_vxworks_elf",
                    0x22c,
                    "main_vxworks.elf",
                    "Main VxWorks ELF binary",
                    ELF_MAGIC,
                ),
                component(
                    "secondary_elf",
                    0x303124,
                    "secondary.elf",
                    "Secondary ELF binary",
                    ELF_MAGIC,
                ),
                component(
                    "vxworks_kernel_bin",
                    0xf59bfc,
                    "vxworks_kernel.bin",
                    "VxWorks WIND kernel",
                    &[],
                ),
            ],
            markers: vec![
                marker("zmdt_tracker", 0x656d30, "zmdt = ZONE METADATA TRACKER"),
                marker(
                    "self_mirrored_zones",
                    0x656d50,
                    "Use of self-mirrored Zones is currently",
                ),
                marker("zone_manager", 0x6573c0, "zm..ZoneManager:"),
                marker("disk_pack_manager", 0x657390, "dpm.DiskPackManager:"),
                marker("region_size", 0x657690, "RegionSize"),
                marker("self_mirror_usage", 0x656d80, "usage: useSelfMirrored [on]"),
                marker("protection_mode_label", 0x66d700, "mbProtectionMode        :"),
            ],
        }
    }

    pub fn entry(&self, name: &str) -> Option<&OffsetEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|component| {
            component.name.eq_ignore_ascii_case(name)
                || component.file_name.eq_ignore_ascii_case(name)
        })
    }

    /// Resolves a symbolic name to its file offset. Entries win over components.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.entry(name)
            .map(|entry| entry.offset)
            .or_else(|| self.component(name).map(|component| component.offset))
    }

    pub fn is_patchable_offset(&self, offset: u64) -> bool {
        self.patchable.iter().any(|range| range.contains(offset))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut names = HashSet::new();
        let mut offsets = HashSet::new();
        for entry in &self.entries {
            if !names.insert(entry.name.to_ascii_lowercase()) {
                return Err(format!("duplicate entry name '{}'", entry.name));
            }
            if !offsets.insert(entry.offset) {
                return Err(format!("duplicate entry offset 0x{:x}", entry.offset));
            }
        }
        if let Some(range) = self.patchable.iter().find(|range| range.end <= range.start) {
            return Err(format!(
                "empty patchable range 0x{:x}..0x{:x}",
                range.start, range.end
            ));
        }
        // Carving relies on each component ending where the next one starts.
        if let Some(pair) = self
            .components
            .windows(2)
            .find(|pair| pair[1].offset <= pair[0].offset)
        {
            return Err(format!(
                "component {} at 0x{:x} does not follow {} at 0x{:x}",
                pair[1].name, pair[1].offset, pair[0].name, pair[0].offset
            ));
        }
        Ok(())
    }

    /// Loads a table from `.json`, or from the binary `.rbp` form otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).context(TableRead { path })?;
        let table: OffsetTable = if is_json(path) {
            serde_json::from_slice(&raw).context(TableJson { path })?
        } else {
            bincode::deserialize(&raw).context(TableBinary { path })?
        };
        if let Err(reason) = table.validate() {
            return TableInvalid { path, reason }.fail();
        }
        debug!(
            "Loaded {} entries for {} {} from {}",
            table.entries.len(),
            table.device_model,
            table.firmware_version,
            path.display()
        );
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Err(reason) = self.validate() {
            return TableInvalid { path, reason }.fail();
        }
        let coded = if is_json(path) {
            serde_json::to_vec_pretty(self).context(TableJson { path })?
        } else {
            bincode::serialize(self).context(TableBinary { path })?
        };
        fs::write(path, coded).context(TableWrite { path })
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
