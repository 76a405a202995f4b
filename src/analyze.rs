use crate::capacity::{bytes_to_tb, sectors_to_tb, ORIGINAL_BYTES_LIMIT, ORIGINAL_SECTORS_LIMIT};
use crate::error::*;
use crate::offsets::OffsetTable;
use crate::patch::read_at;
use log::debug;
use snafu::{ensure, ResultExt};
use std::fmt;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtectionMode {
    NoRedundancy,
    SelfMirrored,
    DualRedundancy,
    Unknown(u32),
}

impl ProtectionMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ProtectionMode::NoRedundancy,
            1 => ProtectionMode::SelfMirrored,
            2 => ProtectionMode::DualRedundancy,
            other => ProtectionMode::Unknown(other),
        }
    }

    pub fn min_drives(self) -> Option<u32> {
        match self {
            ProtectionMode::NoRedundancy => Some(1),
            ProtectionMode::SelfMirrored => Some(2),
            ProtectionMode::DualRedundancy => Some(3),
            ProtectionMode::Unknown(_) => None,
        }
    }
}

impl fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionMode::NoRedundancy => f.write_str("No Redundancy"),
            ProtectionMode::SelfMirrored => f.write_str("Self-Mirrored"),
            ProtectionMode::DualRedundancy => f.write_str("Dual Redundancy"),
            ProtectionMode::Unknown(raw) => write!(f, "Unknown ({})", raw),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LimitStatus {
    Original,
    Patched,
    Unusual,
}

impl fmt::Display for LimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitStatus::Original => "Original 2TB limits (not patched)",
            LimitStatus::Patched => "Patched limits detected",
            LimitStatus::Unusual => "Unusual limit values",
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct FirmwareReport {
    pub protection_mode: ProtectionMode,
    pub bytes_limit: u64,
    pub sectors_limit: u64,
    pub large_pack_mode: u64,
    pub led_management: u64,
    pub host_view: u64,
}

impl FirmwareReport {
    pub fn limit_status(&self) -> LimitStatus {
        if self.bytes_limit == ORIGINAL_BYTES_LIMIT
            && self.sectors_limit == ORIGINAL_SECTORS_LIMIT
        {
            LimitStatus::Original
        } else if self.bytes_limit > ORIGINAL_BYTES_LIMIT {
            LimitStatus::Patched
        } else {
            LimitStatus::Unusual
        }
    }
}

fn enabled(flag: u64) -> &'static str {
    if flag != 0 {
        "Enabled"
    } else {
        "Disabled"
    }
}

/// Reads every field the report needs through one handle.
struct FieldReader<'a> {
    table: &'a OffsetTable,
    path: &'a Path,
    file: File,
}

impl<'a> FieldReader<'a> {
    fn field(&mut self, name: &str) -> Result<u64> {
        let entry = self.table.entry(name).ok_or_else(|| Error::UnknownName {
            name: name.to_string(),
        })?;
        let value = read_at(&mut self.file, self.path, entry.offset, entry.width)?;
        debug!("{} @ 0x{:x} = 0x{:x}", entry.name, entry.offset, value);
        Ok(value)
    }
}

pub fn analyze(table: &OffsetTable, path: &Path) -> Result<FirmwareReport> {
    ensure!(path.is_file(), FileNotFound { path });
    let file = File::open(path).context(ReadFailed { path, offset: 0u64 })?;
    let mut reader = FieldReader { table, path, file };

    let protection = reader.field(OffsetTable::PROTECTION_MODE)?;
    Ok(FirmwareReport {
        protection_mode: ProtectionMode::from_raw(protection as u32),
        bytes_limit: reader.field(OffsetTable::BYTES_LIMIT)?,
        sectors_limit: reader.field(OffsetTable::SECTORS_LIMIT)?,
        large_pack_mode: reader.field(OffsetTable::LARGE_PACK_MODE)?,
        led_management: reader.field(OffsetTable::MANAGE_CAPACITY_LEDS)?,
        host_view: reader.field(OffsetTable::SHOW_CAPACITY_HOST_VIEW)?,
    })
}

/// Human-readable report, as printed by the `analyze` command.
pub fn write_report<W: Write>(
    out: &mut W,
    table: &OffsetTable,
    report: &FirmwareReport,
) -> std::io::Result<()> {
    writeln!(out, "Configuration Analysis:")?;
    writeln!(out, "{}", "-".repeat(30))?;
    let raw_mode = match report.protection_mode {
        ProtectionMode::NoRedundancy => 0,
        ProtectionMode::SelfMirrored => 1,
        ProtectionMode::DualRedundancy => 2,
        ProtectionMode::Unknown(raw) => raw,
    };
    writeln!(out, "Protection Mode: {} (value: {})", report.protection_mode, raw_mode)?;
    if let Some(drives) = report.protection_mode.min_drives() {
        writeln!(out, "  Minimum drives:      {}", drives)?;
    }

    writeln!(out)?;
    writeln!(out, "Capacity Limits:")?;
    writeln!(
        out,
        "  Bytes-based limit:   {:.1} TB ({} bytes)",
        bytes_to_tb(report.bytes_limit),
        report.bytes_limit
    )?;
    writeln!(
        out,
        "  Sectors-based limit: {:.1} TB ({} sectors)",
        sectors_to_tb(report.sectors_limit),
        report.sectors_limit
    )?;
    writeln!(out, "  Status: {}", report.limit_status())?;

    writeln!(out)?;
    writeln!(out, "Configuration Flags:")?;
    writeln!(
        out,
        "  Large Pack Mode:     {} ({})",
        enabled(report.large_pack_mode),
        report.large_pack_mode
    )?;
    writeln!(out, "  LED Management:      {}", report.led_management)?;
    writeln!(
        out,
        "  Host Capacity View:  {} ({})",
        enabled(report.host_view),
        report.host_view
    )?;

    writeln!(out)?;
    writeln!(out, "Memory Locations:")?;
    for entry in &table.entries {
        writeln!(out, "  {:<24} 0x{:08x}", entry.name, entry.offset)?;
    }
    Ok(())
}
