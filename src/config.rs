use crate::error::Result;
use crate::offsets::OffsetTable;
use log::debug;
use std::path::{Path, PathBuf};

pub const EXTRACTED_PATH_VAR: &str = "DROBO_EXTRACTED_PATH";
pub const FIRMWARE_PATH_VAR: &str = "DROBO_FIRMWARE_PATH";
pub const DEFAULT_EXTRACTED_PATH: &str = "../extracted";
pub const DEFAULT_FIRMWARE_PATH: &str = "../firmware";

/// Where firmware files are looked up and which offset table is in use.
#[derive(Clone, PartialEq, Debug)]
pub struct Settings {
    pub extracted_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub table: Option<PathBuf>,
}

impl Settings {
    /// Built-in table unless a table file was given.
    pub fn load_table(&self) -> Result<OffsetTable> {
        match &self.table {
            Some(path) => OffsetTable::load(path),
            None => Ok(OffsetTable::drobo_5d3()),
        }
    }

    /// Absolute or existing paths are used as given; otherwise the extracted
    /// and firmware directories are tried in turn. Falls back to the name as
    /// given so the caller reports it missing.
    pub fn resolve_firmware_path(&self, name: &Path) -> PathBuf {
        if name.is_absolute() || name.exists() {
            return name.to_path_buf();
        }
        for dir in &[&self.extracted_dir, &self.firmware_dir] {
            let candidate = dir.join(name);
            if candidate.exists() {
                debug!("Resolved {} to {}", name.display(), candidate.display());
                return candidate;
            }
        }
        name.to_path_buf()
    }
}
