use crate::capacity::{self, ORIGINAL_LIMIT_TB};
use crate::error::*;
use crate::offsets::{OffsetEntry, OffsetTable, Width};
use log::{debug, info, warn};
use snafu::{ensure, ResultExt};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

pub const CAPACITY_BACKUP_SUFFIX: &str = "capacity_patch";
pub const POKE_BACKUP_SUFFIX: &str = "poke";

#[derive(Clone, PartialEq, Debug)]
pub struct PatchOptions {
    /// Appended as `<file>.backup_<suffix>`.
    pub backup_suffix: String,
    /// Leave a field alone when it already holds a value at least as large as
    /// the requested one.
    pub skip_if_already_larger: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        PatchOptions {
            backup_suffix: CAPACITY_BACKUP_SUFFIX.to_string(),
            skip_if_already_larger: false,
        }
    }
}

/// One applied write, kept around only long enough to be reported.
#[derive(Clone, PartialEq, Debug)]
pub struct PatchRecord {
    pub target: PathBuf,
    pub offset: u64,
    pub width: Width,
    pub old: u64,
    pub new: u64,
    pub backup: PathBuf,
}

#[derive(Clone, PartialEq, Debug)]
pub enum PatchOutcome {
    Applied(PatchRecord),
    Skipped { offset: u64, current: u64 },
}

pub fn backup_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(format!(".backup_{}", suffix));
    PathBuf::from(name)
}

pub fn read_value(path: &Path, offset: u64, width: Width) -> Result<u64> {
    let mut file = File::open(path).context(ReadFailed { path, offset })?;
    read_at(&mut file, path, offset, width)
}

pub(crate) fn read_at<F: Read + Seek>(
    file: &mut F,
    path: &Path,
    offset: u64,
    width: Width,
) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut buf[..width.len()]))
        .context(ReadFailed { path, offset })?;
    Ok(width.decode(&buf))
}

/// In-place patcher for a single file. The first applied write copies the
/// file to its backup path; later writes through the same patcher reuse it.
pub struct Patcher<'a> {
    target: PathBuf,
    options: &'a PatchOptions,
    backup: Option<PathBuf>,
}

impl<'a> Patcher<'a> {
    pub fn open(target: &Path, options: &'a PatchOptions) -> Result<Self> {
        ensure!(target.is_file(), FileNotFound { path: target });
        Ok(Patcher {
            target: target.to_path_buf(),
            options,
            backup: None,
        })
    }

    pub fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    pub fn read(&self, offset: u64, width: Width) -> Result<u64> {
        read_value(&self.target, offset, width)
    }

    fn ensure_backup(&mut self) -> Result<PathBuf> {
        if let Some(backup) = &self.backup {
            return Ok(backup.clone());
        }
        let backup = backup_path(&self.target, &self.options.backup_suffix);
        fs::copy(&self.target, &backup).context(BackupFailed { backup: &backup })?;
        info!("Created backup: {}", backup.display());
        self.backup = Some(backup.clone());
        Ok(backup)
    }

    /// Writes `value` at `offset`, then reads it back through a fresh handle.
    /// A mismatch is reported but the file is left as written.
    pub fn apply(&mut self, offset: u64, width: Width, value: u64) -> Result<PatchOutcome> {
        ensure!(
            value <= width.max_value(),
            ValueTooWide {
                value,
                width: width.len()
            }
        );

        let current = self.read(offset, width)?;
        if self.options.skip_if_already_larger && current >= value {
            info!(
                "Skipping 0x{:x}: current 0x{:x} already >= 0x{:x}",
                offset, current, value
            );
            return Ok(PatchOutcome::Skipped { offset, current });
        }

        let backup = self.ensure_backup()?;
        let target = self.target.clone();

        let old = {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&target)
                .context(WriteFailed { path: &target, offset })?;
            let old = read_at(&mut file, &target, offset, width)?;
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(&width.encode(value)))
                .and_then(|_| file.sync_all())
                .context(WriteFailed { path: &target, offset })?;
            old
        };
        debug!("Wrote 0x{:x} at 0x{:x} (was 0x{:x})", value, offset, old);

        verify(&target, offset, width, value, &backup)?;

        Ok(PatchOutcome::Applied(PatchRecord {
            target,
            offset,
            width,
            old,
            new: value,
            backup,
        }))
    }
}

/// Reads `offset` back through a fresh read-only handle and compares it with
/// `expected`.
fn verify(path: &Path, offset: u64, width: Width, expected: u64, backup: &Path) -> Result<()> {
    let found = read_value(path, offset, width)?;
    if found != expected {
        warn!(
            "Read back 0x{:x} at 0x{:x}, expected 0x{:x}",
            found, offset, expected
        );
        return VerificationMismatch {
            offset,
            expected,
            found,
            backup,
        }
        .fail();
    }
    Ok(())
}

fn limit_entry<'t>(table: &'t OffsetTable, name: &str) -> Result<&'t OffsetEntry> {
    table.entry(name).ok_or_else(|| Error::UnknownName {
        name: name.to_string(),
    })
}

/// Result of a capacity patch, one outcome per limit.
#[derive(Clone, PartialEq, Debug)]
pub struct CapacityPatch {
    pub target_tb: u64,
    pub bytes: PatchOutcome,
    pub sectors: PatchOutcome,
}

impl CapacityPatch {
    pub fn applied(&self) -> usize {
        [&self.bytes, &self.sectors]
            .iter()
            .filter(|outcome| matches!(outcome, PatchOutcome::Applied(_)))
            .count()
    }
}

/// Raises both the bytes and sectors limits to `target_tb` terabytes under a
/// single backup.
pub fn patch_capacity(
    table: &OffsetTable,
    target: &Path,
    target_tb: u64,
    options: &PatchOptions,
) -> Result<CapacityPatch> {
    ensure!(
        target_tb > ORIGINAL_LIMIT_TB,
        InvalidArgument {
            reason: format!("new limit must be greater than {}TB", ORIGINAL_LIMIT_TB)
        }
    );
    let (new_bytes, new_sectors) = capacity::limits_for_tb(target_tb).ok_or_else(|| {
        Error::InvalidArgument {
            reason: format!("{}TB does not fit in 64 bits", target_tb),
        }
    })?;
    let bytes_entry = limit_entry(table, OffsetTable::BYTES_LIMIT)?;
    let sectors_entry = limit_entry(table, OffsetTable::SECTORS_LIMIT)?;

    let mut patcher = Patcher::open(target, options)?;
    info!(
        "Patching {} to {}TB: bytes 0x{:x}, sectors 0x{:x}",
        target.display(),
        target_tb,
        new_bytes,
        new_sectors
    );
    let bytes = patcher.apply(bytes_entry.offset, bytes_entry.width, new_bytes)?;
    let sectors = patcher.apply(sectors_entry.offset, sectors_entry.width, new_sectors)?;

    Ok(CapacityPatch {
        target_tb,
        bytes,
        sectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{ORIGINAL_BYTES_LIMIT, ORIGINAL_SECTORS_LIMIT};
    use crate::offsets::OffsetRange;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const TB32: u64 = 35_184_372_088_832;

    fn scratch(contents: &[u8]) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secondary.elf");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn two_tb_file() -> Vec<u8> {
        let mut data = vec![0u8; 16];
        data[..8].copy_from_slice(&ORIGINAL_BYTES_LIMIT.to_le_bytes());
        data
    }

    /// Small table with both limits near the start of the file.
    fn small_table() -> OffsetTable {
        let mut table = OffsetTable::drobo_5d3();
        for entry in table.entries.iter_mut() {
            match entry.name.as_str() {
                OffsetTable::BYTES_LIMIT => entry.offset = 0,
                OffsetTable::SECTORS_LIMIT => entry.offset = 8,
                _ => {}
            }
        }
        table.patchable = vec![OffsetRange::new(0, 16)];
        table
    }

    fn small_image() -> Vec<u8> {
        let mut data = two_tb_file();
        data[8..].copy_from_slice(&ORIGINAL_SECTORS_LIMIT.to_le_bytes());
        data
    }

    #[test]
    fn patches_two_tb_to_thirty_two() {
        let (_dir, path) = scratch(&two_tb_file());
        let options = PatchOptions::default();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        let outcome = patcher.apply(0, Width::Qword, TB32).unwrap();

        let backup = backup_path(&path, CAPACITY_BACKUP_SUFFIX);
        assert_eq!(
            outcome,
            PatchOutcome::Applied(PatchRecord {
                target: path.clone(),
                offset: 0,
                width: Width::Qword,
                old: ORIGINAL_BYTES_LIMIT,
                new: TB32,
                backup: backup.clone(),
            })
        );
        let data = fs::read(&path).unwrap();
        assert_eq!(&data[..8], &TB32.to_le_bytes());
        assert_eq!(fs::read(&backup).unwrap(), two_tb_file());
    }

    #[test]
    fn round_trips_arbitrary_values() {
        let (_dir, path) = scratch(&[0xaa; 24]);
        let options = PatchOptions::default();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        for &value in &[0, 1, 0x1234_5678_9abc_def0, u64::MAX, ORIGINAL_SECTORS_LIMIT] {
            patcher.apply(5, Width::Qword, value).unwrap();
            assert_eq!(read_value(&path, 5, Width::Qword).unwrap(), value);
        }
        let data = fs::read(&path).unwrap();
        assert_eq!(&data[..5], &[0xaa; 5]);
        assert_eq!(&data[13..], &[0xaa; 11]);
    }

    #[test]
    fn missing_file_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.elf");
        let options = PatchOptions::default();
        assert!(matches!(
            Patcher::open(&path, &options),
            Err(Error::FileNotFound { .. })
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn backup_is_taken_once_before_the_first_write() {
        let (_dir, path) = scratch(&small_image());
        let options = PatchOptions {
            backup_suffix: "test".to_string(),
            skip_if_already_larger: false,
        };
        let mut patcher = Patcher::open(&path, &options).unwrap();
        assert_eq!(patcher.backup(), None);
        patcher.apply(0, Width::Qword, 7).unwrap();
        patcher.apply(8, Width::Qword, 9).unwrap();

        let backup = patcher.backup().unwrap().to_path_buf();
        assert!(backup.to_string_lossy().ends_with("secondary.elf.backup_test"));
        assert_eq!(fs::read(&backup).unwrap(), small_image());
    }

    #[test]
    fn skip_guard_leaves_file_untouched() {
        let (dir, path) = scratch(&two_tb_file());
        let options = PatchOptions {
            skip_if_already_larger: true,
            ..PatchOptions::default()
        };
        let mut patcher = Patcher::open(&path, &options).unwrap();
        for &target in &[ORIGINAL_BYTES_LIMIT, ORIGINAL_BYTES_LIMIT - 1] {
            assert_eq!(
                patcher.apply(0, Width::Qword, target).unwrap(),
                PatchOutcome::Skipped {
                    offset: 0,
                    current: ORIGINAL_BYTES_LIMIT
                }
            );
        }
        assert_eq!(fs::read(&path).unwrap(), two_tb_file());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn without_guard_smaller_values_are_written() {
        let (_dir, path) = scratch(&two_tb_file());
        let options = PatchOptions::default();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        assert!(matches!(
            patcher.apply(0, Width::Qword, 1).unwrap(),
            PatchOutcome::Applied(_)
        ));
        assert_eq!(read_value(&path, 0, Width::Qword).unwrap(), 1);
    }

    #[test]
    fn dword_fields_reject_wide_values() {
        let (_dir, path) = scratch(&[0u8; 8]);
        let options = PatchOptions::default();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        assert!(matches!(
            patcher.apply(0, Width::Dword, 1 << 32),
            Err(Error::ValueTooWide { width: 4, .. })
        ));
        assert_eq!(patcher.backup(), None);

        patcher.apply(4, Width::Dword, 2).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn reads_past_end_fail() {
        let (_dir, path) = scratch(&[0u8; 4]);
        let options = PatchOptions::default();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        assert!(matches!(
            patcher.apply(0, Width::Qword, 1),
            Err(Error::ReadFailed { offset: 0, .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn backup_failure_aborts_before_writing() {
        let (_dir, path) = scratch(&two_tb_file());
        let options = PatchOptions {
            backup_suffix: "blocked".to_string(),
            skip_if_already_larger: false,
        };
        // A directory in the way makes the copy fail.
        fs::create_dir(backup_path(&path, "blocked")).unwrap();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        assert!(matches!(
            patcher.apply(0, Width::Qword, TB32),
            Err(Error::BackupFailed { .. })
        ));
        assert_eq!(patcher.backup(), None);
        assert_eq!(fs::read(&path).unwrap(), two_tb_file());
    }

    #[test]
    fn verify_reports_mismatch_with_backup() {
        let (_dir, path) = scratch(&two_tb_file());
        let backup = backup_path(&path, CAPACITY_BACKUP_SUFFIX);
        verify(&path, 0, Width::Qword, ORIGINAL_BYTES_LIMIT, &backup).unwrap();
        match verify(&path, 0, Width::Qword, TB32, &backup) {
            Err(Error::VerificationMismatch {
                offset,
                expected,
                found,
                backup: reported,
            }) => {
                assert_eq!((offset, expected, found), (0, TB32, ORIGINAL_BYTES_LIMIT));
                assert_eq!(reported, backup);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    // WriteFailed needs a file that opens for reading but not for writing,
    // which a read-only permission bit does not give when running as root.
    #[cfg(unix)]
    #[test]
    fn read_only_target_reports_write_failure() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, path) = scratch(&two_tb_file());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();
        if OpenOptions::new().write(true).open(&path).is_ok() {
            return;
        }
        let options = PatchOptions::default();
        let mut patcher = Patcher::open(&path, &options).unwrap();
        assert!(matches!(
            patcher.apply(0, Width::Qword, TB32),
            Err(Error::WriteFailed { offset: 0, .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), two_tb_file());
    }

    #[test]
    fn capacity_patch_moves_both_limits() {
        let (_dir, path) = scratch(&small_image());
        let table = small_table();
        let result = patch_capacity(&table, &path, 32, &PatchOptions::default()).unwrap();

        assert_eq!(result.applied(), 2);
        assert_eq!(read_value(&path, 0, Width::Qword).unwrap(), TB32);
        assert_eq!(read_value(&path, 8, Width::Qword).unwrap(), TB32 / 512);
        let backup = backup_path(&path, CAPACITY_BACKUP_SUFFIX);
        assert_eq!(fs::read(backup).unwrap(), small_image());
    }

    #[test]
    fn capacity_patch_is_idempotent_with_guard() {
        let (_dir, path) = scratch(&small_image());
        let table = small_table();
        let options = PatchOptions {
            skip_if_already_larger: true,
            ..PatchOptions::default()
        };
        let first = patch_capacity(&table, &path, 64, &options).unwrap();
        assert_eq!(first.applied(), 2);
        let patched = fs::read(&path).unwrap();
        let second = patch_capacity(&table, &path, 32, &options).unwrap();
        assert_eq!(second.applied(), 0);
        assert_eq!(fs::read(&path).unwrap(), patched);
    }

    #[test]
    fn capacity_patch_rejects_small_targets() {
        let (_dir, path) = scratch(&small_image());
        let table = small_table();
        for &tb in &[0, 1, 2] {
            assert!(matches!(
                patch_capacity(&table, &path, tb, &PatchOptions::default()),
                Err(Error::InvalidArgument { .. })
            ));
        }
        assert_eq!(fs::read(&path).unwrap(), small_image());
    }

    #[test]
    fn capacity_patch_needs_limit_entries() {
        let (_dir, path) = scratch(&small_image());
        let mut table = small_table();
        table
            .entries
            .retain(|entry: &OffsetEntry| entry.name != OffsetTable::SECTORS_LIMIT);
        assert!(matches!(
            patch_capacity(&table, &path, 32, &PatchOptions::default()),
            Err(Error::UnknownName { .. })
        ));
    }
}
