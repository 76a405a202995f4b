use snafu::Snafu;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("File {} not found", path.display()))]
    FileNotFound { path: PathBuf },

    #[snafu(display("Error creating backup {}: {}", backup.display(), source))]
    BackupFailed { backup: PathBuf, source: io::Error },

    #[snafu(display("Error reading {} at 0x{:x}: {}", path.display(), offset, source))]
    ReadFailed {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[snafu(display("Error patching {} at 0x{:x}: {}", path.display(), offset, source))]
    WriteFailed {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[snafu(display(
        "Verification failed at 0x{:x}: expected 0x{:x}, found 0x{:x} (restore from {})",
        offset,
        expected,
        found,
        backup.display()
    ))]
    VerificationMismatch {
        offset: u64,
        expected: u64,
        found: u64,
        backup: PathBuf,
    },

    #[snafu(display("Value 0x{:x} does not fit in {} bytes", value, width))]
    ValueTooWide { value: u64, width: usize },

    #[snafu(display("Invalid argument: {}", reason))]
    InvalidArgument { reason: String },

    #[snafu(display("Unknown offset name '{}'", name))]
    UnknownName { name: String },

    #[snafu(display("Offset 0x{:x} is outside every patchable region", offset))]
    NotPatchable { offset: u64 },

    #[snafu(display("Error reading offset table {}: {}", path.display(), source))]
    TableRead { path: PathBuf, source: io::Error },

    #[snafu(display("Error writing offset table {}: {}", path.display(), source))]
    TableWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Offset table {} is not usable JSON: {}", path.display(), source))]
    TableJson {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Offset table {} is not usable bincode: {}", path.display(), source))]
    TableBinary {
        path: PathBuf,
        source: bincode::Error,
    },

    #[snafu(display("Offset table {} is inconsistent: {}", path.display(), reason))]
    TableInvalid { path: PathBuf, reason: String },

    #[snafu(display("Error extracting {}: {}", path.display(), source))]
    Extract { path: PathBuf, source: io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
