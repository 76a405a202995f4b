use crate::error::*;
use crate::offsets::{Component, OffsetTable, ELF_MAGIC};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fmt;
use std::fs::{self, File};
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

/// How far into a carved image the format sniffer looks for signatures.
const SNIFF_WINDOW: usize = 1024;
pub const TDIH_HEADER_LEN: usize = 80;
pub const TDIH_PAYLOAD_MAX_LEN: u64 = 10 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageKind {
    Elf,
    VxWorks,
    Wind,
    Unknown,
}

impl ImageKind {
    pub fn sniff(data: &[u8]) -> Self {
        let head = &data[..data.len().min(SNIFF_WINDOW)];
        if data.starts_with(ELF_MAGIC) {
            ImageKind::Elf
        } else if contains(head, b"VxWorks") {
            ImageKind::VxWorks
        } else if contains(head, b"WIND") {
            ImageKind::Wind
        } else {
            ImageKind::Unknown
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageKind::Elf => "Valid ELF file",
            ImageKind::VxWorks => "Contains VxWorks signatures",
            ImageKind::Wind => "Contains WIND kernel signatures",
            ImageKind::Unknown => "Unknown format",
        })
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[derive(Clone, PartialEq, Debug)]
pub struct Extracted {
    pub name: String,
    pub offset: u64,
    pub output: PathBuf,
    pub len: u64,
    pub kind: ImageKind,
    /// `None` when the component declares no magic.
    pub magic_ok: Option<bool>,
    pub head: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum ExtractOutcome {
    Written(Extracted),
    BeyondEnd { name: String, offset: u64 },
}

/// Bytes to carve for component `index`: up to the next component, or to the
/// end of the container for the last one, capped at the component maximum.
/// Components are in ascending offset order; table loading rejects others.
fn carve_len(components: &[Component], index: usize, file_len: u64) -> u64 {
    let component = &components[index];
    let end = components
        .get(index + 1)
        .map(|next| next.offset)
        .unwrap_or(file_len);
    end.saturating_sub(component.offset).min(component.max_len)
}

pub fn extract_components(
    table: &OffsetTable,
    container: &Path,
    out_dir: &Path,
) -> Result<Vec<ExtractOutcome>> {
    ensure!(container.is_file(), FileNotFound { path: container });
    let mut file = File::open(container).context(Extract { path: container })?;
    let file_len = file.metadata().context(Extract { path: container })?.len();
    fs::create_dir_all(out_dir).context(Extract { path: out_dir })?;

    let mut outcomes = Vec::with_capacity(table.components.len());
    for (index, component) in table.components.iter().enumerate() {
        if component.offset >= file_len {
            warn!(
                "{} at 0x{:x} is beyond the end of {}, skipping",
                component.name,
                component.offset,
                container.display()
            );
            outcomes.push(ExtractOutcome::BeyondEnd {
                name: component.name.clone(),
                offset: component.offset,
            });
            continue;
        }

        let len = carve_len(&table.components, index, file_len);
        let mut data = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(component.offset))
            .and_then(|_| (&mut file).take(len).read_to_end(&mut data))
            .context(Extract { path: container })?;

        let output = out_dir.join(&component.file_name);
        fs::write(&output, &data).context(Extract { path: &output })?;
        info!("Extracted {} bytes to {}", data.len(), output.display());

        let magic_ok = if component.magic.is_empty() {
            None
        } else {
            Some(data.starts_with(&component.magic))
        };
        outcomes.push(ExtractOutcome::Written(Extracted {
            name: component.name.clone(),
            offset: component.offset,
            output,
            len: data.len() as u64,
            kind: ImageKind::sniff(&data),
            magic_ok,
            head: data.iter().take(8).cloned().collect(),
        }));
    }
    Ok(outcomes)
}

/// Fixed part of the TDIH container header, little-endian.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct TdihHeader {
    pub payload_offset: u32,
    pub unknown: u32,
    pub magic: [u8; 4],
    pub identifier: u32,
    pub target: [u8; 16],
    pub reserved: [u8; 16],
    pub firmware: [u8; 32],
}

fn ascii_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    raw[..end]
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

impl TdihHeader {
    pub fn parse(raw: &[u8]) -> std::result::Result<Self, String> {
        if raw.len() < TDIH_HEADER_LEN {
            return Err(format!(
                "header needs {} bytes, got {}",
                TDIH_HEADER_LEN,
                raw.len()
            ));
        }
        bincode::deserialize(&raw[..TDIH_HEADER_LEN]).map_err(|e| e.to_string())
    }

    pub fn target_name(&self) -> String {
        ascii_field(&self.target)
    }

    pub fn firmware_name(&self) -> String {
        ascii_field(&self.firmware)
    }
}

impl fmt::Display for TdihHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TDIH Header Analysis:")?;
        writeln!(f, "  Offset/Size: 0x{:x} ({})", self.payload_offset, self.payload_offset)?;
        writeln!(f, "  Unknown1: 0x{:x}", self.unknown)?;
        writeln!(f, "  Magic: {}", String::from_utf8_lossy(&self.magic))?;
        writeln!(f, "  Identifier: 0x{:x}", self.identifier)?;
        writeln!(f, "  Target: {}", self.target_name())?;
        write!(f, "  Firmware: {}", self.firmware_name())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct TdihPayload {
    pub header: TdihHeader,
    pub output: PathBuf,
    pub len: u64,
    pub kind: ImageKind,
}

/// Carves the VxWorks payload that the TDIH header points at.
pub fn extract_tdih(container: &Path, output: &Path) -> Result<TdihPayload> {
    ensure!(container.is_file(), FileNotFound { path: container });
    let mut file = File::open(container).context(Extract { path: container })?;

    let mut raw = Vec::with_capacity(TDIH_HEADER_LEN);
    (&mut file)
        .take(TDIH_HEADER_LEN as u64)
        .read_to_end(&mut raw)
        .context(Extract { path: container })?;
    let header = TdihHeader::parse(&raw).map_err(|reason| Error::InvalidArgument {
        reason: format!("{}: {}", container.display(), reason),
    })?;

    let mut data = Vec::new();
    file.seek(SeekFrom::Start(u64::from(header.payload_offset)))
        .and_then(|_| (&mut file).take(TDIH_PAYLOAD_MAX_LEN).read_to_end(&mut data))
        .context(Extract { path: container })?;
    fs::write(output, &data).context(Extract { path: output })?;
    info!(
        "Extracted {} bytes from 0x{:x} to {}",
        data.len(),
        header.payload_offset,
        output.display()
    );

    Ok(TdihPayload {
        kind: ImageKind::sniff(&data),
        len: data.len() as u64,
        output: output.to_path_buf(),
        header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table_with(offsets: &[u64], max_len: u64) -> OffsetTable {
        let mut table = OffsetTable::drobo_5d3();
        for (component, &offset) in table.components.iter_mut().zip(offsets) {
            component.offset = offset;
            component.max_len = max_len;
        }
        table
    }

    fn container() -> Vec<u8> {
        let mut data = vec![0u8; 0x100];
        data[0x10..0x14].copy_from_slice(ELF_MAGIC);
        data[0x40..0x44].copy_from_slice(ELF_MAGIC);
        data[0x90..0x97].copy_from_slice(b"VxWorks");
        data
    }

    #[test]
    fn carves_between_component_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("release.tdf");
        fs::write(&input, container()).unwrap();
        let table = table_with(&[0x10, 0x40, 0x80], 1 << 20);

        let out = dir.path().join("out");
        let outcomes = extract_components(&table, &input, &out).unwrap();
        let lens: Vec<_> = outcomes
            .iter()
            .map(|outcome| match outcome {
                ExtractOutcome::Written(extracted) => {
                    (extracted.len, extracted.kind, extracted.magic_ok)
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            lens,
            vec![
                (0x30, ImageKind::Elf, Some(true)),
                (0x40, ImageKind::Elf, Some(true)),
                (0x80, ImageKind::VxWorks, None),
            ]
        );
        let secondary = fs::read(out.join("secondary.elf")).unwrap();
        assert_eq!(secondary, container()[0x40..0x80].to_vec());
    }

    #[test]
    fn honours_max_len_and_skips_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("release.tdf");
        fs::write(&input, container()).unwrap();
        let table = table_with(&[0x10, 0x40, 0x1000], 0x8);

        let outcomes = extract_components(&table, &input, dir.path()).unwrap();
        assert!(matches!(&outcomes[0], ExtractOutcome::Written(e) if e.len == 8));
        assert_eq!(
            outcomes[2],
            ExtractOutcome::BeyondEnd {
                name: "vxworks_kernel_bin".to_string(),
                offset: 0x1000
            }
        );
        assert!(!dir.path().join("vxworks_kernel.bin").exists());
    }

    #[test]
    fn mismatched_magic_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("release.tdf");
        fs::write(&input, vec![0x55u8; 0x100]).unwrap();
        let table = table_with(&[0x0, 0x40, 0x80], 1 << 20);
        let outcomes = extract_components(&table, &input, dir.path()).unwrap();
        match &outcomes[1] {
            ExtractOutcome::Written(extracted) => {
                assert_eq!(extracted.magic_ok, Some(false));
                assert_eq!(extracted.kind, ImageKind::Unknown);
                assert_eq!(extracted.head, vec![0x55; 8]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn tdih_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        data[0..4].copy_from_slice(&0x200u32.to_le_bytes());
        data[4..8].copy_from_slice(&7u32.to_le_bytes());
        data[8..12].copy_from_slice(b"TDIH");
        data[12..16].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        data[16..22].copy_from_slice(b"Drobo5");
        data[48..62].copy_from_slice(b"release.4-2-3\0");
        data[0x200..0x204].copy_from_slice(ELF_MAGIC);
        data
    }

    #[test]
    fn parses_tdih_header() {
        let header = TdihHeader::parse(&tdih_image()).unwrap();
        assert_eq!(header.payload_offset, 0x200);
        assert_eq!(header.unknown, 7);
        assert_eq!(&header.magic, b"TDIH");
        assert_eq!(header.identifier, 0xdead_beef);
        assert_eq!(header.target_name(), "Drobo5");
        assert_eq!(header.firmware_name(), "release.4-2-3");
        assert!(TdihHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn extracts_tdih_payload() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("release.tdf");
        fs::write(&input, tdih_image()).unwrap();
        let output = dir.path().join("vxworks_image.bin");

        let payload = extract_tdih(&input, &output).unwrap();
        assert_eq!(payload.len, 0x200);
        assert_eq!(payload.kind, ImageKind::Elf);
        assert_eq!(fs::read(&output).unwrap(), tdih_image()[0x200..].to_vec());
    }

    #[test]
    fn sniffs_signatures_in_head_only() {
        let mut data = vec![0u8; 2048];
        data[1500..1504].copy_from_slice(b"WIND");
        assert_eq!(ImageKind::sniff(&data), ImageKind::Unknown);
        data[100..104].copy_from_slice(b"WIND");
        assert_eq!(ImageKind::sniff(&data), ImageKind::Wind);
        assert_eq!(ImageKind::sniff(&[]), ImageKind::Unknown);
    }
}
