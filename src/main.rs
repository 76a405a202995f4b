mod analyze;
mod bookmarks;
mod capacity;
mod config;
mod error;
mod extract;
mod offsets;
mod patch;
mod scan;

use bookmarks::{BookmarkSink, GhidraScriptSink, ListingSink};
use capacity::{bytes_to_tb, parse_number, DEFAULT_TARGET_TB};
use clap::arg_enum;
use config::{
    Settings, DEFAULT_EXTRACTED_PATH, DEFAULT_FIRMWARE_PATH, EXTRACTED_PATH_VAR, FIRMWARE_PATH_VAR,
};
use error::Error;
use extract::ExtractOutcome;
use log::debug;
use offsets::{OffsetTable, Width};
use patch::{PatchOptions, PatchOutcome, Patcher, CAPACITY_BACKUP_SUFFIX, POKE_BACKUP_SUFFIX};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

arg_enum! {
    #[derive(Debug)]
    enum Sink {
        Listing,
        Script
    }
}

fn parse_u64(text: &str) -> Result<u64, String> {
    parse_number(text)
        .ok_or_else(|| format!("'{}' is not a decimal or 0x-prefixed number", text))
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "drobo-tools",
    about = "Offset table, capacity patcher and analysis helpers for Drobo 5D3 firmware."
)]
struct Options {
    /// Offset table to use instead of the built-in 4.2.3 table (.json or .rbp).
    #[structopt(long, parse(from_os_str))]
    table: Option<PathBuf>,
    /// Directory searched for extracted components.
    #[structopt(
        long,
        env = EXTRACTED_PATH_VAR,
        default_value = DEFAULT_EXTRACTED_PATH,
        parse(from_os_str)
    )]
    extracted_dir: PathBuf,
    /// Directory searched for firmware containers.
    #[structopt(
        long,
        env = FIRMWARE_PATH_VAR,
        default_value = DEFAULT_FIRMWARE_PATH,
        parse(from_os_str)
    )]
    firmware_dir: PathBuf,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Show the offset table.
    Offsets {
        /// Print the offset for a name.
        #[structopt(long)]
        lookup: Option<String>,
        /// Tell whether an offset lies in a patchable region.
        #[structopt(long, parse(try_from_str = parse_u64))]
        check: Option<u64>,
        /// Write the table to a file (.json or .rbp).
        #[structopt(long, parse(from_os_str))]
        export: Option<PathBuf>,
    },
    /// Read configuration flags and capacity limits.
    Analyze {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },
    /// Raise both 2TB capacity limits.
    Patch {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
        /// New limit in TB, must be greater than 2. Omitted means 32TB.
        #[structopt(name = "TARGET_TB")]
        target_tb: Option<u64>,
        /// Leave limits that are already at least the target alone.
        #[structopt(long)]
        skip_if_larger: bool,
        #[structopt(long, default_value = CAPACITY_BACKUP_SUFFIX)]
        suffix: String,
    },
    /// Write one value at a named or numeric offset.
    Poke {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
        /// Entry name or offset.
        #[structopt(name = "TARGET")]
        target: String,
        #[structopt(name = "VALUE", parse(try_from_str = parse_u64))]
        value: u64,
        /// Field width in bytes (4 or 8), defaults to the entry width.
        #[structopt(short, long)]
        width: Option<Width>,
        /// Allow offsets outside the patchable regions.
        #[structopt(long)]
        force: bool,
        #[structopt(long)]
        skip_if_larger: bool,
        #[structopt(long, default_value = POKE_BACKUP_SUFFIX)]
        suffix: String,
    },
    /// Carve the sub-images out of a firmware container.
    Extract {
        #[structopt(name = "CONTAINER", parse(from_os_str))]
        container: PathBuf,
        #[structopt(short, long, default_value = ".", parse(from_os_str))]
        out_dir: PathBuf,
    },
    /// Parse the TDIH header and carve its payload.
    Tdih {
        #[structopt(name = "CONTAINER", parse(from_os_str))]
        container: PathBuf,
        #[structopt(short, long, default_value = "vxworks_image.bin", parse(from_os_str))]
        out: PathBuf,
    },
    /// Search for 2TB constants and capacity-related strings.
    Scan {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },
    /// List bookmark locations, or emit a bookmark script.
    Bookmarks {
        #[structopt(
            long,
            possible_values = &Sink::variants(),
            case_insensitive = true,
            default_value = "Listing"
        )]
        sink: Sink,
    },
}

type AnyResult<T> = Result<T, Box<dyn std::error::Error>>;

fn print_table(table: &OffsetTable) {
    println!(
        "{} firmware {} ({})",
        table.device_model, table.firmware_version, table.architecture
    );
    println!("\nEntries:");
    for entry in &table.entries {
        let original = entry
            .original
            .map(|value| format!(" original {}", value))
            .unwrap_or_default();
        println!(
            "  {:<24} 0x{:08x} {}B {:<8}{}",
            entry.name,
            entry.offset,
            entry.width.len(),
            entry.category.to_string(),
            original
        );
    }
    println!("\nPatchable regions:");
    for range in &table.patchable {
        println!("  0x{:08x}..0x{:08x}", range.start, range.end);
    }
    println!("\nComponents:");
    for component in &table.components {
        println!(
            "  {:<24} 0x{:08x} {}",
            component.file_name, component.offset, component.description
        );
    }
    println!("\nStrings:");
    for marker in &table.markers {
        println!("  0x{:08x} {:?}", marker.offset, marker.text);
    }
}

fn print_outcome(label: &str, outcome: &PatchOutcome) {
    match outcome {
        PatchOutcome::Applied(record) => println!(
            "  ✓ Patched {}: {} → {} (0x{:x})",
            label, record.old, record.new, record.offset
        ),
        PatchOutcome::Skipped { offset, current } => println!(
            "  - Skipped {} at 0x{:x}: current {} already at least the target",
            label, offset, current
        ),
    }
}

fn run(opt: Options) -> AnyResult<()> {
    let settings = Settings {
        extracted_dir: opt.extracted_dir,
        firmware_dir: opt.firmware_dir,
        table: opt.table,
    };
    let table = settings.load_table()?;

    match opt.command {
        Command::Offsets {
            lookup,
            check,
            export,
        } => {
            if let Some(name) = lookup {
                let offset = table
                    .lookup(&name)
                    .ok_or(Error::UnknownName { name: name.clone() })?;
                println!("{}: 0x{:x}", name, offset);
            } else if let Some(offset) = check {
                let verdict = if table.is_patchable_offset(offset) { "✓" } else { "✗" };
                println!("0x{:x}: {}", offset, verdict);
            } else if let Some(path) = export {
                table.save(&path)?;
                println!("Wrote offset table to {}", path.display());
            } else {
                print_table(&table);
            }
        }
        Command::Analyze { file } => {
            let path = settings.resolve_firmware_path(&file);
            println!("Analyzing firmware: {}", path.display());
            let report = analyze::analyze(&table, &path)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            writeln!(out)?;
            analyze::write_report(&mut out, &table, &report)?;
            writeln!(
                out,
                "\nAnalysis complete for: {}",
                path.file_name().map(|name| name.to_string_lossy()).unwrap_or_default()
            )?;
        }
        Command::Patch {
            file,
            target_tb,
            skip_if_larger,
            suffix,
        } => {
            let path = settings.resolve_firmware_path(&file);
            let target_tb = target_tb.unwrap_or(DEFAULT_TARGET_TB);
            let options = PatchOptions {
                backup_suffix: suffix,
                skip_if_already_larger: skip_if_larger,
            };
            println!("Patching {} to {}TB limit...", path.display(), target_tb);
            let result = patch::patch_capacity(&table, &path, target_tb, &options)?;
            print_outcome("bytes limit", &result.bytes);
            print_outcome("sectors limit", &result.sectors);
            if result.applied() == 0 {
                println!("No patches were needed or applied.");
            } else {
                println!(
                    "✓ Successfully patched capacity limits to {}TB ({:.1} TB bytes limit)",
                    result.target_tb,
                    bytes_to_tb(capacity::tb_to_bytes(result.target_tb).unwrap_or(0))
                );
            }
        }
        Command::Poke {
            file,
            target,
            value,
            width,
            force,
            skip_if_larger,
            suffix,
        } => {
            let path = settings.resolve_firmware_path(&file);
            let entry = table.entry(&target);
            let offset = match table.lookup(&target).or_else(|| parse_number(&target)) {
                Some(offset) => offset,
                None => return Err(Error::UnknownName { name: target }.into()),
            };
            if !force && !table.is_patchable_offset(offset) {
                return Err(Error::NotPatchable { offset }.into());
            }
            let width = width
                .or_else(|| entry.map(|entry| entry.width))
                .unwrap_or(Width::Qword);
            let options = PatchOptions {
                backup_suffix: suffix,
                skip_if_already_larger: skip_if_larger,
            };
            let mut patcher = Patcher::open(&path, &options)?;
            let outcome = patcher.apply(offset, width, value)?;
            print_outcome(&target, &outcome);
            if let Some(backup) = patcher.backup() {
                println!("  Backup: {}", backup.display());
            }
        }
        Command::Extract { container, out_dir } => {
            let path = settings.resolve_firmware_path(&container);
            for outcome in extract::extract_components(&table, &path, &out_dir)? {
                match outcome {
                    ExtractOutcome::Written(extracted) => {
                        println!("\nExtracting: {}", extracted.name);
                        println!("Offset: 0x{:x} ({})", extracted.offset, extracted.offset);
                        println!(
                            "  Extracted {} bytes to {}",
                            extracted.len,
                            extracted.output.display()
                        );
                        println!("  {}", extracted.kind);
                        if extracted.kind == extract::ImageKind::Unknown {
                            println!("  starts with: {}", hex(&extracted.head));
                        }
                        if extracted.magic_ok == Some(false) {
                            println!("  ⚠ Expected signature not found");
                        }
                    }
                    ExtractOutcome::BeyondEnd { name, offset } => {
                        println!(
                            "\n{}: offset 0x{:x} beyond file size, skipping",
                            name, offset
                        );
                    }
                }
            }
        }
        Command::Tdih { container, out } => {
            let path = settings.resolve_firmware_path(&container);
            let payload = extract::extract_tdih(&path, &out)?;
            println!("{}", payload.header);
            println!(
                "\nExtracted {} bytes to {} ({})",
                payload.len,
                payload.output.display(),
                payload.kind
            );
        }
        Command::Scan { file } => {
            let path = settings.resolve_firmware_path(&file);
            let report = scan::scan(&path)?;
            println!("Potential capacity/size limits:");
            for hit in &report.strings {
                println!("  [{}] 0x{:x}: {}", hit.keyword, hit.offset, hit.text);
            }
            println!("\n2TB constants:");
            for hit in &report.constants {
                println!(
                    "  Found {} (0x{:x}) at offset: 0x{:x}",
                    hit.name, hit.value, hit.offset
                );
            }
            if let Some(offset) = report.message_offset {
                println!("\n2TB message at offset: 0x{:x}", offset);
                for hit in &report.nearby {
                    println!(
                        "  Found 0x{:x} at 0x{:x} (distance: {:+})",
                        hit.value, hit.offset, hit.distance
                    );
                }
            }
        }
        Command::Bookmarks { sink } => {
            let marks = bookmarks::bookmarks(&table);
            let stdout = io::stdout();
            let mut out: Box<dyn BookmarkSink + '_> = match sink {
                Sink::Listing => Box::new(ListingSink::new(stdout.lock())),
                Sink::Script => Box::new(GhidraScriptSink::new(stdout.lock())),
            };
            bookmarks::emit(out.as_mut(), &marks)?;
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn main() {
    env_logger::init();
    let opt = Options::from_args();
    debug!("{:?}", opt);
    if let Err(e) = run(opt) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
