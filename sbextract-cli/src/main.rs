use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use sbextract_core::{
    collect_operation_names, Header, LoadOptions, LoadedImage, ProfileCompiler, ProfileWalker,
    SandboxCompiler, Scanner, SectionKey,
};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Output file names at or beyond this length are refused.
const MAX_OUTPUT_PATH: usize = 1024;

/// Sandbox profile and operation name extractor for iOS and OS X binaries
#[derive(Parser)]
#[command(
    name = "sbextract",
    about = "Extract built-in sandbox profiles and sandbox operation names from Mach-O binaries",
    version,
    author
)]
struct Cli {
    /// Silent mode: no progress output
    #[arg(short, long, global = true)]
    silent: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the Mach-O header, segments and tracked sections
    Info {
        /// Path to a Mach-O file
        path: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Dump the built-in binary profiles of sandboxd
    Profiles {
        /// The sandbox daemon, usually /usr/libexec/sandboxd
        path: PathBuf,
        /// Prefix for output file names
        #[arg(short = 'o', long = "out-prefix", default_value = "./")]
        out_prefix: String,
    },
    /// List the operation names known to the Sandbox kernel extension
    Ops {
        /// A decrypted iOS kernel or the OS X Sandbox kext
        path: PathBuf,
        /// Print a JSON array instead of one name per line
        #[arg(long)]
        json: bool,
    },
    /// Compile a scripted sandbox profile to its binary form
    Compile {
        /// Scripted profile (.sb)
        script: PathBuf,
        /// Where to write the compiled profile
        output: PathBuf,
    },
}

/// Output preferences shared by every command.
#[derive(Debug, Clone, Copy)]
struct Settings {
    silent: bool,
}

impl Settings {
    fn progress(&self, message: impl Display) {
        if !self.silent {
            println!("{} {message}", "[+]".green());
        }
    }

    fn failure(&self, message: impl Display) {
        eprintln!("{} {message}", "[-]".red());
    }
}

#[derive(Serialize, Tabled)]
struct SegmentRow {
    #[tabled(rename = "Segment")]
    name: String,
    #[tabled(rename = "VM address")]
    vmaddr: String,
    #[tabled(rename = "VM size")]
    vmsize: String,
    #[tabled(rename = "File offset")]
    fileoff: String,
    #[tabled(rename = "File size")]
    filesize: String,
    #[tabled(rename = "Sections")]
    sections: usize,
}

#[derive(Serialize, Tabled)]
struct SectionRow {
    #[tabled(rename = "Section")]
    name: String,
    #[tabled(rename = "Address")]
    addr: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Serialize)]
struct InfoReport {
    path: String,
    format: &'static str,
    cpu_type: i32,
    file_type: u32,
    base: String,
    image_size: usize,
    segments: Vec<SegmentRow>,
    tracked_sections: Vec<SectionRow>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let settings = Settings { silent: cli.silent };

    match cli.command {
        Command::Info { path, json } => show_info(&path, json),
        Command::Profiles { path, out_prefix } => dump_profiles(&path, &out_prefix, settings),
        Command::Ops { path, json } => list_operations(&path, json),
        Command::Compile { script, output } => compile_profile(&script, &output, settings),
    }
}

fn load(path: &Path, options: &LoadOptions) -> Result<LoadedImage> {
    LoadedImage::open(path, options)
        .with_context(|| format!("cannot load {} into memory", path.display()))
}

fn show_info(path: &Path, json: bool) -> Result<()> {
    let image = load(path, &LoadOptions::default())?;

    let segments = image
        .segments
        .iter()
        .map(|seg| SegmentRow {
            name: seg.name.clone(),
            vmaddr: format!("{:#x}", seg.vmaddr),
            vmsize: format!("{:#x}", seg.vmsize),
            fileoff: format!("{:#x}", seg.fileoff),
            filesize: format!("{:#x}", seg.filesize),
            sections: seg.sections.len(),
        })
        .collect();
    let tracked_sections = SectionKey::TRACKED
        .into_iter()
        .filter_map(|key| {
            image.section(key).map(|extent| SectionRow {
                name: key.to_string(),
                addr: format!("{:#x}", extent.addr),
                size: format!("{:#x}", extent.size),
            })
        })
        .collect();

    let report = InfoReport {
        path: image.path.clone(),
        format: image.header.format_name(),
        cpu_type: image.header.cpu_type(),
        file_type: image.header.file_type(),
        base: format!("{:#x}", image.base()),
        image_size: image.len(),
        segments,
        tracked_sections,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{}: {}, cputype {:#x}, filetype {:#x}",
        report.path.bold(),
        report.format,
        report.cpu_type,
        report.file_type
    );
    println!(
        "image base {} ({:#x} bytes)",
        report.base, report.image_size
    );

    let mut segments = Table::new(report.segments);
    segments.with(Style::sharp());
    println!("{segments}");

    if report.tracked_sections.is_empty() {
        println!("No tracked sections found.");
    } else {
        let mut sections = Table::new(report.tracked_sections);
        sections.with(Style::sharp());
        println!("{sections}");
    }
    Ok(())
}

fn dump_profiles(path: &Path, prefix: &str, settings: Settings) -> Result<()> {
    let image = load(path, &LoadOptions::profiles())?;
    let scanner = Scanner::new(&image);

    let names = scanner
        .find_name_table()
        .context("cannot find built-in sandbox profile names")?;
    settings.progress(format!("Found {} built-in profiles.", names.len()));

    let data = scanner
        .find_data_table(names.len())
        .context("cannot find built-in sandbox profile table")?;

    let mut written = 0usize;
    for profile in ProfileWalker::new(names, data) {
        let profile = profile.context("cannot read built-in sandbox profile")?;
        let filename = match output_filename(prefix, &profile.name) {
            Ok(filename) => filename,
            Err(reason) => {
                settings.failure(format!("cannot dump profile {} because {reason}", profile.name));
                continue;
            }
        };

        settings.progress(format!(
            "dumping built-in binary profile '{}' to file '{filename}'...",
            profile.name
        ));
        if let Err(e) = fs::write(&filename, profile.data) {
            settings.failure(format!(
                "cannot dump profile {} because cannot create output file {filename}: {e}",
                profile.name
            ));
            continue;
        }
        written += 1;
    }

    log::info!("wrote {written} profiles");
    settings.progress("done.");
    Ok(())
}

/// Output file for a profile, or the reason it cannot be written. Names
/// come from the scanned binary and must not leave the prefix directory.
fn output_filename(prefix: &str, name: &str) -> std::result::Result<String, String> {
    if name.contains('/') {
        return Err("its name contains a path separator".to_string());
    }
    let filename = format!("{prefix}{name}.bin");
    if filename.len() >= MAX_OUTPUT_PATH {
        return Err(format!("filename would be too long {filename}"));
    }
    Ok(filename)
}

fn list_operations(path: &Path, json: bool) -> Result<()> {
    let image = load(path, &LoadOptions::default())?;
    let names = collect_operation_names(&Scanner::new(&image))
        .context("cannot find operation names in Sandbox driver")?;
    log::info!("found {} operation names", names.len());

    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        for name in &names {
            println!("{name}");
        }
    }
    Ok(())
}

fn compile_profile(script: &Path, output: &Path, settings: Settings) -> Result<()> {
    settings.progress(format!("compiling sandbox profile: {}", script.display()));

    let compiled = SandboxCompiler::default()
        .compile(script)
        .context("error compiling sandbox profile")?;
    fs::write(output, &compiled)
        .with_context(|| format!("unable to write to file: {}", output.display()))?;

    settings.progress(format!(
        "compiled sandbox profile written to: {}",
        output.display()
    ));
    Ok(())
}
