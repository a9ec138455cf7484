//! pakfs command line tool
//!
//! Builds a search path from `--path` arguments and reads through it

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pakfs::{FileSystem, FsConfig, OpenMode, SearchPosition, Whitelist};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "pakfs")]
#[command(about = "Inspect a layered search path of directories and archives")]
struct Args {
    /// Search path entry, LOCATION or LOCATION=GROUP (repeatable, in order)
    #[arg(short = 'p', long = "path", value_name = "LOCATION[=GROUP]")]
    paths: Vec<String>,

    /// Group for --path entries without one
    #[arg(long, default_value = "game")]
    default_group: String,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// TOML whitelist with trusted keys and integrity rules
    #[arg(short = 'w', long)]
    whitelist: Option<PathBuf>,

    /// Directory relative locations are resolved against
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a file to stdout
    Cat {
        name: String,
        #[arg(short, long)]
        group: Option<String>,
    },
    /// List names matching a wildcard, e.g. "cfg/*.txt"
    Ls {
        #[arg(default_value = "*")]
        pattern: String,
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Show which search path entry serves a file
    Stat {
        name: String,
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Re-check every mounted archive
    Verify,
    /// Print the search path in resolution order
    Paths,
}

#[derive(Serialize)]
struct StatOutput {
    name: String,
    size: u64,
    source: pakfs::LoadSource,
}

fn split_location(arg: &str, default_group: &str) -> (String, String) {
    match arg.rsplit_once('=') {
        Some((location, group)) if !location.is_empty() && !group.is_empty() => {
            (location.to_string(), group.to_string())
        }
        _ => (arg.to_string(), default_group.to_string()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FsConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FsConfig::default(),
    };
    if let Some(dir) = &args.base_dir {
        config.base_dir = dir.clone();
    }
    // One-shot reads never hit the prefetch cache
    config.worker_threads = 1;

    let fs = FileSystem::new(config)?;
    if let Some(path) = &args.whitelist {
        let whitelist = Whitelist::load(path)
            .with_context(|| format!("loading whitelist {}", path.display()))?;
        fs.set_whitelist(whitelist);
    }

    for arg in &args.paths {
        let (location, group) = split_location(arg, &args.default_group);
        if !fs.add_search_path(&location, &group, SearchPosition::Tail) {
            bail!("could not mount {}", location);
        }
        debug!("Mounted {} as {}", location, group);
    }
    info!("{} search path entries", fs.search_paths().len());

    match args.command {
        Command::Cat { name, group } => {
            let mut handle = fs.open(&name, OpenMode::Read, group.as_deref())?;
            let data = handle.read_all()?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Command::Ls { pattern, group } => {
            let entries: Vec<_> = fs.find(&pattern, group.as_deref()).collect();
            if args.json {
                print_json(&entries)?;
            } else {
                for entry in entries {
                    let suffix = if entry.is_dir { "/" } else { "" };
                    println!("{}{}\t{}", entry.name, suffix, entry.location.display());
                }
            }
        }
        Command::Stat { name, group } => {
            let handle = fs.open(&name, OpenMode::Read, group.as_deref())?;
            let output = StatOutput {
                name,
                size: handle.size()?,
                source: handle.source().clone(),
            };
            if args.json {
                print_json(&output)?;
            } else {
                let source = &output.source;
                println!("name:     {}", output.name);
                println!("size:     {}", output.size);
                println!("kind:     {:?}", source.kind);
                println!("location: {}", source.location.display());
                println!("group:    {}", source.group.as_deref().unwrap_or("-"));
                println!("trusted:  {}", source.trusted);
            }
            if let Some(group) = output.source.group.as_deref() {
                if let Some(record) = fs.integrity_record(&output.name, group) {
                    if !args.json {
                        println!("sha256:   {}", record.hash);
                    }
                }
            }
        }
        Command::Verify => {
            let reports = fs.verify_archives();
            if args.json {
                print_json(&reports)?;
            } else {
                for report in &reports {
                    let status = if report.is_ok() { "ok" } else { "FAILED" };
                    println!(
                        "{} {} ({}, {} entries, signed: {}, trusted: {})",
                        status,
                        report.location.display(),
                        report.kind,
                        report.entries,
                        report.signed,
                        report.trusted
                    );
                    for failure in &report.failures {
                        println!("    {}", failure);
                    }
                }
            }
            let failed = reports.iter().filter(|r| !r.is_ok()).count();
            if failed > 0 {
                bail!("{} of {} archives failed verification", failed, reports.len());
            }
        }
        Command::Paths => {
            let paths = fs.search_paths();
            if args.json {
                print_json(&paths)?;
            } else {
                for info in paths {
                    println!(
                        "{:>3} {:<10} {:<12} store {:<3} {}{}",
                        info.ordinal,
                        info.kind,
                        info.group,
                        info.store_id.0,
                        info.location,
                        if info.trusted { " [trusted]" } else { "" }
                    );
                }
            }
        }
    }

    Ok(())
}
