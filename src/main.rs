use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use subfs::catalog::TagSlot;
use subfs::{DirectoryService, ServerConfig};

/// subfs - browse a Subsonic-style music server as a folder tree
#[derive(Parser, Debug)]
#[command(name = "subfs", version, about)]
struct Args {
    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip loading the on-disk record cache
    #[arg(long)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check connectivity and credentials
    Ping,
    /// List sub-folders of a virtual path ("" for the collection roots)
    Browse {
        #[arg(default_value = "")]
        path: String,
    },
    /// List all songs under a virtual path, with their tags
    Files {
        #[arg(default_value = "")]
        path: String,
    },
    /// Check whether a single file exists on the server
    Exists { path: String },
    /// Save a song's cover art to a file
    Art { path: String, out: PathBuf },
    /// Stream a song's raw bytes to a file (or stdout with -)
    Stream { path: String, out: PathBuf },
    /// Re-enumerate every collection and rebuild the record cache
    Refresh {
        /// Only rebuild when a collection watermark moved
        #[arg(long)]
        dirty_only: bool,
    },
    /// Print a default config.toml to stdout
    GenerateConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Command::GenerateConfig = args.command {
        let config = ServerConfig::default();
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => ServerConfig::load_from(path),
        None => ServerConfig::load(),
    };
    let service = Arc::new(DirectoryService::from_config(&config)?);
    if !args.no_cache {
        service.load_cache();
    }

    match args.command {
        Command::Ping => {
            service.ping().context("Server did not answer ping")?;
            println!("ok");
        }
        Command::Browse { path } => {
            for name in service.list_folders(&path) {
                println!("{}", name);
            }
            report_degraded(&service);
        }
        Command::Files { path } => {
            for record in service.list_files(&path) {
                println!(
                    "{}\t{} - {} [{}]",
                    record.path(),
                    record.get(TagSlot::Artist),
                    record.get(TagSlot::TrackTitle),
                    record.get(TagSlot::Album),
                );
            }
            report_degraded(&service);
        }
        Command::Exists { path } => {
            println!("{}", service.file_exists(&path));
        }
        Command::Art { path, out } => {
            let bytes = service
                .fetch_artwork(&path)
                .with_context(|| format!("No artwork for {}", path))?;
            std::fs::write(&out, bytes)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("wrote {}", out.display());
        }
        Command::Stream { path, out } => {
            let mut stream = service
                .fetch_stream(&path)
                .with_context(|| format!("Failed to stream {}", path))?;
            if out.as_os_str() == "-" {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                std::io::copy(&mut stream, &mut handle)?;
                handle.flush()?;
            } else {
                let mut file = std::fs::File::create(&out)
                    .with_context(|| format!("Failed to create {}", out.display()))?;
                std::io::copy(&mut stream, &mut file)?;
                println!("wrote {}", out.display());
            }
        }
        Command::Refresh { dirty_only } => {
            let changed = if dirty_only {
                service.refresh_if_dirty()
            } else {
                service.force_refresh()
            };
            if let Some(err) = service.last_error() {
                anyhow::bail!("Refresh failed: {}", err);
            }
            println!("{}", if changed { "updated" } else { "unchanged" });
        }
        Command::GenerateConfig => unreachable!(),
    }
    Ok(())
}

fn report_degraded(service: &DirectoryService) {
    if let Some(err) = service.last_error() {
        eprintln!("warning: {}", err);
    }
}
