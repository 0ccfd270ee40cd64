//! Dropsafe command-line interface for probing export drives and running exports.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use dropsafe_client::{ApiClient, Credentials};
use dropsafe_core::{logging, DropsafeConfig, FoundVolume, DEFAULT_CONFIG_PATH};
use dropsafe_disk::{UsbExporter, EXPORT_DATA_DIRNAME};
use log::info;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

fn load_cli_config(path: &Path) -> Result<DropsafeConfig> {
    let config = DropsafeConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {}.",
            config.path.display()
        );
    }

    Ok(config)
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "dropsafe",
    version,
    about = "Export files to an encrypted USB drive with guaranteed teardown."
)]
struct Cli {
    /// Path to the dropsafe configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report the attached export drive and its encryption scheme.
    Probe,

    /// Copy a directory of files onto the attached encrypted drive.
    Export {
        /// Directory whose contents become the export payload.
        #[arg(short, long)]
        source: PathBuf,

        /// Override the directory name created on the target drive.
        #[arg(long)]
        target_dirname: Option<String>,

        /// Read the unlock passphrase from a file instead of prompting.
        #[arg(long)]
        passphrase_file: Option<PathBuf>,
    },

    /// Download submissions from the journalist API into a local directory.
    Fetch {
        /// Journalist account name.
        #[arg(long)]
        username: String,

        /// Restrict the fetch to one source UUID.
        #[arg(long)]
        source_uuid: Option<String>,

        /// Directory to save downloaded submissions into.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Emit the configuration JSON schema.
    Schema,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Probe => {
            let config = load_cli_config(&config_path)?;
            let exporter = UsbExporter::from_config(&config)?;
            match exporter.get_volume() {
                Ok(FoundVolume::Locked(vol)) => {
                    println!(
                        "Found locked {} volume at {}.",
                        vol.encryption,
                        vol.device_path.display()
                    );
                }
                Ok(FoundVolume::Mounted(mv)) => {
                    println!(
                        "Found {} volume at {} already mounted at {}.",
                        mv.encryption,
                        mv.device_path.display(),
                        mv.mountpoint.display()
                    );
                }
                Err(err) => {
                    eprintln!("{}", err.status());
                    bail!(err);
                }
            }
        }
        Commands::Export {
            source,
            target_dirname,
            passphrase_file,
        } => {
            ensure!(
                source.is_dir(),
                "source {} is not a directory",
                source.display()
            );

            let mut config = load_cli_config(&config_path)?;
            if let Some(dirname) = target_dirname {
                config.disk.target_dirname = dirname;
            }

            let passphrase = match passphrase_file {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("read passphrase file {}", path.display()))?
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
                None => prompt_password("Drive passphrase: ")?,
            };

            let staging = TempDir::new().context("failed to create staging directory")?;
            stage_payload(&source, staging.path())?;

            let exporter = UsbExporter::from_config(&config)?;
            let status = exporter.run_export(&passphrase, staging.path());

            println!("{status}");
            if status.is_error() {
                std::process::exit(1);
            }
        }
        Commands::Fetch {
            username,
            source_uuid,
            output,
        } => {
            ensure!(
                output.is_dir(),
                "output {} is not a directory",
                output.display()
            );
            let config = load_cli_config(&config_path)?;

            let passphrase = prompt_password("Account passphrase: ")?;
            print!("One-time code: ");
            io::stdout().flush().ok();
            let mut one_time_code = String::new();
            io::stdin().read_line(&mut one_time_code)?;

            let mut client = ApiClient::new(&config.client)?;
            client.authenticate(&Credentials {
                username,
                passphrase,
                one_time_code: one_time_code.trim().to_string(),
            })?;

            let fetched = fetch_submissions(&client, source_uuid.as_deref(), &output)?;
            let result = client.logout();
            println!("Downloaded {fetched} submissions to {}.", output.display());
            result.context("failed to revoke the session token")?;
        }
        Commands::Schema => {
            let schema = schema_for!(DropsafeConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

/// Copy the source tree into `<staging>/export_data/`, the layout the export
/// pipeline copies from.
fn stage_payload(source: &Path, staging: &Path) -> Result<()> {
    let export_data = staging.join(EXPORT_DATA_DIRNAME);
    fs::create_dir(&export_data)
        .with_context(|| format!("create {}", export_data.display()))?;

    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields paths under its root");
        if relative.as_os_str().is_empty() {
            continue;
        }

        let destination = export_data.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)
                .with_context(|| format!("create {}", destination.display()))?;
        } else {
            fs::copy(entry.path(), &destination)
                .with_context(|| format!("copy {} into staging", entry.path().display()))?;
        }
    }

    info!("staged payload from {}", source.display());
    Ok(())
}

/// Download every submission (for one source or all of them), verifying each
/// file against the server's etag.
fn fetch_submissions(
    client: &ApiClient,
    source_uuid: Option<&str>,
    output: &Path,
) -> Result<usize> {
    let source_uuids: Vec<String> = match source_uuid {
        Some(uuid) => vec![uuid.to_string()],
        None => client
            .sources()?
            .into_iter()
            .map(|source| source.uuid)
            .collect(),
    };

    let mut fetched = 0;
    for uuid in source_uuids {
        for submission in client.submissions(&uuid)? {
            let (etag, path) = client.download_submission(&submission, output)?;
            ensure!(
                dropsafe_client::verify_etag(&etag, &path)?,
                "checksum mismatch for {}",
                path.display()
            );
            info!("downloaded {}", path.display());
            fetched += 1;
        }
    }

    Ok(fetched)
}
