mod config_file;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backuppy_core::backend::{BackendDriver, LocalBackend, S3Backend};
use backuppy_core::config::{BackupSetConfig, ProtocolConfig};
use backuppy_core::crypto::load_private_key;
use backuppy_core::manifest::lifecycle;
use backuppy_core::orchestrator::{self, VerifyFinding};
use backuppy_core::store::BackupStoreEngine;
use clap::{Parser, Subcommand};
use regex::Regex;

#[derive(Parser)]
#[command(name = "backuppy")]
#[command(about = "Incremental, content-addressed, encrypted file backup", long_about = None)]
struct Cli {
    /// Path to the YAML config file describing named backup sets.
    #[arg(short, long, default_value = "/etc/backuppy/backuppy.conf.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a backup set's source directories and save anything new or changed.
    Backup {
        name: String,
        /// Save a full copy of every file instead of diffing against the last version.
        #[arg(long)]
        force_copy: bool,
        /// Decide what would be saved without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore a single file as it was at (or just before) a given time.
    Restore {
        name: String,
        path: String,
        dest: PathBuf,
        /// Unix timestamp (seconds); defaults to the newest version.
        #[arg(long)]
        at: Option<i64>,
    },
    /// Re-read every blob the manifest references and confirm it's intact.
    Verify { name: String },
    /// Delete manifest rows verify flagged as exact duplicates.
    Repair { name: String },
    /// List tracked paths and their history.
    Search {
        name: String,
        #[arg(long)]
        like: Option<String>,
        #[arg(long)]
        before: Option<i64>,
        #[arg(long)]
        after: Option<i64>,
        #[arg(long)]
        file_limit: Option<u32>,
        #[arg(long)]
        history_limit: Option<u32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let backup_set_name = match &cli.command {
        Command::Backup { name, .. }
        | Command::Restore { name, .. }
        | Command::Verify { name }
        | Command::Repair { name }
        | Command::Search { name, .. } => name.clone(),
    };
    let config = config_file::load_one(&cli.config, &backup_set_name)?;
    let protocol = config.protocol.resolve()?;
    let backend = build_backend(&protocol)?;
    let backend: &dyn BackendDriver = backend.as_ref();

    match cli.command {
        Command::Backup { force_copy, dry_run, .. } => cmd_backup(&config, backend, force_copy, dry_run),
        Command::Restore { path, dest, at, .. } => cmd_restore(&config, backend, &path, at, &dest),
        Command::Verify { .. } => cmd_verify(&config, backend),
        Command::Repair { .. } => cmd_repair(&config, backend),
        Command::Search { like, before, after, file_limit, history_limit, .. } => {
            cmd_search(&config, backend, like.as_deref(), before, after, file_limit, history_limit)
        }
    }
}

fn build_backend(protocol: &ProtocolConfig) -> Result<Box<dyn BackendDriver>> {
    match protocol {
        ProtocolConfig::Local { location } => Ok(Box::new(LocalBackend::new(location.clone()))),
        ProtocolConfig::S3 { bucket, prefix, region } => {
            let runtime = tokio::runtime::Runtime::new()?;
            let client = runtime.block_on(async {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = region {
                    loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
                }
                aws_sdk_s3::Client::new(&loader.load().await)
            });
            Ok(Box::new(S3Backend::new(client, bucket.clone(), prefix.clone())?))
        }
    }
}

fn compile_exclusions(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid exclusion pattern {p:?}")))
        .collect()
}

fn read_private_key(config: &BackupSetConfig) -> Result<rsa::RsaPrivateKey> {
    let pem = std::fs::read_to_string(&config.options.private_key_filename)
        .with_context(|| format!("reading private key {}", config.options.private_key_filename))?;
    Ok(load_private_key(&pem)?)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as i64
}

fn cmd_backup(config: &BackupSetConfig, backend: &dyn BackendDriver, force_copy: bool, dry_run: bool) -> Result<()> {
    let private_key = read_private_key(config)?;
    let mut unlocked = lifecycle::unlock(backend, &config.options, &private_key)?;
    let engine = BackupStoreEngine::new(backend, config.options.clone());
    let exclude = compile_exclusions(&config.exclusions)?;

    for dir in &config.directories {
        let summary = orchestrator::backup_directory(
            &engine,
            &mut unlocked.manifest,
            Path::new(dir),
            &exclude,
            force_copy,
            dry_run,
            None,
        )?;
        println!(
            "{dir}: {} scanned, {} removed, {} errors",
            summary.files_scanned, summary.files_deleted, summary.errors
        );
    }

    lifecycle::lock(unlocked, backend, &config.options, &private_key, now_ms(), dry_run)?;
    Ok(())
}

fn cmd_restore(config: &BackupSetConfig, backend: &dyn BackendDriver, path: &str, at: Option<i64>, dest: &Path) -> Result<()> {
    let private_key = read_private_key(config)?;
    let unlocked = lifecycle::unlock(backend, &config.options, &private_key)?;
    let engine = BackupStoreEngine::new(backend, config.options.clone());
    orchestrator::restore_file(&engine, &unlocked.manifest, path, at, dest)?;
    lifecycle::lock(unlocked, backend, &config.options, &private_key, now_ms(), false)?;
    println!("restored {path} to {}", dest.display());
    Ok(())
}

fn cmd_verify(config: &BackupSetConfig, backend: &dyn BackendDriver) -> Result<()> {
    let private_key = read_private_key(config)?;
    let unlocked = lifecycle::unlock(backend, &config.options, &private_key)?;
    let engine = BackupStoreEngine::new(backend, config.options.clone());
    let findings = orchestrator::verify(&engine, &unlocked.manifest)?;

    let mut ok = 0;
    for finding in &findings {
        match finding {
            VerifyFinding::Ok { .. } => ok += 1,
            VerifyFinding::BlobUnreadable { abs_file_name, sha, detail } => {
                println!("ERROR {abs_file_name} ({sha}): {detail}")
            }
            VerifyFinding::DuplicateRow { abs_file_name } => println!("DUPLICATE {abs_file_name}"),
            VerifyFinding::ShaWithMultipleKeyPairs { sha, count } => {
                println!("MULTI_KEY_PAIR {sha} ({count} key pairs)")
            }
        }
    }
    println!("{ok} files OK");

    lifecycle::lock(unlocked, backend, &config.options, &private_key, now_ms(), false)?;
    Ok(())
}

fn cmd_repair(config: &BackupSetConfig, backend: &dyn BackendDriver) -> Result<()> {
    let private_key = read_private_key(config)?;
    let mut unlocked = lifecycle::unlock(backend, &config.options, &private_key)?;
    let engine = BackupStoreEngine::new(backend, config.options.clone());
    let findings = orchestrator::verify(&engine, &unlocked.manifest)?;
    let repaired = orchestrator::repair(&mut unlocked.manifest, &findings)?;
    println!("repaired {repaired} duplicate row(s)");

    lifecycle::lock(unlocked, backend, &config.options, &private_key, now_ms(), false)?;
    Ok(())
}

fn cmd_search(
    config: &BackupSetConfig,
    backend: &dyn BackendDriver,
    like: Option<&str>,
    before: Option<i64>,
    after: Option<i64>,
    file_limit: Option<u32>,
    history_limit: Option<u32>,
) -> Result<()> {
    let private_key = read_private_key(config)?;
    let unlocked = lifecycle::unlock(backend, &config.options, &private_key)?;
    let results = orchestrator::search(&unlocked.manifest, like, before, after, file_limit, history_limit)?;

    for (path, history) in &results {
        println!("{path}");
        for entry in history {
            let sha = entry.state.sha().unwrap_or("(deleted)");
            let when = chrono::DateTime::from_timestamp(entry.commit_timestamp, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| entry.commit_timestamp.to_string());
            println!("  {when} {sha}");
        }
    }

    lifecycle::lock(unlocked, backend, &config.options, &private_key, now_ms(), false)?;
    Ok(())
}
