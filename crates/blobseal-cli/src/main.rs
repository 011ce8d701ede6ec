//! blobseal: encrypted blob repository CLI
//!
//! Commands:
//!   put <file>...        - encrypt and store files (in parallel)
//!   get <name>           - decrypt a blob to a file or stdout
//!   list                 - list blobs, optionally recursing into containers
//!   delete <name>...     - delete blobs and their encryption metadata
//!   cleanup              - remove metadata left behind by interrupted writes
//!   config show          - display current configuration

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use rayon::prelude::*;
use secrecy::SecretString;
use tracing::info;

use blobseal_core::config::{BlobsealConfig, CryptoConfig};
use blobseal_crypto::{derive_repository_key, repository_salt, InputStream, KdfParams, SALT_SIZE};
use blobseal_storage::{
    BlobContainer, BlobPath, BlobStore, EncryptedBlobStore, FsBlobStore, StorageError,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "blobseal",
    version,
    about = "Encrypted blob repository",
    long_about = "blobseal: store files as packet-encrypted blobs with sealed per-blob keys"
)]
struct Cli {
    /// Path to blobseal.toml configuration file
    #[arg(long, short = 'c', env = "BLOBSEAL_CONFIG", default_value = "blobseal.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, env = "BLOBSEAL_LOG")]
    log: Option<String>,

    /// Log format override (json, text)
    #[arg(long, env = "BLOBSEAL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and store files; each blob is named after its file
    Put {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Container path below the repository base path
        #[arg(long, short = 'p', default_value = "")]
        prefix: String,

        /// Replace blobs that already exist
        #[arg(long)]
        overwrite: bool,
    },

    /// Decrypt a blob
    Get {
        name: String,

        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        #[arg(long, short = 'p', default_value = "")]
        prefix: String,
    },

    /// List blobs (stored sizes include packet tags)
    List {
        #[arg(long, short = 'p', default_value = "")]
        prefix: String,

        /// Descend into sub-containers
        #[arg(long, short = 'r')]
        recursive: bool,
    },

    /// Delete blobs and their encryption metadata
    Delete {
        #[arg(required = true)]
        names: Vec<String>,

        #[arg(long, short = 'p', default_value = "")]
        prefix: String,
    },

    /// Delete encryption metadata whose data blob no longer exists
    Cleanup {
        #[arg(long, short = 'p', default_value = "")]
        prefix: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Put { files, prefix, overwrite } => cmd_put(&config, &files, &prefix, overwrite),
        Commands::Get { name, output, prefix } => cmd_get(&config, &name, output.as_deref(), &prefix),
        Commands::List { prefix, recursive } => cmd_list(&config, &prefix, recursive),
        Commands::Delete { names, prefix } => cmd_delete(&config, &names, &prefix),
        Commands::Cleanup { prefix } => cmd_cleanup(&config, &prefix),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries blob contents for `get`, so logs go to stderr.
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<BlobsealConfig> {
    BlobsealConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

// ── Repository access ─────────────────────────────────────────────────────────

fn read_password(crypto: &CryptoConfig) -> Result<SecretString> {
    if let Some(password) = env_password(std::env::var(&crypto.password_env).ok()) {
        return Ok(password);
    }
    let password = rpassword::prompt_password("Repository password: ")
        .context("reading repository password")?;
    if password.is_empty() {
        anyhow::bail!("repository password must not be empty");
    }
    Ok(SecretString::from(password))
}

/// A password variable that is set but empty counts as unset.
fn env_password(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.is_empty()).map(SecretString::from)
}

fn kdf_salt(config: &BlobsealConfig) -> Result<[u8; SALT_SIZE]> {
    let Some(encoded) = &config.crypto.kdf_salt else {
        return Ok(repository_salt(&config.repository.name));
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("decoding crypto.kdf_salt as base64")?;
    decoded.try_into().map_err(|bytes: Vec<u8>| {
        anyhow::anyhow!(
            "crypto.kdf_salt must decode to {SALT_SIZE} bytes, got {}",
            bytes.len()
        )
    })
}

fn kdf_params(crypto: &CryptoConfig) -> KdfParams {
    KdfParams {
        mem_cost_kib: crypto.argon2_mem_cost_kib,
        time_cost: crypto.argon2_time_cost,
        parallelism: crypto.argon2_parallelism,
    }
}

fn open_repository(config: &BlobsealConfig) -> Result<EncryptedBlobStore> {
    let password = read_password(&config.crypto)?;
    let salt = kdf_salt(config)?;
    let key = derive_repository_key(&password, &salt, &kdf_params(&config.crypto))
        .context("deriving repository key")?;

    let root = &config.repository.path;
    info!(repository = %config.repository.name, path = %root.display(), "opening repository");
    EncryptedBlobStore::new(
        Arc::new(FsBlobStore::new(root)),
        &key,
        config.repository.packet_length,
        config.repository.metadata_prefix.clone(),
    )
    .context("opening encrypted store")
}

/// `repository.base_path` joined with a command's `--prefix`.
fn container_path(config: &BlobsealConfig, prefix: &str) -> Result<BlobPath> {
    let joined = format!("{}/{}", config.repository.base_path, prefix);
    BlobPath::parse(&joined).with_context(|| format!("invalid container path: {joined}"))
}

// ── `blobseal put` ────────────────────────────────────────────────────────────

fn cmd_put(config: &BlobsealConfig, files: &[PathBuf], prefix: &str, overwrite: bool) -> Result<()> {
    let store = open_repository(config)?;
    let container = store.blob_container(&container_path(config, prefix)?);

    let results: Vec<(PathBuf, Result<u64>)> = files
        .par_iter()
        .map(|file| (file.clone(), put_file(container.as_ref(), file, overwrite)))
        .collect();

    let mut failed = 0usize;
    let mut total = 0u64;
    for (file, result) in results {
        match result {
            Ok(bytes) => {
                total += bytes;
                println!("  stored  {} ({})", file.display(), fmt_bytes(bytes));
            }
            Err(e) => {
                failed += 1;
                eprintln!("  failed  {}: {e:#}", file.display());
            }
        }
    }
    println!(
        "Put complete: {} stored ({}), {} failed",
        files.len() - failed,
        fmt_bytes(total),
        failed
    );
    if failed > 0 {
        anyhow::bail!("{failed} file(s) could not be stored");
    }
    Ok(())
}

fn put_file(container: &dyn BlobContainer, file: &Path, overwrite: bool) -> Result<u64> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no usable file name: {}", file.display()))?;
    let handle = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let length = handle.metadata()?.len();

    container
        .write_blob(name, &mut BufReader::new(handle), length, !overwrite)
        .with_context(|| format!("storing {}", file.display()))?;
    Ok(length)
}

// ── `blobseal get` ────────────────────────────────────────────────────────────

fn cmd_get(config: &BlobsealConfig, name: &str, output: Option<&Path>, prefix: &str) -> Result<()> {
    let store = open_repository(config)?;
    let container = store.blob_container(&container_path(config, prefix)?);
    let mut stream = container
        .read_blob(name)
        .with_context(|| format!("opening blob {name}"))?;

    let copied = match output {
        Some(path) => {
            // Written under a temporary name so a failed decrypt leaves nothing behind.
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let mut temp = tempfile::NamedTempFile::new_in(dir.unwrap_or(Path::new(".")))
                .context("creating output file")?;
            let copied = io::copy(&mut stream, &mut temp).map_err(describe_stream_error)?;
            temp.persist(path)
                .with_context(|| format!("writing {}", path.display()))?;
            copied
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let copied = io::copy(&mut stream, &mut out).map_err(describe_stream_error)?;
            out.flush()?;
            copied
        }
    };
    stream.close()?;
    info!(blob = name, bytes = copied, "blob decrypted");
    Ok(())
}

fn describe_stream_error(err: io::Error) -> anyhow::Error {
    match StorageError::from_io(&err) {
        Some(storage) => anyhow::anyhow!("{storage}"),
        None => anyhow::Error::new(err).context("streaming blob"),
    }
}

// ── `blobseal list` ───────────────────────────────────────────────────────────

fn cmd_list(config: &BlobsealConfig, prefix: &str, recursive: bool) -> Result<()> {
    let store = open_repository(config)?;
    let container = store.blob_container(&container_path(config, prefix)?);
    let (blobs, bytes) = list_container(container.as_ref(), recursive)?;
    println!("{blobs} blob(s), {} stored", fmt_bytes(bytes));
    Ok(())
}

fn list_container(container: &dyn BlobContainer, recursive: bool) -> Result<(u64, u64)> {
    let mut blobs = 0;
    let mut bytes = 0;
    for blob in container.list_blobs()?.values() {
        println!("{:>10}  {}", fmt_bytes(blob.length), container.path().blob_name(&blob.name));
        blobs += 1;
        bytes += blob.length;
    }
    for child in container.children()?.values() {
        if recursive {
            let (child_blobs, child_bytes) = list_container(child.as_ref(), true)?;
            blobs += child_blobs;
            bytes += child_bytes;
        } else {
            println!("{:>10}  {}/", "-", child.path());
        }
    }
    Ok((blobs, bytes))
}

// ── `blobseal delete` ─────────────────────────────────────────────────────────

fn cmd_delete(config: &BlobsealConfig, names: &[String], prefix: &str) -> Result<()> {
    let store = open_repository(config)?;
    let container = store.blob_container(&container_path(config, prefix)?);
    container
        .delete_blobs_ignoring_if_not_exists(names)
        .context("deleting blobs")?;
    println!("Deleted {} blob(s) (missing names ignored)", names.len());
    Ok(())
}

// ── `blobseal cleanup` ────────────────────────────────────────────────────────

fn cmd_cleanup(config: &BlobsealConfig, prefix: &str) -> Result<()> {
    let store = open_repository(config)?;
    let summary = store
        .container(&container_path(config, prefix)?)
        .cleanup_orphaned_metadata()
        .context("cleaning up orphaned metadata")?;

    println!("Cleanup complete:");
    println!("  metadata blobs deleted:      {}", summary.deleted_blobs);
    println!("  metadata containers deleted: {}", summary.deleted_containers);
    if summary.failures > 0 {
        println!("  failures (see log):          {}", summary.failures);
    }
    Ok(())
}

// ── `blobseal config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &BlobsealConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Utilities ─────────────────────────────────────────────────────────────────

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
