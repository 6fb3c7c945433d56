use anyhow::{Context, Result, bail};
use biolock::config::{self, Settings};
use biolock::limiter::{AttemptLimiter, FileAttemptStore};
use biolock::{Engine, KdfParams, RegisterRequest, Storage};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: from config, 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: from config, 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: from config, 1)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn to_kdf_params(&self, base: KdfParams) -> Result<KdfParams> {
        Ok(KdfParams::new(
            self.mem_cost_kib.unwrap_or(base.mem_cost_kib()),
            self.time_cost.unwrap_or(base.time_cost()),
            self.parallelism.unwrap_or(base.parallelism()),
        )?)
    }
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(name = "biolock")]
#[command(
    version,
    about = "Encrypt files under a key derived from an iris and a fingerprint capture."
)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true, value_name = "PATH", env = "BIOLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the failed-attempt ledger
    #[arg(long, global = true, value_name = "PATH", env = "BIOLOCK_ATTEMPTS")]
    attempts: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long, global = true, env = "BIOLOCK_LOG")]
    log: Option<String>,

    /// Log format; overrides the config
    #[arg(long, global = true, env = "BIOLOCK_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Encrypts a file under an iris and a fingerprint
    #[command(arg_required_else_help = true)]
    Register {
        /// File to protect
        #[arg(long)]
        file: PathBuf,

        /// Iris capture (PNG, JPEG, ...)
        #[arg(long)]
        iris: PathBuf,

        /// Fingerprint capture (PNG, JPEG, ...)
        #[arg(long)]
        fingerprint: PathBuf,

        /// Container path (default: <file>.enc)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Watermark preview path (default: <container>.watermark.png)
        #[arg(long, conflicts_with = "no_watermark")]
        watermark: Option<PathBuf>,

        /// Do not write a watermark preview
        #[arg(long, default_value_t = false)]
        no_watermark: bool,

        #[command(flatten)]
        argon2: Argon2Args,
    },

    /// Decrypts a container with an iris and a fingerprint
    #[command(arg_required_else_help = true)]
    Access {
        /// Container to open
        #[arg(long)]
        container: PathBuf,

        #[arg(long)]
        iris: PathBuf,

        #[arg(long)]
        fingerprint: PathBuf,

        /// Output path (default: decrypted_<original name> next to the container)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Replace the output file if it already exists
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Shows the non-secret header of a container
    #[command(arg_required_else_help = true)]
    Inspect {
        #[arg(long)]
        container: PathBuf,

        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Lists or evicts failed-attempt records
    Attempts {
        /// Drop records whose lockout or window has passed
        #[arg(long, default_value_t = false)]
        evict: bool,
    },
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {what} {}", path.display()))
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = file_name(path).unwrap_or_default();
    path.with_file_name(format!("{name}{suffix}"))
}

fn open_limiter(cli: &Cli, settings: &Settings) -> Result<(AttemptLimiter, Arc<FileAttemptStore>)> {
    let path = match cli.attempts.clone().or_else(|| settings.limiter.ledger.clone()) {
        Some(p) => p,
        None => config::default_ledger_path()?,
    };
    biolock::file_limiter(settings, Storage::new(path.clone()))
        .with_context(|| format!("failed to open attempt ledger {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(p) => p,
        None => config::default_config_path()?,
    };
    let mut settings = Settings::load(&config_path)?;

    let format = cli.log_format.clone().unwrap_or(match settings.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(cli.log.as_deref().unwrap_or(&settings.log.level), &format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "biolock starting"
    );
    if !config_path.exists() {
        warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    match &cli.command {
        Commands::Register {
            file,
            iris,
            fingerprint,
            out,
            watermark,
            no_watermark,
            argon2,
        } => {
            settings.kdf = argon2.to_kdf_params(settings.kdf)?;
            let engine = Engine::new(&settings)?;

            let plaintext = zeroize::Zeroizing::new(read(file, "file")?);
            let name = file_name(file);
            let iris = read(iris, "iris capture")?;
            let fingerprint = read(fingerprint, "fingerprint capture")?;

            let registered = engine
                .register(RegisterRequest {
                    file: &plaintext,
                    file_name: name.as_deref(),
                    iris: &iris,
                    fingerprint: &fingerprint,
                })
                .context("registration failed")?;

            let out = out.clone().unwrap_or_else(|| sibling(file, ".enc"));
            Storage::new(out.clone())
                .save(&registered.container)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("registered {} -> {}", file.display(), out.display());

            if !no_watermark {
                if let Some(png) = &registered.watermark {
                    let path = watermark
                        .clone()
                        .unwrap_or_else(|| sibling(&out, ".watermark.png"));
                    Storage::new(path.clone())
                        .save(png)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("watermark: {}", path.display());
                }
            }
            println!("identity: {}", registered.identity);
        }
        Commands::Access {
            container,
            iris,
            fingerprint,
            out,
            force,
        } => {
            let (limiter, _) = open_limiter(&cli, &settings)?;
            let engine = Engine::with_limiter(&settings, limiter)?;

            let data = read(container, "container")?;
            let iris = read(iris, "iris capture")?;
            let fingerprint = read(fingerprint, "fingerprint capture")?;

            let opened = engine
                .access(&data, &iris, &fingerprint)
                .context("access failed")?;

            let out = match out {
                Some(p) => p.clone(),
                None => {
                    let name = opened.output_name(&file_name(container).unwrap_or_default());
                    container.with_file_name(name)
                }
            };
            if out.exists() && !force {
                bail!(
                    "{} already exists (use --force to replace it)",
                    out.display()
                );
            }
            Storage::new(out.clone())
                .save(&opened.plaintext)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("access granted: {}", out.display());
        }
        Commands::Inspect { container, json } => {
            let engine = Engine::new(&settings)?;
            let info = engine.inspect(&read(container, "container")?)?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Container: {}", container.display());
                println!("Format version: {}", info.version);
                println!(
                    "KDF: Argon2id (m={} KiB, t={}, p={})",
                    info.mem_cost_kib, info.time_cost, info.parallelism
                );
                println!(
                    "File name: {}",
                    info.file_name.as_deref().unwrap_or("(not recorded)")
                );
                println!("Size: {} bytes", info.size);
                println!("Created: {}", info.created_at.to_rfc3339());
                println!("Ciphertext: {} bytes", info.ciphertext_len);
            }
        }
        Commands::Attempts { evict } => {
            let (limiter, store) = open_limiter(&cli, &settings)?;

            if *evict {
                let dropped = limiter.evict_expired()?;
                println!("evicted {dropped} expired record(s)");
                return Ok(());
            }

            let ledger = store.snapshot();
            if ledger.is_empty() {
                println!("No failed attempts recorded.");
                return Ok(());
            }

            println!("{:<16}  {:>8}  {:<25}  {:<25}", "Container", "Failures", "First failure", "Locked until");
            println!("{:-<16}  {:->8}  {:-<25}  {:-<25}", "", "", "", "");
            let mut entries: Vec<_> = ledger.entries().collect();
            entries.sort_by_key(|(_, record)| record.first_failure());
            for (identity, record) in entries {
                let locked = record
                    .locked_until()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<16}  {:>8}  {:<25}  {:<25}",
                    identity.get(..16).unwrap_or(identity),
                    record.failures(),
                    record.first_failure().to_rfc3339(),
                    locked
                );
            }
        }
    }

    Ok(())
}
