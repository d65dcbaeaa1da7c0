//! Purpose: `logring` CLI entry point; tees stdin into a rotating compressed log ring.
//! Role: Binary crate root; parses args, pumps stdin, prints a JSON summary on stdout.
//! Invariants: Errors are emitted as JSON on stderr; exit code comes from `to_exit_code`.
//! Invariants: Command-line flags override values loaded from `--config`.
//! Invariants: SIGHUP requests a rotation; it is honoured between reads, never mid-write.
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, ValueHint};
use logring::core::codec::DEFAULT_ZSTD_LEVEL;
use logring::{Codec, Error, ErrorKind, PlainCodec, Ring, RingOptions, ZstdCodec, to_exit_code};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing::info;
use tracing_subscriber::EnvFilter;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "logring",
    version,
    about = "Write stdin into a bounded set of rotating, compressed log files"
)]
struct Cli {
    #[arg(long, help = "Directory holding the rotation files", value_hint = ValueHint::DirPath)]
    dir: PathBuf,
    #[arg(long, help = "Name prefix shared by this ring's files")]
    prefix: String,
    #[arg(
        long,
        value_parser = parse_size_arg,
        help = "Total size budget across all files: bytes or K/M/G (must exceed 1M)"
    )]
    max_total_size: Option<u64>,
    #[arg(long, help = "Number of files in the rotation (minimum 2)")]
    files: Option<u32>,
    #[arg(long, default_value_t = DEFAULT_ZSTD_LEVEL, help = "zstd compression level")]
    level: i32,
    #[arg(long, help = "Store bytes uncompressed (.log files)")]
    plain: bool,
    #[arg(
        long,
        help = "JSON file with ring options (max_total_size, files, directory_mode, file_mode)",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct PumpOutcome {
    bytes: u64,
    rotations: u64,
    last_path: Option<PathBuf>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<(), Error> {
    let options = resolve_options(&cli)?;
    let hup = register_hup()?;
    let stdin = io::stdin().lock();

    let outcome = if cli.plain {
        let ring = Ring::with_codec(&cli.dir, cli.prefix.as_str(), options, PlainCodec)?;
        pump(&ring, stdin, &hup)?
    } else {
        let codec = ZstdCodec::new(cli.level);
        let ring = Ring::with_codec(&cli.dir, cli.prefix.as_str(), options, codec)?;
        pump(&ring, stdin, &hup)?
    };

    let summary = json!({
        "dir": cli.dir.display().to_string(),
        "prefix": cli.prefix,
        "bytes": outcome.bytes,
        "rotations": outcome.rotations,
        "last_file": outcome.last_path.map(|path| path.display().to_string()),
    });
    println!("{summary}");
    Ok(())
}

fn resolve_options(cli: &Cli) -> Result<RingOptions, Error> {
    let mut options = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let Some(max_total_size) = cli.max_total_size else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("missing size budget")
                    .with_hint("Pass --max-total-size (e.g. 64M) or --config <file>."));
            };
            RingOptions::new(max_total_size)
        }
    };
    if let Some(max_total_size) = cli.max_total_size {
        options.max_total_size = max_total_size;
    }
    if let Some(files) = cli.files {
        options.files = files;
    }
    Ok(options)
}

fn load_config(path: &Path) -> Result<RingOptions, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::io(err)
            .with_message("could not read config")
            .with_path(path)
    })?;
    serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid config")
            .with_hint("Expected a JSON object like {\"max_total_size\": 67108864, \"files\": 4}.")
            .with_path(path)
            .with_source(err)
    })
}

fn pump<C: Codec, R: Read>(
    ring: &Ring<C>,
    mut reader: R,
    hup: &AtomicBool,
) -> Result<PumpOutcome, Error> {
    let mut outcome = PumpOutcome::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::io(err).with_message("failed to read stdin"));
            }
        };
        if hup.swap(false, Ordering::Relaxed) {
            info!("rotation requested by SIGHUP");
            ring.rotate()?;
        }
        ring.write(&chunk[..n])?;
        outcome.bytes += n as u64;
    }
    let stats = ring.stats()?;
    outcome.rotations = stats.rotations;
    outcome.last_path = stats.active_path;
    ring.close()?;
    Ok(outcome)
}

#[cfg(unix)]
fn register_hup() -> Result<Arc<AtomicBool>, Error> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&flag)).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to install SIGHUP handler")
            .with_source(err)
    })?;
    Ok(flag)
}

#[cfg(not(unix))]
fn register_hup() -> Result<Arc<AtomicBool>, Error> {
    Ok(Arc::new(AtomicBool::new(false)))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn parse_size_arg(input: &str) -> Result<u64, String> {
    parse_size(input).map_err(|err| err.to_string())
}

fn parse_size(input: &str) -> Result<u64, Error> {
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    let digits = trimmed[..split].trim();
    let suffix = trimmed[split..].trim();

    let value: u64 = digits.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid size")
            .with_hint("Use bytes or K/M/G (e.g. 64M).")
            .with_source(err)
    })?;

    let multiplier = match suffix {
        "" => 1,
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("invalid size suffix")
                .with_hint("Use K/M/G (e.g. 64M)."));
        }
    };

    value.checked_mul(multiplier).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("size overflow")
            .with_hint("Use a smaller size value.")
    })
}

fn emit_error(err: &Error) {
    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert(
        "message".to_string(),
        json!(err.message().unwrap_or("operation failed")),
    );
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(index) = err.index() {
        inner.insert("index".to_string(), json!(index));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}
