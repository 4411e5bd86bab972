//! Console and file logging.
//!
//! Console output goes to stderr so stdout carries command results only.
//! The optional `[logging] file` sink always writes JSON lines.

use std::fs;
use std::io;
use std::path::Path;

use eyre::WrapErr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::FILE_GUARD;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Split `path` into the directory and file name `tracing_appender` expects.
fn split_log_path(path: &Path) -> eyre::Result<(&Path, &std::ffi::OsStr)> {
    let name = path
        .file_name()
        .ok_or_else(|| eyre::eyre!("logging.file {path:?} has no file name"))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, name))
}

fn file_layer(cfg: &mmu_config::Logging, path: &str) -> eyre::Result<BoxedLayer> {
    let (dir, name) = split_log_path(Path::new(path))?;
    fs::create_dir_all(dir).wrap_err_with(|| format!("create log directory {dir:?}"))?;

    let appender = match cfg.rotation.as_deref() {
        Some("daily") => tracing_appender::rolling::daily(dir, name),
        Some("hourly") => tracing_appender::rolling::hourly(dir, name),
        _ => tracing_appender::rolling::never(dir, name),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // Dropping the guard flushes the writer, so it lives for the process.
    let _ = FILE_GUARD.set(guard);

    let level = cfg.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_new(level)
        .wrap_err_with(|| format!("invalid logging.level '{level}'"))?;
    Ok(tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter)
        .boxed())
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `console_level`.
pub fn init_logging(
    json: bool,
    console_level: &str,
    cfg: &mmu_config::Logging,
) -> eyre::Result<()> {
    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(console_level)
            .wrap_err_with(|| format!("invalid --log-level '{console_level}'"))?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    layers.push(if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_filter(console_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_filter(console_filter)
            .boxed()
    });
    if let Some(path) = cfg.file.as_deref() {
        layers.push(file_layer(cfg, path)?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .wrap_err("install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_file_name_logs_to_current_dir() {
        let (dir, name) = split_log_path(Path::new("mmu.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "mmu.log");
    }

    #[test]
    fn nested_path_is_split() {
        let (dir, name) = split_log_path(Path::new("logs/unit/mmu.log")).unwrap();
        assert_eq!(dir, Path::new("logs/unit"));
        assert_eq!(name, "mmu.log");
    }

    #[test]
    fn directory_only_path_is_rejected() {
        assert!(split_log_path(Path::new("/")).is_err());
    }
}
