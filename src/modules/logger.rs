use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::modules::store::data_dir;

// Local-timezone timestamps for both console and file output
struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.to_rfc3339())
    }
}

pub fn log_dir() -> Result<PathBuf, String> {
    let dir = data_dir()?.join("logs");

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("failed to create log directory: {}", e))?;
    }

    Ok(dir)
}

/// Initialize the logging stack: console layer always, daily-rolling file
/// layer when the log directory is writable.
pub fn init_logger() {
    // Route log-crate macros from dependencies into tracing
    let _ = tracing_log::LogTracer::init();

    let dir = match log_dir() {
        Ok(dir) => Some(dir),
        Err(e) => {
            eprintln!("log directory unavailable: {}", e);
            None
        }
    };

    let mut file_guard: Option<tracing_appender::non_blocking::WorkerGuard> = None;
    let mut file_layer = None;

    if let Some(dir) = dir {
        if is_writable(&dir) {
            let appender = tracing_appender::rolling::daily(dir, "cloudbridge.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            file_layer = Some(
                fmt::Layer::new()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(LocalTimer),
            );
        } else {
            eprintln!("log directory not writable, console output only");
        }
    }

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_timer(LocalTimer);

    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let Some(guard) = file_guard {
        // The guard must outlive the process for the file worker to flush
        std::mem::forget(guard);
        info!("logging initialized (console + file)");
    } else {
        info!("logging initialized (console)");
    }
}

fn is_writable(dir: &PathBuf) -> bool {
    let probe = dir.join(".write_test");
    let result = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&probe)
        .and_then(|mut f| f.write_all(b"ok"));

    if result.is_ok() {
        let _ = fs::remove_file(probe);
        true
    } else {
        false
    }
}
