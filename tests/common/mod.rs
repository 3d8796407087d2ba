//! Shared test setup: tracing to the console and to an NDJSON file.
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//! }
//! ```
//!
//! Environment:
//! - `RUST_LOG`: filter directives, e.g. `masstable=debug,masstable::tree::split=trace`
//! - `MASSTABLE_LOG_DIR`: log directory (default `logs/`)
//! - `MASSTABLE_LOG_CONSOLE`: `0` disables console output
//!
//! The library only emits events when built with `--features tracing`.
//! File output goes to `<dir>/masstable.jsonl`, one JSON object per line:
//!
//! ```bash
//! jq 'select(.fields.message == "leaf split")' logs/masstable.jsonl
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

/// Install the subscriber once per test binary.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

#[derive(Debug, Clone)]
struct LogSettings {
    dir: PathBuf,
    console: bool,
    default_level: Level,
}

impl LogSettings {
    fn from_env() -> Self {
        Self {
            dir: env::var("MASSTABLE_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from),
            console: !env::var("MASSTABLE_LOG_CONSOLE").is_ok_and(|v| v == "0"),
            default_level: Level::INFO,
        }
    }
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let settings = LogSettings::from_env();
    std::fs::create_dir_all(&settings.dir).expect("create log directory");

    // Append: test runners may start one process per test.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(settings.dir.join("masstable.jsonl"))
        .expect("open log file");

    let console_layer = settings.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
            .with_filter(make_filter(settings.default_level))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(make_filter(settings.default_level));

    let _ = Registry::default().with(console_layer).with(file_layer).try_init();
}
