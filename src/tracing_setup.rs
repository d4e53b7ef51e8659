//! Tracing subscriber setup, tailored to this program.
//!
//! At startup, call [`init_journald_or_stdout`] to install a subscriber.
//! The rest of the program uses the ordinary `tracing::{trace,debug,info,
//! warn,error}` macros directly.

use std::env;

use time::OffsetDateTime;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

/// Initialize logging.
///
/// If running under systemd (`JOURNAL_STREAM` set), logs go to journald;
/// otherwise they go to stdout. `default_level` sets the directive used
/// when `RUST_LOG` is unset, normally taken from `Config::log_level`.
pub fn init_journald_or_stdout(default_level: &str) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            let env_filter = build_env_filter(default_level);
            tracing_subscriber::registry().with(env_filter).with(layer).init();
            return;
        }
        use_stdout(default_level);
        tracing::error!("failed to initialize journald logging, falling back to stdout");
    } else {
        use_stdout(default_level);
    }
}

fn build_env_filter(default_level: &str) -> EnvFilter {
    let default_filter = default_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout(default_level: &str) {
    tracing_subscriber::registry()
        .with(build_env_filter(default_level))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

/// Formats timestamps in local time to the nearest second, rather than the
/// default long UTC string.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!("[hour]:[minute]:[second]"))
                .unwrap(),
        )
    }
}
