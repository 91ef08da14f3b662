//! Log output for the pool daemon.
//!
//! The daemon calls [`init`] once at startup. Everything else logs through
//! `use crate::tracing::prelude::*`.
//!
//! Connection and share lines are emitted at DEBUG; set
//! `RUST_LOG=stratum_pool=debug` to see them.

use std::env;

use time::OffsetDateTime;
use time::macros::format_description;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const SYSLOG_IDENTIFIER: &str = "stratum-poold";

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Journald,
    Stdout,
}

impl LogTarget {
    /// Journald when systemd attached the process to the journal.
    pub fn detect() -> Self {
        if env::var_os("JOURNAL_STREAM").is_some() {
            LogTarget::Journald
        } else {
            LogTarget::Stdout
        }
    }
}

/// Install the global subscriber. `RUST_LOG` applies to either target and
/// defaults to INFO.
pub fn init(target: LogTarget) {
    let filter = env_filter();
    match target {
        LogTarget::Journald => match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.with_syslog_identifier(SYSLOG_IDENTIFIER.into()))
                    .init();
            }
            Err(e) => {
                init_stdout(filter);
                warn!(error = %e, "Journald unavailable, logging to stdout");
            }
        },
        LogTarget::Stdout => init_stdout(filter),
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

fn init_stdout(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalClock))
        .init();
}

/// Local wall-clock time to the second; UTC when the offset is unknown.
struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
