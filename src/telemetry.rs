//! ═══════════════════════════════════════════════════════════════════════════════
//! TELEMETRY — Tracing Setup
//! ═══════════════════════════════════════════════════════════════════════════════
//! Operator-console logging lives on `tracing`; subject-facing data goes
//! through the event recorder instead. `RUST_LOG` overrides the default
//! `info` filter.
//! ═══════════════════════════════════════════════════════════════════════════════

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init() {
    if INITIALISED.set(()).is_err() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());

    Registry::default().with(filter).with(fmt_layer).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
