//! ═══════════════════════════════════════════════════════════════════════════════
//! PAINLAB — Thermode Session Rig
//! ═══════════════════════════════════════════════════════════════════════════════
//! Runs yoked spike-train thermal stimulation sessions over a QST-style
//! serial thermode. One crate: protocol encoding, serial driver, train
//! engine, yoke record/playback, block scheduler, event recorder.
//! ═══════════════════════════════════════════════════════════════════════════════

#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

// ═══════════════════════════════════════════════════════════════════════════════
// FOUNDATION — errors, configuration, wire protocol
// ═══════════════════════════════════════════════════════════════════════════════

pub mod config;
pub mod error;
pub mod protocol;

// ═══════════════════════════════════════════════════════════════════════════════
// CORE — device driver, train engine, yoke store, scheduler
// ═══════════════════════════════════════════════════════════════════════════════

pub mod driver;
pub mod recorder;
pub mod session;
pub mod telemetry;
pub mod train;
pub mod yoke;

pub use error::{PainlabError, Result};
