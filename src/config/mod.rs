//! Configuration Module
//!
//! Process-wide settings loaded from TOML, replacing hardcoded endpoints and
//! thresholds with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `SHIPSIGHT_CONFIG` environment variable (path to TOML file)
//! 2. `shipsight.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(Settings::load());
//!
//! // Anywhere in the codebase:
//! let cycle = config::get().detection.cycle_seconds;
//! ```

mod settings;
pub mod defaults;

pub use settings::*;

use std::sync::OnceLock;

/// Process-wide settings slot, filled once during startup.
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Install the settings for the rest of the process lifetime.
///
/// Meant to run once from `main` (or a test harness) before any component
/// spawns. A second call cannot replace the installed settings; it is logged
/// and dropped.
pub fn init(settings: Settings) {
    if SETTINGS.set(settings).is_err() {
        tracing::warn!("Settings already installed — ignoring repeated config::init()");
    }
}

/// Borrow the installed settings.
///
/// Panics when nothing has been installed yet: every component reads its
/// knobs through here, so reaching this point without settings means the
/// startup sequence itself is broken and continuing would only defer the
/// crash somewhere less obvious.
pub fn get() -> &'static Settings {
    #[allow(clippy::expect_used)]
    SETTINGS
        .get()
        .expect("settings read before install — config::init() must run first in main()")
}

/// Whether settings have been installed yet.
///
/// Lets tests and optional startup paths probe instead of panicking.
pub fn is_initialized() -> bool {
    SETTINGS.get().is_some()
}

/// Initialize with defaults when nothing has been installed yet (tests).
pub fn init_for_tests() {
    if !is_initialized() {
        init(Settings::default());
    }
}
