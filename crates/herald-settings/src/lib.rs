//! # herald-settings
//!
//! Configuration management with layered sources for the Herald
//! notification hub.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HeraldSettings::default()`]
//! 2. **Settings file**: `~/.herald/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `HERALD_*` overrides (highest priority)
//!
//! The merged result is checked with [`HeraldSettings::validate`] before it
//! is handed to the hub.
//!
//! # Usage
//!
//! ```no_run
//! use herald_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("heartbeat every {}s", settings.realtime.heartbeat_interval_secs);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = HeraldSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = HeraldSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.realtime.max_connections_per_user, 10);
        assert_eq!(settings.realtime.heartbeat_interval_secs, 30);
        assert_eq!(settings.realtime.cleanup_interval_secs, 60);
        assert_eq!(settings.realtime.stale_threshold_secs, 300);
        assert_eq!(settings.realtime.queue_max_size, 1000);
        assert_eq!(settings.realtime.max_batch_size, 50);
        assert_eq!(settings.server.port, 8765);
        assert!(settings.bridge.redis_url.is_none());
    }
}
