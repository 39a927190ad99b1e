//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HeraldSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `HERALD_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ConnectionLimitPolicy, HeraldSettings};

/// Resolve the path to the settings file (`~/.herald/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".herald").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HeraldSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<HeraldSettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<HeraldSettings> {
    let defaults = serde_json::to_value(HeraldSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HERALD_*` environment variable overrides to loaded settings.
///
/// Invalid or out-of-range values are logged and ignored.
pub fn apply_env_overrides(settings: &mut HeraldSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides using an arbitrary variable lookup.
///
/// | Variable | Field |
/// |---|---|
/// | `HERALD_HOST` | `server.host` |
/// | `HERALD_PORT` | `server.port` |
/// | `HERALD_LOG_LEVEL` | `logging.level` |
/// | `HERALD_LOG_JSON` | `logging.json` |
/// | `HERALD_MAX_CONNECTIONS_PER_USER` | `realtime.maxConnectionsPerUser` |
/// | `HERALD_CONNECTION_LIMIT_POLICY` | `realtime.connectionLimitPolicy` |
/// | `HERALD_HEARTBEAT_INTERVAL_SECONDS` | `realtime.heartbeatIntervalSeconds` |
/// | `HERALD_CLEANUP_INTERVAL_SECONDS` | `realtime.cleanupIntervalSeconds` |
/// | `HERALD_STALE_THRESHOLD_SECONDS` | `realtime.staleThresholdSeconds` |
/// | `HERALD_QUEUE_MAX_SIZE` | `realtime.queueMaxSize` |
/// | `HERALD_MAX_BATCH_SIZE` | `realtime.maxBatchSize` |
/// | `HERALD_BATCH_POLL_INTERVAL_MS` | `realtime.batchPollIntervalMs` |
/// | `HERALD_REDIS_URL` | `bridge.redisUrl` |
/// | `HERALD_BRIDGE_CHANNEL` | `bridge.channel` |
pub fn apply_overrides_from<F>(settings: &mut HeraldSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server / logging ────────────────────────────────────────────
    if let Some(v) = env.string("HERALD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("HERALD_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("HERALD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("HERALD_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Realtime ────────────────────────────────────────────────────
    let rt = &mut settings.realtime;
    if let Some(v) = env.usize("HERALD_MAX_CONNECTIONS_PER_USER", 1, 10_000) {
        rt.max_connections_per_user = v;
    }
    if let Some(v) = env.string("HERALD_CONNECTION_LIMIT_POLICY") {
        match parse_policy(&v) {
            Some(policy) => rt.connection_limit_policy = policy,
            None => warn!(key = "HERALD_CONNECTION_LIMIT_POLICY", value = %v, "invalid policy env var, ignoring"),
        }
    }
    if let Some(v) = env.u64("HERALD_HEARTBEAT_INTERVAL_SECONDS", 1, 3600) {
        rt.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64("HERALD_CLEANUP_INTERVAL_SECONDS", 1, 3600) {
        rt.cleanup_interval_secs = v;
    }
    if let Some(v) = env.u64("HERALD_STALE_THRESHOLD_SECONDS", 1, 86_400) {
        rt.stale_threshold_secs = v;
    }
    if let Some(v) = env.usize("HERALD_QUEUE_MAX_SIZE", 1, 1_000_000) {
        rt.queue_max_size = v;
    }
    if let Some(v) = env.usize("HERALD_MAX_BATCH_SIZE", 1, 10_000) {
        rt.max_batch_size = v;
    }
    if let Some(v) = env.u64("HERALD_BATCH_POLL_INTERVAL_MS", 1, 60_000) {
        rt.batch_poll_interval_ms = v;
    }

    // ── Bridge ──────────────────────────────────────────────────────
    if let Some(v) = env.string("HERALD_REDIS_URL") {
        settings.bridge.redis_url = Some(v);
    }
    if let Some(v) = env.string("HERALD_BRIDGE_CHANNEL") {
        settings.bridge.channel = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a connection limit policy name (`evictOldest`, `evict_oldest`, `reject`).
pub fn parse_policy(val: &str) -> Option<ConnectionLimitPolicy> {
    match val.to_lowercase().replace(['_', '-'], "").as_str() {
        "evictoldest" | "evict" => Some(ConnectionLimitPolicy::EvictOldest),
        "reject" => Some(ConnectionLimitPolicy::Reject),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers ────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
