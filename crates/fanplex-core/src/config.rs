//! Configuration resolution for fanplex.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/fanplex/settings.json)
//! 3. Project config (.fanplex/settings.json)
//! 4. Explicit config file (`--config`)
//! 5. Environment variables
//! 6. CLI arguments (highest priority, applied by the binary)

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Complete fanplex configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Fan-in session configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Capacity of the merged output conduit. `None` means unbounded.
    pub output_capacity: Option<usize>,
}

/// Fan-out session configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Policy for the internal per-output delivery queues.
    pub queue: QueuePolicy,
}

/// How much a split session may buffer on behalf of one lagging output.
///
/// The queue only fills when the output conduit itself applies backpressure,
/// i.e. when the output conduit is bounded and its reader falls behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Queues grow with the slowest reader's lag.
    #[default]
    Unbounded,
    /// At most `capacity` values wait per output; `overflow` decides the rest.
    Bounded {
        capacity: usize,
        #[serde(default)]
        overflow: Overflow,
    },
}

impl QueuePolicy {
    /// Queue capacity, if bounded.
    pub const fn capacity(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded { capacity, .. } => Some(*capacity),
        }
    }

    /// Overflow behaviour, if bounded.
    pub const fn overflow(&self) -> Option<Overflow> {
        match self {
            Self::Unbounded => None,
            Self::Bounded { overflow, .. } => Some(*overflow),
        }
    }
}

/// What a split session does when one output's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Overflow {
    /// Discard the incoming value for that output only.
    #[default]
    DropNewest,
    /// Stop feeding that output; it closes once its queue is delivered.
    Detach,
}

impl Overflow {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DropNewest => "drop-newest",
            Self::Detach => "detach",
        }
    }
}

impl fmt::Display for Overflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Overflow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "drop-newest" | "drop_newest" => Ok(Self::DropNewest),
            "detach" => Ok(Self::Detach),
            other => Err(Error::Config(format!(
                "Unknown overflow policy '{other}' (expected 'drop-newest' or 'detach')"
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject values no session can run with.
    pub fn validate(&self) -> Result<()> {
        if self.merge.output_capacity == Some(0) {
            return Err(Error::Config(
                "merge.output_capacity must be at least 1 (omit it for unbounded)".to_string(),
            ));
        }
        if self.split.queue.capacity() == Some(0) {
            return Err(Error::Config(
                "split.queue.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(global_path);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".fanplex").join("settings.json");
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    // An explicitly requested file must exist.
    if let Some(path) = explicit {
        layers.push(path.to_path_buf());
    }

    resolve_config(&layers, |key| std::env::var(key).ok())
}

/// Resolve configuration from file layers (lowest priority first) and an
/// environment lookup.
pub fn resolve_config<F>(layers: &[PathBuf], env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = serde_json::to_value(Config::default())?;
    for path in layers {
        let mut overlay = load_config_file(path)?;
        debug!(path = %path.display(), "Applying config layer");
        tag_bounded_queue(&merged, &mut overlay);
        merge_values(&mut merged, overlay);
    }
    check_queue_fields(&merged)?;

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".fanplex").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/fanplex/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("fanplex").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Tagged objects (carrying `kind`) replace
/// wholesale so fields of a previous variant never leak into the next one.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) if !overlay.contains_key("kind") => {
            for (key, value) in overlay {
                merge_values(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// A `split.queue` layer without `kind` that names a capacity asks for a
/// bounded queue. Over a bounded lower layer it merges field by field.
fn tag_bounded_queue(base: &Value, overlay: &mut Value) {
    let base_bounded =
        base.pointer("/split/queue/kind").and_then(Value::as_str) == Some("bounded");
    if let Some(queue) = overlay.pointer_mut("/split/queue").and_then(Value::as_object_mut)
        && !queue.contains_key("kind")
        && queue.contains_key("capacity")
        && !base_bounded
    {
        queue.insert("kind".to_string(), Value::from("bounded"));
    }
}

/// Bounded-queue fields left on an unbounded queue would be dropped by
/// deserialisation.
fn check_queue_fields(merged: &Value) -> Result<()> {
    let Some(queue) = merged.pointer("/split/queue").and_then(Value::as_object) else {
        return Ok(());
    };
    if queue.get("kind").and_then(Value::as_str) == Some("unbounded")
        && let Some(field) = queue.keys().find(|k| k.as_str() != "kind")
    {
        return Err(Error::Config(format!(
            "split.queue.{field} needs a bounded queue (set split.queue.capacity)"
        )));
    }
    Ok(())
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = env("FANPLEX_MERGE_OUTPUT_CAPACITY") {
        config.merge.output_capacity = parse_capacity("FANPLEX_MERGE_OUTPUT_CAPACITY", &val)?;
    }

    let overflow = env("FANPLEX_SPLIT_OVERFLOW")
        .map(|val| val.parse::<Overflow>())
        .transpose()?;

    if let Some(val) = env("FANPLEX_SPLIT_QUEUE_CAPACITY") {
        config.split.queue = match parse_capacity("FANPLEX_SPLIT_QUEUE_CAPACITY", &val)? {
            None => QueuePolicy::Unbounded,
            Some(capacity) => QueuePolicy::Bounded {
                capacity,
                overflow: config.split.queue.overflow().unwrap_or_default(),
            },
        };
    }

    if let Some(new_overflow) = overflow {
        match &mut config.split.queue {
            QueuePolicy::Bounded { overflow, .. } => *overflow = new_overflow,
            QueuePolicy::Unbounded => {
                return Err(Error::Config(
                    "FANPLEX_SPLIT_OVERFLOW needs a bounded split queue \
                     (set FANPLEX_SPLIT_QUEUE_CAPACITY)"
                        .to_string(),
                ));
            }
        }
    }

    if let Some(val) = env("FANPLEX_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = env("FANPLEX_LOG_JSON") {
        config.log.json = parse_flag("FANPLEX_LOG_JSON", &val)?;
    }
    Ok(())
}

fn parse_capacity(key: &str, val: &str) -> Result<Option<usize>> {
    match val.trim() {
        "" | "unbounded" => Ok(None),
        n => n
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}: invalid capacity '{n}': {e}"))),
    }
}

fn parse_flag(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{key}: invalid boolean '{other}'"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_layer(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_are_unbounded() {
        let config = Config::default();
        assert_eq!(config.merge.output_capacity, None);
        assert_eq!(config.split.queue, QueuePolicy::Unbounded);
        assert_eq!(config.log.level, "info");
        assert!(!config.log.json);
    }

    #[test]
    fn later_layers_override_without_clearing_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let global = write_layer(
            dir.path(),
            "global.json",
            r#"{"merge": {"output_capacity": 8}, "log": {"level": "debug"}}"#,
        );
        let project = write_layer(dir.path(), "project.json", r#"{"log": {"json": true}}"#);

        let config = resolve_config(&[global, project], no_env).unwrap();
        assert_eq!(config.merge.output_capacity, Some(8));
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn bounded_queue_from_file_defaults_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let layer = write_layer(
            dir.path(),
            "settings.json",
            r#"{"split": {"queue": {"kind": "bounded", "capacity": 4}}}"#,
        );

        let config = resolve_config(&[layer], no_env).unwrap();
        assert_eq!(
            config.split.queue,
            QueuePolicy::Bounded {
                capacity: 4,
                overflow: Overflow::DropNewest
            }
        );
    }

    #[test]
    fn tagged_policy_replaces_previous_variant() {
        let dir = tempfile::tempdir().unwrap();
        let bounded = write_layer(
            dir.path(),
            "a.json",
            r#"{"split": {"queue": {"kind": "bounded", "capacity": 4, "overflow": "detach"}}}"#,
        );
        let unbounded = write_layer(
            dir.path(),
            "b.json",
            r#"{"split": {"queue": {"kind": "unbounded"}}}"#,
        );

        let config = resolve_config(&[bounded, unbounded], no_env).unwrap();
        assert_eq!(config.split.queue, QueuePolicy::Unbounded);
    }

    #[test]
    fn untagged_capacity_selects_bounded_queue() {
        let dir = tempfile::tempdir().unwrap();
        let layer = write_layer(
            dir.path(),
            "settings.json",
            r#"{"split": {"queue": {"capacity": 8, "overflow": "detach"}}}"#,
        );

        let config = resolve_config(&[layer], no_env).unwrap();
        assert_eq!(
            config.split.queue,
            QueuePolicy::Bounded {
                capacity: 8,
                overflow: Overflow::Detach
            }
        );
    }

    #[test]
    fn untagged_capacity_keeps_lower_layer_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let bounded = write_layer(
            dir.path(),
            "a.json",
            r#"{"split": {"queue": {"kind": "bounded", "capacity": 4, "overflow": "detach"}}}"#,
        );
        let resized = write_layer(
            dir.path(),
            "b.json",
            r#"{"split": {"queue": {"capacity": 32}}}"#,
        );

        let config = resolve_config(&[bounded, resized], no_env).unwrap();
        assert_eq!(
            config.split.queue,
            QueuePolicy::Bounded {
                capacity: 32,
                overflow: Overflow::Detach
            }
        );
    }

    #[test]
    fn overflow_on_unbounded_queue_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layer = write_layer(
            dir.path(),
            "settings.json",
            r#"{"split": {"queue": {"overflow": "detach"}}}"#,
        );

        let result = resolve_config(&[layer], no_env);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn overflow_env_without_bounded_queue_is_rejected() {
        let result = resolve_config(&[], |k| {
            (k == "FANPLEX_SPLIT_OVERFLOW").then(|| "detach".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        let layer = write_layer(dir.path(), "settings.json", r#"{"merge": {"output_capacity": 8}}"#);
        let env: HashMap<&str, &str> = [
            ("FANPLEX_MERGE_OUTPUT_CAPACITY", "unbounded"),
            ("FANPLEX_SPLIT_QUEUE_CAPACITY", "16"),
            ("FANPLEX_SPLIT_OVERFLOW", "detach"),
            ("FANPLEX_LOG_LEVEL", "trace"),
            ("FANPLEX_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let config = resolve_config(&[layer], |k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.merge.output_capacity, None);
        assert_eq!(
            config.split.queue,
            QueuePolicy::Bounded {
                capacity: 16,
                overflow: Overflow::Detach
            }
        );
        assert_eq!(config.log.level, "trace");
        assert!(config.log.json);
    }

    #[test]
    fn invalid_env_capacity_is_rejected() {
        let result = resolve_config(&[], |k| {
            (k == "FANPLEX_SPLIT_QUEUE_CAPACITY").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let result = resolve_config(&[], |k| {
            (k == "FANPLEX_MERGE_OUTPUT_CAPACITY").then(|| "0".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_config(&[dir.path().join("nope.json")], no_env);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn overflow_parses_both_spellings() {
        assert_eq!("drop-newest".parse::<Overflow>().unwrap(), Overflow::DropNewest);
        assert_eq!("drop_newest".parse::<Overflow>().unwrap(), Overflow::DropNewest);
        assert_eq!("detach".parse::<Overflow>().unwrap(), Overflow::Detach);
        assert!("oldest".parse::<Overflow>().is_err());
    }
}
