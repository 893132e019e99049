//! Configuration record, value coercion and layered merging.
//!
//! Every layer (global file, project file, CLI flags, runtime `set` commands) is
//! expressed as a [`ConfigOverrides`] map and folded onto the defaults with
//! [`merge`]. Merging never fails: a recognized key with an unusable value is
//! reported as a [`FieldIssue`] and leaves the base value in place; unknown keys
//! are kept in [`Config::extra`].

pub mod loader;

use crate::model::{CommandSpec, DisplayMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tagged union for values that arrive untyped (JSON files, `key=value` text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(Numeric),
    String(String),
    List(Vec<String>),
    Other(serde_json::Value),
}

impl ConfigValue {
    /// Coerce a raw string: `"true"`/`"false"` become booleans, numeric text becomes
    /// a number, everything else stays a string. Applied once, at the edge.
    pub fn coerce(raw: &str) -> Self {
        match raw {
            "true" => return ConfigValue::Bool(true),
            "false" => return ConfigValue::Bool(false),
            _ => {}
        }
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() && !raw.trim().is_empty() => ConfigValue::Number(Numeric {
                value: n,
                raw: Some(raw.to_string()),
            }),
            _ => ConfigValue::String(raw.to_string()),
        }
    }

    pub fn number(value: f64) -> Self {
        ConfigValue::Number(Numeric::from(value))
    }

    /// Convert a JSON value from a config file. `null` means "unset" and yields `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        // Untagged deserialization cannot fail: `Other` accepts anything.
        serde_json::from_value(value.clone())
            .ok()
            .or(Some(ConfigValue::Other(value)))
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            ConfigValue::Number(n) if n.value.fract() == 0.0 && n.value.abs() < 9.0e15 => {
                Some(n.value as i64)
            }
            _ => None,
        }
    }

    /// Text form for string-typed fields. A coerced number gives back the text it was parsed from.
    fn as_text(&self) -> Option<String> {
        match self {
            ConfigValue::String(s) => Some(s.clone()),
            ConfigValue::Number(n) => Some(n.text()),
            _ => None,
        }
    }
}

/// A number, plus the text it was coerced from when it arrived as `key=value` text.
///
/// Serializes as a plain number; the text only matters to string-typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Numeric {
    pub value: f64,
    raw: Option<String>,
}

impl Numeric {
    fn text(&self) -> String {
        self.raw.clone().unwrap_or_else(|| number_text(self.value))
    }
}

impl From<f64> for Numeric {
    fn from(value: f64) -> Self {
        Self { value, raw: None }
    }
}

impl From<Numeric> for f64 {
    fn from(n: Numeric) -> Self {
        n.value
    }
}

fn number_text(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// One layer of field-by-field overrides. Absent keys leave the base untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Parse a textual `key=value` assignment, coercing the value.
    pub fn set_assignment(&mut self, assignment: &str) -> anyhow::Result<&mut Self> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got `{assignment}`"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("empty key in `{assignment}`");
        }
        Ok(self.set(key, ConfigValue::coerce(value)))
    }

    /// Build a layer from a JSON object (a config file body).
    pub fn from_json_object(map: serde_json::Map<String, serde_json::Value>) -> Self {
        let mut out = Self::new();
        for (key, value) in map {
            if let Some(v) = ConfigValue::from_json(value) {
                out.set(key, v);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }
}

/// A recognized field whose override value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub reason: String,
}

/// Fully defined configuration. Defaults give every field a value, possibly "absent".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub build_command: Option<CommandSpec>,
    pub clean_command: Option<CommandSpec>,
    pub display_mode: DisplayMode,
    pub display_primary_size: u32,
    pub display_secondary_size: u32,
    pub equalize_after_open: bool,
    pub notify: bool,
    pub timeout_seconds: u64,
    pub kill_grace_ms: u64,
    pub hard_kill_signal: i32,
    pub project_name: Option<String>,
    pub build_key: Option<String>,
    pub clean_key: Option<String>,
    pub success_icon: Option<String>,
    pub fail_icon: Option<String>,
    pub success_phrases: Vec<String>,
    pub failure_phrases: Vec<String>,
    /// Unrecognized keys, kept verbatim. They have no runtime effect.
    #[serde(flatten)]
    pub extra: BTreeMap<String, ConfigValue>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build_command: None,
            clean_command: None,
            display_mode: DisplayMode::Horizontal,
            display_primary_size: 12,
            display_secondary_size: 80,
            equalize_after_open: false,
            notify: true,
            timeout_seconds: 0,
            kill_grace_ms: 2000,
            hard_kill_signal: 9,
            project_name: None,
            build_key: None,
            clean_key: None,
            success_icon: Some("✓".into()),
            fail_icon: Some("✗".into()),
            success_phrases: [
                "Nice and clean.",
                "Ship it.",
                "Green across the board.",
                "That went well.",
            ]
            .map(String::from)
            .to_vec(),
            failure_phrases: [
                "Back to the drawing board.",
                "The compiler has opinions.",
                "Not today.",
                "Read the first error, fix the first error.",
            ]
            .map(String::from)
            .to_vec(),
            extra: BTreeMap::new(),
        }
    }
}

/// Result of folding one override layer onto a base.
#[derive(Debug, Clone)]
pub struct Merged {
    pub config: Config,
    pub issues: Vec<FieldIssue>,
}

/// Apply `overrides` onto `base` field by field.
pub fn merge(base: &Config, overrides: &ConfigOverrides) -> Merged {
    let mut config = base.clone();
    let mut issues = Vec::new();
    for (key, value) in overrides.iter() {
        if let Err(reason) = config.apply(key, value) {
            tracing::warn!(field = %key, %reason, "config value rejected");
            issues.push(FieldIssue {
                field: key.clone(),
                reason,
            });
        }
    }
    Merged { config, issues }
}

impl Config {
    fn apply(&mut self, key: &str, value: &ConfigValue) -> Result<(), String> {
        match key {
            "build_command" => self.build_command = Some(command_value(value)?),
            "clean_command" => self.clean_command = Some(command_value(value)?),
            "display_mode" => {
                self.display_mode = match value {
                    ConfigValue::String(s) => DisplayMode::parse(s),
                    _ => None,
                }
                .ok_or_else(|| "expected one of horizontal, vertical, never".to_string())?;
            }
            "display_primary_size" => self.display_primary_size = positive_u32(value)?,
            "display_secondary_size" => self.display_secondary_size = positive_u32(value)?,
            "equalize_after_open" => self.equalize_after_open = boolean(value)?,
            "notify" => self.notify = boolean(value)?,
            "timeout_seconds" => self.timeout_seconds = non_negative(value)?,
            "kill_grace_ms" => self.kill_grace_ms = non_negative(value)?,
            "hard_kill_signal" => {
                self.hard_kill_signal = i32::try_from(positive_u32(value)?)
                    .map_err(|_| "signal number out of range".to_string())?;
            }
            "project_name" => self.project_name = Some(text(value)?),
            "build_key" => self.build_key = Some(text(value)?),
            "clean_key" => self.clean_key = Some(text(value)?),
            "success_icon" => self.success_icon = Some(text(value)?),
            "fail_icon" => self.fail_icon = Some(text(value)?),
            "success_phrases" => self.success_phrases = phrase_list(value)?,
            "failure_phrases" => self.failure_phrases = phrase_list(value)?,
            other => {
                tracing::debug!(field = other, "storing unrecognized config key");
                self.extra.insert(other.to_string(), value.clone());
            }
        }
        Ok(())
    }
}

fn command_value(value: &ConfigValue) -> Result<CommandSpec, String> {
    match value {
        ConfigValue::List(argv) => Ok(CommandSpec::Argv(argv.clone())),
        other => other
            .as_text()
            .map(CommandSpec::Shell)
            .ok_or_else(|| "expected a command string or an array of strings".to_string()),
    }
}

fn boolean(value: &ConfigValue) -> Result<bool, String> {
    match value {
        ConfigValue::Bool(b) => Ok(*b),
        _ => Err("expected true or false".into()),
    }
}

fn non_negative(value: &ConfigValue) -> Result<u64, String> {
    value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| "expected a non-negative integer".to_string())
}

fn positive_u32(value: &ConfigValue) -> Result<u32, String> {
    value
        .as_integer()
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| "expected a positive integer".to_string())
}

fn text(value: &ConfigValue) -> Result<String, String> {
    value.as_text().ok_or_else(|| "expected a string".to_string())
}

fn phrase_list(value: &ConfigValue) -> Result<Vec<String>, String> {
    match value {
        ConfigValue::List(items) => Ok(items.clone()),
        ConfigValue::String(s) => Ok(vec![s.clone()]),
        _ => Err("expected an array of strings".into()),
    }
}

/// Owner of the live configuration. Runs take a snapshot at start, so later
/// updates never reach a job that is already running.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    current: Config,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self { current: config }
    }

    /// Merge a layer into the live config and return any rejected fields.
    pub fn merge(&mut self, overrides: &ConfigOverrides) -> Vec<FieldIssue> {
        let Merged { config, issues } = merge(&self.current, overrides);
        self.current = config;
        issues
    }

    pub fn get(&self) -> &Config {
        &self.current
    }

    pub fn snapshot(&self) -> Config {
        self.current.clone()
    }
}
