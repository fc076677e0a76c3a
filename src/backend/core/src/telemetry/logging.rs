//! Structured logging and sensitive-value redaction.
//!
//! - JSON, pretty or compact output through `tracing-subscriber`
//! - `EnvFilter` with per-module overrides
//! - A regex-backed [`SensitiveFieldRedactor`] shared by log output and the
//!   audit pipeline, which scrubs metadata before it is persisted

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static REDACTOR: OnceLock<SensitiveFieldRedactor> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels, e.g. `chronicle_core::audit = "debug"`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Include file and line in each record
    #[serde(default = "default_true")]
    pub include_location: bool,

    #[serde(default = "default_true")]
    pub include_target: bool,

    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: true,
            include_target: true,
            redaction: RedactionConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Configuration for sensitive data redaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_redaction_patterns")]
    pub patterns: Vec<RedactionPattern>,

    #[serde(default = "default_redaction_replacement")]
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: default_redaction_patterns(),
            replacement: default_redaction_replacement(),
        }
    }
}

/// Field names and/or a value regex identifying sensitive data.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionPattern {
    pub name: String,

    /// Substrings matched case-insensitively against field names
    #[serde(default)]
    pub field_names: Vec<String>,

    #[serde(default)]
    pub value_pattern: Option<String>,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    field_names: Vec<String>,
    value_regex: Option<Regex>,
}

/// Redactor for sensitive fields and values.
#[derive(Debug, Clone)]
pub struct SensitiveFieldRedactor {
    patterns: Vec<CompiledPattern>,
    replacement: String,
    enabled: bool,
}

impl SensitiveFieldRedactor {
    /// Compile a redactor. Patterns with an invalid regex keep only their field names.
    pub fn new(config: &RedactionConfig) -> Self {
        let patterns = config
            .patterns
            .iter()
            .map(|p| CompiledPattern {
                field_names: p.field_names.iter().map(|s| s.to_lowercase()).collect(),
                value_regex: p.value_pattern.as_deref().and_then(|pat| match Regex::new(pat) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern = %p.name, error = %e, "Ignoring invalid redaction regex");
                        None
                    }
                }),
            })
            .collect();

        Self {
            patterns,
            replacement: config.replacement.clone(),
            enabled: config.enabled,
        }
    }

    pub fn should_redact_field(&self, field_name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let lower = field_name.to_lowercase();
        self.patterns
            .iter()
            .any(|p| p.field_names.iter().any(|f| lower.contains(f.as_str())))
    }

    /// Replace every regex match inside `value`.
    pub fn redact_value(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }
        self.patterns
            .iter()
            .filter_map(|p| p.value_regex.as_ref())
            .fold(value.to_string(), |acc, re| {
                re.replace_all(&acc, self.replacement.as_str()).into_owned()
            })
    }

    /// Redact by field name first, then by value pattern.
    pub fn redact(&self, field_name: &str, value: &str) -> String {
        if self.should_redact_field(field_name) {
            return self.replacement.clone();
        }
        self.redact_value(value)
    }

    /// Redact a JSON tree in place. Object keys are checked against field
    /// names; string leaves against value patterns.
    pub fn redact_json(&self, value: &mut Value) {
        if !self.enabled {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.should_redact_field(key) {
                        *child = Value::String(self.replacement.clone());
                    } else {
                        self.redact_json(child);
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact_json(item)),
            Value::String(s) => {
                let redacted = self.redact_value(s);
                if redacted != *s {
                    *s = redacted;
                }
            }
            _ => {}
        }
    }

    /// The process-wide redactor, configured by [`init_logging`].
    pub fn global() -> &'static SensitiveFieldRedactor {
        REDACTOR.get_or_init(|| SensitiveFieldRedactor::new(&RedactionConfig::default()))
    }
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_true() -> bool {
    true
}

fn default_redaction_replacement() -> String {
    "[REDACTED]".to_string()
}

fn default_redaction_patterns() -> Vec<RedactionPattern> {
    let pattern = |name: &str, fields: &[&str], value: Option<&str>| RedactionPattern {
        name: name.to_string(),
        field_names: fields.iter().map(|s| s.to_string()).collect(),
        value_pattern: value.map(str::to_string),
    };

    vec![
        pattern("api_keys", &["api_key", "apikey", "api-key"], Some(r"sk-[a-zA-Z0-9]{20,}")),
        pattern("passwords", &["password", "passwd", "secret", "credential"], None),
        pattern(
            "tokens",
            &["token", "bearer", "jwt", "authorization", "session_key"],
            Some(r"eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+"),
        ),
        pattern(
            "payment_cards",
            &["card_number", "credit_card", "cc_number", "cvv"],
            Some(r"\b(?:\d{4}[-\s]?){3}\d{4}\b"),
        ),
        pattern("ssn", &["ssn", "social_security"], Some(r"\b\d{3}-\d{2}-\d{4}\b")),
    ]
}

/// Install the global subscriber.
///
/// In `development` the JSON default switches to pretty output.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let _ = REDACTOR.set(SensitiveFieldRedactor::new(&config.redaction));

    let mut filter = EnvFilter::try_new(&config.level)?;
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }

    let format = match (environment, config.format) {
        ("development", LogFormat::Json) => LogFormat::Pretty,
        (_, format) => format,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let base = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target);

    match format {
        LogFormat::Json => registry.with(base.json()).try_init()?,
        LogFormat::Pretty => registry.with(base.pretty()).try_init()?,
        LogFormat::Compact => registry.with(base.compact()).try_init()?,
    }

    Ok(())
}
