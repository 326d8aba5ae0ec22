//! Structured logging with JSON/pretty/compact formats and secret redaction.
//!
//! Token secrets must never reach a log line. Errors pass their messages
//! through [`SecretRedactor::global`] before logging.

use regex::Regex;
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static REDACTOR: OnceLock<SecretRedactor> = OnceLock::new();

/// Replacement for a redacted secret.
pub const REDACTED: &str = "[REDACTED]";

/// `secret_id = "..."`, `token: ...` and friends.
const ASSIGNED_SECRET: &str = r#"(?i)\b(secret(_id)?|token)\s*[=:]\s*"?[A-Za-z0-9._-]+"?"#;
/// `X-Consul-Token: ...` style request headers.
const TOKEN_HEADER: &str = r"(?i)\bx-[a-z]+-token\s*:\s*[A-Za-z0-9._-]+";
const BEARER: &str = r"(?i)\bbearer\s+[A-Za-z0-9._-]+";

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Base filter (`info`, `bastion_core=debug`, ...); defaults to `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Extra `target=level` directives, e.g. `bastion_core::consensus=debug`.
    #[serde(default)]
    pub directives: Vec<String>,

    /// Emit an event when a span (a write, a replay) closes, with its timing.
    #[serde(default = "default_true")]
    pub span_close: bool,

    #[serde(default = "default_true")]
    pub include_location: bool,

    /// Scrub token secrets from error messages.
    #[serde(default = "default_true")]
    pub redact_secrets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directives: Vec::new(),
            span_close: true,
            include_location: true,
            redact_secrets: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redaction
// ═══════════════════════════════════════════════════════════════════════════════

/// Scrubs token secrets out of free-form text.
#[derive(Debug, Clone)]
pub struct SecretRedactor {
    patterns: Vec<Regex>,
}

impl SecretRedactor {
    pub fn new(enabled: bool) -> Self {
        let patterns = if enabled {
            [TOKEN_HEADER, ASSIGNED_SECRET, BEARER]
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect()
        } else {
            Vec::new()
        };
        Self { patterns }
    }

    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Replace every secret in `text` with [`REDACTED`].
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for pattern in &self.patterns {
            let replaced = match pattern.replace_all(&out, REDACTED) {
                Cow::Owned(replaced) => Some(replaced),
                Cow::Borrowed(_) => None,
            };
            if let Some(replaced) = replaced {
                out = Cow::Owned(replaced);
            }
        }
        out
    }

    /// The process-wide redactor, enabled unless logging configured otherwise.
    pub fn global() -> &'static SecretRedactor {
        REDACTOR.get_or_init(|| SecretRedactor::new(true))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriber
// ═══════════════════════════════════════════════════════════════════════════════

/// Install the global subscriber.
///
/// `development` swaps the default JSON output for the pretty format unless a
/// format was chosen explicitly.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let _ = REDACTOR.set(SecretRedactor::new(config.redact_secrets));

    let mut filter = EnvFilter::try_new(&config.level)?;
    for directive in &config.directives {
        filter = filter.add_directive(directive.parse()?);
    }

    let format = match (&config.format, environment) {
        (LogFormat::Json, "development") => LogFormat::Pretty,
        (format, _) => format.clone(),
    };

    let span_events = if config.span_close {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(true);

    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_token_secrets() {
        let redactor = SecretRedactor::new(true);

        let msg = r#"bootstrap failed for secret_id="9f1c-22ab" in dc1"#;
        assert_eq!(redactor.redact(msg), "bootstrap failed for [REDACTED] in dc1");
        assert_eq!(redactor.redact("X-Consul-Token: abc123 rejected"), "[REDACTED] rejected");
        assert_eq!(redactor.redact("Authorization: Bearer abc.def"), "Authorization: [REDACTED]");
    }

    #[test]
    fn test_plain_text_is_borrowed() {
        let redactor = SecretRedactor::new(true);
        let normal = "Policy \"svc-write\" not found";
        assert!(matches!(redactor.redact(normal), Cow::Borrowed(s) if s == normal));
    }

    #[test]
    fn test_disabled_redactor_passes_through() {
        let redactor = SecretRedactor::new(false);
        assert!(!redactor.is_enabled());
        assert_eq!(redactor.redact("token=root"), "token=root");
    }

    #[test]
    fn test_logging_config_from_json() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"format": "compact", "directives": ["bastion_core::consensus=debug"], "redact_secrets": false}"#,
        )
        .unwrap();
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.directives.len(), 1);
        assert!(config.span_close);
        assert!(!config.redact_secrets);
    }
}
