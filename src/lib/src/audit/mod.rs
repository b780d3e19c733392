//! Audit logging for root rotation operations.
//!
//! Every change to a Factory's trust roots leaves a structured event, so an
//! operator can reconstruct who generated which key, which transaction
//! carried it and whether it was applied.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tufroot::audit::{self, AuditConfig, LogDestination};
//!
//! // Initialize audit logging (typically once at program start)
//! audit::init(AuditConfig {
//!     enabled: true,
//!     destination: LogDestination::File("/var/log/tufroot-audit.log".into()),
//!     json_format: true,
//!     ..Default::default()
//! })?;
//! ```
//!
//! # Event Types
//!
//! - `transaction.init` - Transaction opened
//! - `transaction.update` - Staged state replaced
//! - `transaction.apply.success` - Staged roots published
//! - `transaction.apply.failure` - Apply rejected or interrupted
//! - `transaction.cancel` - Staged state discarded
//! - `key.generated` - New offline key written to a credentials archive
//! - `key.retired` - Key removed from a role
//! - `manifest.resigned` - Production or wave manifest signed with a new key
//! - `creds.saved` - Credentials archive replaced
//!
//! # JSON Output Example
//!
//! ```json
//! {
//!   "timestamp": "2026-01-04T20:00:00Z",
//!   "level": "INFO",
//!   "target": "tufroot::audit",
//!   "event_type": "key.generated",
//!   "correlation_id": "0f1e6a52-...",
//!   "role": "targets",
//!   "key_type": "ED25519",
//!   "key_id": "5d8a..."
//! }
//! ```

use crate::error::TufError;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Global audit configuration state
static AUDIT_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Audit log configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Enable audit logging
    pub enabled: bool,
    /// Log destination
    pub destination: LogDestination,
    /// Use JSON format
    pub json_format: bool,
    /// Log level filter (default: "tufroot::audit=info")
    pub filter: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: LogDestination::Stderr,
            json_format: true,
            filter: "tufroot::audit=info".to_string(),
        }
    }
}

/// Audit log destination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    #[default]
    Stderr,
    /// Append to a file
    File(String),
}

/// Initialize the audit logging subsystem.
///
/// Subsequent calls are ignored.
pub fn init(config: AuditConfig) -> Result<(), TufError> {
    if AUDIT_INITIALIZED.get().is_some() {
        return Ok(());
    }

    if !config.enabled {
        let _ = AUDIT_INITIALIZED.set(true);
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let res = match config.destination {
        LogDestination::Stdout => {
            if config.json_format {
                install(
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .json()
                                .with_target(true)
                                .with_span_events(FmtSpan::NONE)
                                .with_writer(std::io::stdout),
                        )
                )
            } else {
                install(
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_target(true).with_writer(std::io::stdout))
                )
            }
        }
        LogDestination::Stderr => {
            if config.json_format {
                install(
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .json()
                                .with_target(true)
                                .with_span_events(FmtSpan::NONE)
                                .with_writer(std::io::stderr),
                        )
                )
            } else {
                install(
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                )
            }
        }
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    TufError::ConfigError(format!("Cannot open audit log '{}': {}", path, e))
                })?;

            if config.json_format {
                install(
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .json()
                                .with_target(true)
                                .with_span_events(FmtSpan::NONE)
                                .with_writer(std::sync::Mutex::new(file)),
                        )
                )
            } else {
                install(
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .with_target(true)
                                .with_ansi(false)
                                .with_writer(std::sync::Mutex::new(file)),
                        )
                )
            }
        }
    };
    res?;

    let _ = AUDIT_INITIALIZED.set(true);
    Ok(())
}

fn install<S>(subscriber: S) -> Result<(), TufError>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TufError::ConfigError(format!("Audit logging: {}", e)))
}

/// Generate a new correlation ID for tracking related audit events.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Audit Event Functions
// ============================================================================

pub fn log_transaction_init(correlation_id: &str, txid: &str, message: &str) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "transaction.init",
        correlation_id = correlation_id,
        txid = txid,
        change_reason = %sanitize_error_message(message),
        "TUF root transaction opened"
    );
}

pub fn log_transaction_update(
    correlation_id: &str,
    txid: &str,
    operation: &str,
    ci_version: u64,
    prod_staged: bool,
) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "transaction.update",
        correlation_id = correlation_id,
        txid = txid,
        operation = operation,
        ci_version = ci_version,
        prod_staged = prod_staged,
        "Staged TUF root updated"
    );
}

pub fn log_apply_success(correlation_id: &str, txid: &str) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "transaction.apply.success",
        correlation_id = correlation_id,
        txid = txid,
        "TUF root transaction applied"
    );
}

pub fn log_apply_failure(
    correlation_id: &str,
    txid: &str,
    fatal: bool,
    error_type: &str,
    error_message: &str,
) {
    let safe_message = sanitize_error_message(error_message);

    tracing::warn!(
        target: "tufroot::audit",
        event_type = "transaction.apply.failure",
        correlation_id = correlation_id,
        txid = txid,
        fatal = fatal,
        error_type = error_type,
        error_message = %safe_message,
        "TUF root transaction apply failed"
    );
}

pub fn log_transaction_cancel(correlation_id: &str, txid: &str) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "transaction.cancel",
        correlation_id = correlation_id,
        txid = txid,
        "TUF root transaction canceled"
    );
}

/// Log a key generation event.
pub fn log_key_generation(correlation_id: &str, role: &str, key_type: &str, key_id: &str) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "key.generated",
        correlation_id = correlation_id,
        role = role,
        key_type = key_type,
        key_id = key_id,
        "Offline key generated"
    );
}

pub fn log_key_retired(correlation_id: &str, role: &str, key_id: &str) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "key.retired",
        correlation_id = correlation_id,
        role = role,
        key_id = key_id,
        "Key removed from role"
    );
}

/// `kind` is `prod` or `wave`.
pub fn log_manifest_resigned(correlation_id: &str, kind: &str, name: &str, key_id: &str) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "manifest.resigned",
        correlation_id = correlation_id,
        kind = kind,
        name = name,
        key_id = key_id,
        "Targets manifest signed"
    );
}

pub fn log_creds_saved(correlation_id: &str, path: &str, backup: Option<&str>) {
    tracing::info!(
        target: "tufroot::audit",
        event_type = "creds.saved",
        correlation_id = correlation_id,
        path = path,
        backup = backup.unwrap_or("n/a"),
        "Offline credentials saved"
    );
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Sanitize error messages to avoid leaking sensitive information.
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let sanitized = message
        // Remove anything that looks like a token
        .split_whitespace()
        .map(|word| {
            if word.len() > 40 && word.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                "[REDACTED]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if sanitized.chars().count() > 500 {
        let truncated: String = sanitized.chars().take(497).collect();
        format!("{}...", truncated)
    } else {
        sanitized
    }
}
