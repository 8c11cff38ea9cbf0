use serde::Serialize;

/// Triage priority of an operator alert. Ordering follows delivery order:
/// critical first, info last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// An operator notification generated during a pass. Never persisted; the same
/// condition produces the same alert on every pass while it holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub key: &'static str,
    pub message: String,
}

impl Alert {
    pub fn critical(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            key,
            message: message.into(),
        }
    }

    pub fn warning(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            key,
            message: message.into(),
        }
    }

    pub fn info(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            key,
            message: message.into(),
        }
    }
}
