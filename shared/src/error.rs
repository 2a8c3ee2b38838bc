use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ConversationIdKey, TeamName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Network-class failures. Logged only; chat isn't going to work anyway.
    Transient,
    /// Rejected by the service. Surfaced on the message or as a notice.
    Fatal,
    /// Local state raced with the UI. Logged and the operation is dropped.
    Invariant,
    /// The service broke its contract. Propagated to the caller.
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorClass {
    Network,
    Timeout,
    GenericApi,
    Rejected,
    Identify,
    Permission,
    Other,
}

impl RemoteErrorClass {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::GenericApi => "GENERIC_API_ERROR",
            Self::Rejected => "REJECTED",
            Self::Identify => "IDENTIFY_FAILED",
            Self::Permission => "FORBIDDEN",
            Self::Other => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::GenericApi)
    }

    #[must_use]
    pub const fn severity(self) -> ErrorSeverity {
        if self.is_transient() {
            ErrorSeverity::Transient
        } else {
            ErrorSeverity::Fatal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{}] {message}", .class.code())]
pub struct RemoteError {
    pub class: RemoteErrorClass,
    pub message: String,
}

impl RemoteError {
    pub fn new(class: RemoteErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorClass::Network, message)
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::new(RemoteErrorClass::Timeout, "request timed out")
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorClass::Rejected, message)
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.class.is_transient()
    }

    /// The username named in an identify failure, e.g. `failed to identify "bob"`.
    #[must_use]
    pub fn identify_failed_user(&self) -> Option<&str> {
        if self.class != RemoteErrorClass::Identify {
            return None;
        }
        let start = self.message.find('"')? + 1;
        let len = self.message[start..].find('"')?;
        Some(&self.message[start..start + len]).filter(|name| !name.is_empty())
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.class {
            RemoteErrorClass::Network | RemoteErrorClass::GenericApi => {
                "Unable to reach the chat service.".into()
            }
            RemoteErrorClass::Timeout => "The request timed out.".into(),
            RemoteErrorClass::Identify => {
                "Some participants could not be verified.".into()
            }
            RemoteErrorClass::Permission => {
                "You don't have permission to do that here.".into()
            }
            RemoteErrorClass::Rejected | RemoteErrorClass::Other => self.message.clone(),
        }
    }
}

/// Contract violations that are worth surfacing loudly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("service response is missing {what}")]
    MissingRemoteData { what: &'static str },
    #[error("channel {channel} of team {team} does not exist")]
    NonExistentChannel { team: TeamName, channel: String },
    #[error("conversation {0} is not a valid service identity")]
    InvalidIdentity(ConversationIdKey),
}

impl EngineError {
    #[must_use]
    pub const fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Unexpected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level message shown to the user outside of any single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    pub severity: ErrorSeverity,
}

impl Notice {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: ErrorSeverity::Fatal,
        }
    }

    /// `None` for transient failures, which are only logged.
    #[must_use]
    pub fn from_remote(error: &RemoteError) -> Option<Self> {
        match error.class.severity() {
            ErrorSeverity::Transient => None,
            severity => Some(Self {
                message: error.user_facing_message(),
                severity,
            }),
        }
    }

    #[must_use]
    pub fn from_engine_error(error: &EngineError) -> Self {
        Self {
            message: error.to_string(),
            severity: error.severity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_timeout_and_generic_are_transient() {
        assert!(RemoteError::network("offline").is_transient());
        assert!(RemoteError::timeout().is_transient());
        assert!(RemoteError::new(RemoteErrorClass::GenericApi, "x").is_transient());
        assert!(!RemoteError::rejected("too big").is_transient());
        assert!(!RemoteError::new(RemoteErrorClass::Permission, "no").is_transient());
    }

    #[test]
    fn only_fatal_remote_errors_become_notices() {
        assert_eq!(Notice::from_remote(&RemoteError::timeout()), None);
        let notice = Notice::from_remote(&RemoteError::new(RemoteErrorClass::Permission, "no"));
        assert_eq!(
            notice,
            Some(Notice {
                message: "You don't have permission to do that here.".into(),
                severity: ErrorSeverity::Fatal,
            })
        );
    }

    #[test]
    fn identify_error_names_the_user() {
        let err = RemoteError::new(RemoteErrorClass::Identify, "failed to identify \"bob\"");
        assert_eq!(err.identify_failed_user(), Some("bob"));
        assert_eq!(RemoteError::rejected("\"bob\"").identify_failed_user(), None);
    }

    #[test]
    fn display_includes_code() {
        let err = RemoteError::rejected("message too long");
        assert_eq!(err.to_string(), "[REJECTED] message too long");
    }
}
