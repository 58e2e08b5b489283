use std::fmt;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::types::{AccountId, CorrelationId};

pub type Result<T> = std::result::Result<T, SessionError>;

/// Broker codes that mean the access token or account authorisation is gone.
pub const AUTH_INVALID_CODES: &[&str] = &[
    "OA_AUTH_TOKEN_EXPIRED",
    "ACCOUNT_NOT_AUTHORIZED",
    "CH_ACCESS_TOKEN_INVALID",
    "CH_CLIENT_NOT_AUTHENTICATED",
];

pub const ALREADY_SUBSCRIBED: &str = "ALREADY_SUBSCRIBED";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request {correlation_id} timed out after {attempts} attempt(s)")]
    Timeout {
        correlation_id: CorrelationId,
        attempts: u32,
    },
    #[error("broker rejected request: {description} (code: {code}, correlation_id: {})", fmt_correlation(.correlation_id))]
    BrokerRejected {
        code: String,
        description: String,
        correlation_id: Option<CorrelationId>,
    },
    #[error("authorisation revoked for account {account}")]
    AuthRevoked { account: AccountId },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("session not ready (state: {0:?})")]
    NotReady(ConnectionState),
    #[error("reconnect attempts exhausted after {attempts} attempt(s)")]
    ReconnectExhausted { attempts: u32 },
    #[error("request cancelled: {0}")]
    Cancelled(&'static str),
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn fmt_correlation(id: &Option<CorrelationId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "-".to_string(),
    }
}

/// Coarse error taxonomy shared by the session and the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Timeout,
    BrokerRejected,
    AuthRevoked,
    ValidationFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BrokerRejected => "broker_rejected",
            ErrorKind::AuthRevoked => "auth_revoked",
            ErrorKind::ValidationFailed => "validation_failed",
        };
        f.write_str(name)
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport(_)
            | SessionError::Io(_)
            | SessionError::NotReady(_)
            | SessionError::ReconnectExhausted { .. }
            | SessionError::Cancelled(_)
            | SessionError::Closed => ErrorKind::Transport,
            SessionError::Protocol(_) | SessionError::Json(_) => ErrorKind::Protocol,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::BrokerRejected { .. } => ErrorKind::BrokerRejected,
            SessionError::AuthRevoked { .. } => ErrorKind::AuthRevoked,
            SessionError::ValidationFailed(_) => ErrorKind::ValidationFailed,
        }
    }

    /// Only failures with no broker verdict may be retried, and only for
    /// requests without financial side effects.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Timeout { .. } | SessionError::Transport(_))
    }

    pub fn rejected(
        code: impl Into<String>,
        description: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        SessionError::BrokerRejected {
            code: code.into(),
            description: description.into(),
            correlation_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerCodeClass {
    AuthInvalid,
    AlreadySubscribed,
    Rejected,
}

pub fn classify_broker_code(code: &str) -> BrokerCodeClass {
    if AUTH_INVALID_CODES.contains(&code) {
        BrokerCodeClass::AuthInvalid
    } else if code == ALREADY_SUBSCRIBED {
        BrokerCodeClass::AlreadySubscribed
    } else {
        BrokerCodeClass::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_codes() {
        assert_eq!(
            classify_broker_code("CH_ACCESS_TOKEN_INVALID"),
            BrokerCodeClass::AuthInvalid
        );
        assert_eq!(
            classify_broker_code("ALREADY_SUBSCRIBED"),
            BrokerCodeClass::AlreadySubscribed
        );
        assert_eq!(
            classify_broker_code("NOT_ENOUGH_MONEY"),
            BrokerCodeClass::Rejected
        );
    }

    #[test]
    fn only_timeouts_and_transport_are_retryable() {
        let timeout = SessionError::Timeout {
            correlation_id: CorrelationId::new(7),
            attempts: 3,
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let rejected = SessionError::rejected("MARKET_CLOSED", "market closed", None);
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.kind(), ErrorKind::BrokerRejected);
        assert!(rejected.to_string().contains("MARKET_CLOSED"));
    }
}
