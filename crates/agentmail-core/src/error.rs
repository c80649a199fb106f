use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },
    #[error("invalid message id: {id:?}")]
    InvalidId { id: String },
    #[error("message body is {size} bytes, limit is {limit}")]
    SizeLimitExceeded { size: usize, limit: usize },
    #[error("access denied: {agent} may not read {mailbox}")]
    AccessDenied { agent: String, mailbox: String },
    #[error("mailbox not found: {mailbox}")]
    NotFound { mailbox: String },
    #[error("message {id} already exists with different content")]
    Conflict { id: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("subscriber fell behind, resume from the last cursor")]
    Backpressure,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MailError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress { .. } => "invalid_address",
            Self::InvalidId { .. } => "invalid_id",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::AccessDenied { .. } => "access_denied",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Transport(_) => "transport",
            Self::Backpressure => "backpressure",
            Self::Protocol(_) => "protocol",
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Backpressure)
    }

    /// Rebuilds a classified error from a `{code, message, retryable}` frame.
    ///
    /// Structured fields are not carried on the wire, so variants that hold
    /// them get the remote message in their primary field.
    pub fn from_wire(code: &str, message: &str, retryable: bool) -> Self {
        let message = message.to_owned();
        match code {
            "invalid_address" => Self::InvalidAddress {
                address: message,
                reason: "rejected by daemon",
            },
            "invalid_id" => Self::InvalidId { id: message },
            "size_limit_exceeded" => Self::SizeLimitExceeded { size: 0, limit: 0 },
            "access_denied" => Self::AccessDenied {
                agent: String::new(),
                mailbox: message,
            },
            "not_found" => Self::NotFound { mailbox: message },
            "conflict" => Self::Conflict { id: message },
            "transport" => Self::Transport(message),
            "backpressure" => Self::Backpressure,
            "protocol" => Self::Protocol(message),
            _ if retryable => Self::Transport(message),
            _ => Self::Protocol(format!("{code}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_backpressure_are_retryable() {
        assert!(MailError::Transport("eof".to_owned()).retryable());
        assert!(MailError::Backpressure.retryable());
        assert!(!MailError::Protocol("bad frame".to_owned()).retryable());
        assert!(!MailError::NotFound {
            mailbox: "task".to_owned()
        }
        .retryable());
    }

    #[test]
    fn wire_codes_map_back_to_variants() {
        let err = MailError::from_wire("access_denied", "@bob", false);
        assert_eq!(err.code(), "access_denied");

        let err = MailError::from_wire("backpressure", "", true);
        assert!(matches!(err, MailError::Backpressure));

        let err = MailError::from_wire("mystery", "x", true);
        assert!(err.retryable());

        let err = MailError::from_wire("mystery", "x", false);
        assert_eq!(err.code(), "protocol");
    }
}
