use thiserror::Error;

/// A mapping rule or instance descriptor that cannot be used. Always fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mapping rule #{rule}: missing required property `{property}`")]
    MissingProperty { rule: usize, property: &'static str },
    #[error("mapping rule #{rule}: unknown {what} `{value}`")]
    UnknownValue {
        rule: usize,
        what: &'static str,
        value: String,
    },
    #[error("mapping rule #{rule}: {message}")]
    InvalidRule { rule: usize, message: String },
    #[error("instance `{instance}`: {message}")]
    InvalidInstance { instance: String, message: String },
}

/// Failure reported by a tracker client for a single call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unauthorized (401): check the API token")]
    Unauthorized,
    #[error("forbidden (403): the token lacks permission")]
    Forbidden,
    #[error("not found (404): {0}")]
    NotFound(String),
    #[error("gone (410): {0}")]
    Gone(String),
    #[error("rejected by tracker: {0}")]
    ValidationFailed(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl TrackerError {
    /// Auth failures end the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::Unauthorized | TrackerError::Forbidden)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::Transient(_))
    }

    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 => TrackerError::Unauthorized,
            403 => TrackerError::Forbidden,
            404 => TrackerError::NotFound(detail),
            410 => TrackerError::Gone(detail),
            408 | 429 | 500..=599 => TrackerError::Transient(format!("HTTP {status}: {detail}")),
            _ => TrackerError::ValidationFailed(format!("HTTP {status}: {detail}")),
        }
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            TrackerError::Transient(err.to_string())
        } else if err.is_decode() {
            TrackerError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TrackerError::from_status(status.as_u16(), err.to_string())
        } else {
            TrackerError::Transient(err.to_string())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("no mapping for value `{value}` on field `{field}`")]
    Unmapped { value: String, field: String },
}
