use thiserror::Error;

const GENERIC_FAILURE: &str = "request to the studio service failed";

pub type StudioResult<T> = std::result::Result<T, StudioError>;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum StudioError {
    /// Rejected on the client before any network I/O.
    #[error("{0}")]
    Validation(String),
    /// Service unreachable, connection reset or timed out.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Structured non-2xx response from the service.
    #[error("service returned HTTP {status}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Backend { status: u16, detail: Option<String> },
    /// Response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    PartialData(String),
}

impl StudioError {
    pub fn validation(message: impl Into<String>) -> Self {
        StudioError::Validation(message.into())
    }

    pub fn backend(status: u16, detail: impl Into<String>) -> Self {
        StudioError::Backend {
            status,
            detail: Some(detail.into()),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            StudioError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, StudioError::Validation(_))
    }

    /// Text shown to the user. Backend details pass through verbatim;
    /// transport and shape failures collapse into one generic message.
    pub fn user_message(&self) -> String {
        match self {
            StudioError::Validation(message) => message.clone(),
            StudioError::Backend {
                detail: Some(detail),
                ..
            } => detail.clone(),
            StudioError::Backend { status, detail: None } => {
                format!("{GENERIC_FAILURE} (HTTP {status})")
            }
            StudioError::Transport(_) | StudioError::PartialData(_) => GENERIC_FAILURE.to_string(),
        }
    }
}

impl From<reqwest::Error> for StudioError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StudioError::PartialData(err.to_string())
        } else {
            StudioError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StudioError {
    fn from(err: serde_json::Error) -> Self {
        StudioError::PartialData(err.to_string())
    }
}
