use thiserror::Error;

/// Errors from talking to the matrix API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("unsupported API protocol {found:?} (expected {expected:?})")]
    ProtocolVersion { found: String, expected: &'static str },

    #[error("unsupported API mode {0:?}")]
    UnsupportedMode(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;
