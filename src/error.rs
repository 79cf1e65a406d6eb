use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Shroud proxy
#[derive(Error, Debug)]
pub enum ShroudError {
    // Configuration errors (raised once at construction, fatal)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid target origin {url}: {source}")]
    InvalidOrigin {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Per-request forwarding errors
    #[error("Forwarding failed: {0}")]
    Forwarding(String),

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Failed to rewrite response: {0}")]
    Rewrite(String),

    // Codec errors
    #[error("Unknown content encoding: {0}")]
    UnknownEncoding(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // Transport errors
    #[error("Failed to initialize SOCKS5 dialer: {0}")]
    TransportInit(String),

    // TLS errors
    #[error("Certificate generation failed: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Shroud operations
pub type Result<T> = std::result::Result<T, ShroudError>;

impl ShroudError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // Construction-time errors never reach a client; if one does, it is
            // an internal fault.
            ShroudError::InvalidConfig(_)
            | ShroudError::InvalidOrigin { .. }
            | ShroudError::MissingEnvVar(_)
            | ShroudError::Certificate(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway: every per-request failure, attempted exactly once
            ShroudError::Forwarding(_)
            | ShroudError::BodyRead(_)
            | ShroudError::Rewrite(_)
            | ShroudError::UnknownEncoding(_)
            | ShroudError::Codec(_)
            | ShroudError::TransportInit(_) => StatusCode::BAD_GATEWAY,

            ShroudError::Tls(_) | ShroudError::Io(_) | ShroudError::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this error is fatal at construction time
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ShroudError::InvalidConfig(_)
                | ShroudError::InvalidOrigin { .. }
                | ShroudError::MissingEnvVar(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ShroudError {
    fn from(err: hyper::Error) -> Self {
        ShroudError::Http(err.to_string())
    }
}
