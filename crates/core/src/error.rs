pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required server-side settings or credentials are absent.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The remote refused (or failed) to open a resumable session.
    #[error("session error: {message}")]
    Session { message: String },

    /// A chunk PUT came back with neither 308 nor 2xx.
    #[error("chunk transport error: {message}")]
    ChunkTransport {
        status: Option<u16>,
        message: String,
        body: String,
    },

    /// The user stopped the transfer. Not a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("remote api error: {message}")]
    Remote { message: String, status: Option<u16> },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            status: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Stable machine-readable code shared by the relay and the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "config.invalid",
            Self::Session { .. } => "upload.session_failed",
            Self::ChunkTransport { .. } => "upload.chunk_failed",
            Self::Cancelled => "task.cancelled",
            Self::Validation { .. } => "request.invalid",
            Self::Remote { status: Some(404), .. } => "remote.not_found",
            Self::Remote { .. } => "remote.failed",
            Self::Io(_) => "io.failed",
            Self::Http(_) => "http.failed",
            Self::Json(_) => "json.invalid",
        }
    }

    /// Network hiccups are worth retrying by hand; everything else needs a fix first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::ChunkTransport { .. } | Self::Session { .. }
        )
    }
}
