/// Error kinds from §7 of the design. `MalformedUpstreamFrame` has no variant
/// here: it is handled inline by the upstream client (the partial line is
/// pushed back onto the buffer), never surfaced to a caller.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown chatbot: {0}")]
    TenantUnknown(String),

    #[error("not found")]
    NotFound,

    #[error("failed to connect to upstream: {0}")]
    UpstreamConnectFailed(String),

    #[error("upstream stream failed mid-read: {0}")]
    UpstreamMidStreamFailed(String),

    #[error("failed to persist conversation: {0}")]
    PersistenceFailed(String),

    #[error("classification failed: {0}")]
    ClassificationFailed(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether this error should be reported to the HTTP caller as a 400
    /// rather than a 500. Kept here, rather than in the server crate, since
    /// it reflects the error taxonomy of §7, not transport concerns.
    pub fn is_client_error(&self) -> bool {
        matches!(self, CoreError::BadRequest(_) | CoreError::TenantUnknown(_))
    }
}
