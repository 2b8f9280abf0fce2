use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Authentication error: {0}")]
    Auth(#[from] core_auth::AuthError),

    #[error("Response could not be decoded: {0}")]
    Decode(String),
}

impl CoreError {
    /// The underlying auth error, if any.
    pub fn as_auth(&self) -> Option<&core_auth::AuthError> {
        match self {
            CoreError::Auth(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
