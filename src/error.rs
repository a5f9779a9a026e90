use thiserror::Error;

/// Failures the provisioning run distinguishes between. Everything else travels as a
/// plain `anyhow::Error`.
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// Static inputs (dataset tree, users, homes) are missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two mutually exclusive options were requested together.
    #[error("conflicting options: {0}")]
    Conflict(String),

    /// An external command exited unsuccessfully.
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

impl Error {
    pub(crate) fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn conflict<T: Into<String>>(msg: T) -> Self {
        Self::Conflict(msg.into())
    }
}
