use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("circuit open for server '{0}'")]
    CircuitOpen(#[from] relay_resilience::CircuitOpenError),

    #[error("ssh delivery to '{server_id}' failed: {source}")]
    Delivery {
        server_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SshResult<T> = std::result::Result<T, SshError>;
