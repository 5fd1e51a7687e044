use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("chat channel http error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat channel rejected message: {0}")]
    Rejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;
