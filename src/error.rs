use std::time::Duration;

/// Everything that can go wrong between loading the playlist and leaving the channel.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Manifest fetch failed after {attempts} attempt(s): {reason}")]
    Fetch { attempts: u32, reason: String },
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),
    #[error("Voice channel error: {0}")]
    Channel(String),
    #[error("Voice session was not ready within {0:?}")]
    SessionTimeout(Duration),
    #[error("Playback error: {0}")]
    Playback(String),
    #[error("Transcoder process error: {0}")]
    Process(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BotError> = std::result::Result<T, E>;
