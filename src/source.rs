//! Turns playlist identifiers into something the voice player can consume.

use std::path::PathBuf;

use crate::error::{BotError, Result};
use crate::transcode::{TranscodeCommand, TranscodeSettings};

/// How tracks reach the audio player. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PlaybackMode {
    /// The player fetches and decodes the address itself.
    #[default]
    Direct,
    /// An external decoder turns the address into raw PCM first.
    Transcoded,
}

/// Base that relative identifiers are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioBase {
    Url(String),
    Path(PathBuf),
}

impl AudioBase {
    pub fn parse(raw: &str) -> Self {
        if is_url(raw) {
            AudioBase::Url(raw.to_string())
        } else {
            AudioBase::Path(PathBuf::from(raw))
        }
    }
}

/// Fully resolved address of a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackAddress {
    Url(String),
    Path(PathBuf),
}

impl TrackAddress {
    pub fn as_input_arg(&self) -> String {
        match self {
            TrackAddress::Url(url) => url.clone(),
            TrackAddress::Path(path) => path.to_string_lossy().into_owned(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, TrackAddress::Url(_))
    }
}

impl std::fmt::Display for TrackAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackAddress::Url(url) => f.write_str(url),
            TrackAddress::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// What the runtime should hand to the voice session for one track.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayableSource {
    Direct(TrackAddress),
    Transcoded(TranscodeCommand),
}

pub struct TrackSourceResolver {
    base: Option<AudioBase>,
    mode: PlaybackMode,
    transcode: TranscodeSettings,
}

impl TrackSourceResolver {
    pub fn new(base: Option<AudioBase>, mode: PlaybackMode, transcode: TranscodeSettings) -> Self {
        Self {
            base,
            mode,
            transcode,
        }
    }

    pub fn address(&self, identifier: &str) -> Result<TrackAddress> {
        if is_url(identifier) {
            return Ok(TrackAddress::Url(identifier.to_string()));
        }
        match &self.base {
            Some(AudioBase::Url(base)) => Ok(TrackAddress::Url(join_url(base, identifier))),
            Some(AudioBase::Path(dir)) => Ok(TrackAddress::Path(dir.join(identifier))),
            None => Err(BotError::Playback(format!(
                "no audio base configured for relative track '{}'",
                identifier
            ))),
        }
    }

    pub fn resolve(&self, identifier: &str) -> Result<PlayableSource> {
        let address = self.address(identifier)?;
        Ok(match self.mode {
            PlaybackMode::Direct => PlayableSource::Direct(address),
            PlaybackMode::Transcoded => {
                PlayableSource::Transcoded(TranscodeCommand::new(&self.transcode, &address))
            }
        })
    }
}

pub(crate) fn is_url(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

/// Joins with exactly one `/` between base and identifier, without re-escaping.
pub fn join_url(base: &str, identifier: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        identifier.trim_start_matches('/')
    )
}
