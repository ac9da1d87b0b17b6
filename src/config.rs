use std::time::Duration;

use clap::Parser;

use crate::controller::{AdvancePolicy, ControllerSettings};
use crate::error::{BotError, Result};
use crate::manifest::{self, ManifestLocation};
use crate::source::{self, AudioBase, PlaybackMode};
use crate::transcode::{self, TranscodeSettings};

/// Command-line arguments; every option can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "tod-stream")]
#[command(about = "Streams a playlist into a Discord voice channel")]
#[command(version)]
pub struct Args {
    /// Discord bot token
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Voice channel to stream into
    #[arg(long, env = "CHANNEL_ID")]
    pub channel_id: Option<u64>,

    /// Manifest URL, JSON file or directory of audio files
    #[arg(long, env = "MANIFEST_URL")]
    pub manifest: Option<String>,

    /// Static comma separated track list, used when no manifest is given
    #[arg(long, env = "TRACKS", value_delimiter = ',')]
    pub tracks: Vec<String>,

    /// URL or directory that track identifiers are relative to
    #[arg(long, env = "AUDIO_BASE_URL")]
    pub audio_base: Option<String>,

    /// Attempts at loading the manifest before giving up
    #[arg(long, env = "MANIFEST_RETRIES", default_value_t = manifest::DEFAULT_MAX_ATTEMPTS)]
    pub manifest_retries: u32,

    /// Delay between manifest attempts
    #[arg(long, env = "MANIFEST_RETRY_DELAY_MS", default_value_t = 2000)]
    pub manifest_retry_delay_ms: u64,

    #[arg(long, env = "ADVANCE_POLICY", value_enum, default_value_t = AdvancePolicy::Cyclic)]
    pub advance_policy: AdvancePolicy,

    #[arg(long, env = "PLAYBACK_MODE", value_enum, default_value_t = PlaybackMode::Direct)]
    pub playback_mode: PlaybackMode,

    /// Decoder binary used in transcoded mode
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Upper bound in seconds for the decoder's reconnect delay
    #[arg(long, env = "RECONNECT_DELAY_MAX", default_value_t = transcode::DEFAULT_RECONNECT_DELAY_MAX)]
    pub reconnect_delay_max: u32,

    /// Seconds of silence padded onto each transcoded track
    #[arg(long, env = "TRANSCODE_PAD_SECS")]
    pub pad_secs: Option<f32>,

    #[arg(long, env = "ERROR_COOLDOWN_MS", default_value_t = 500)]
    pub error_cooldown_ms: u64,

    #[arg(long, env = "TRACK_GAP_MS", default_value_t = 0)]
    pub track_gap_ms: u64,

    #[arg(long, env = "READY_TIMEOUT_SECS", default_value_t = 20)]
    pub ready_timeout_secs: u64,

    /// Index of the first track to play
    #[arg(long, env = "START_INDEX", default_value_t = 0)]
    pub start_index: usize,
}

/// Validated settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub channel_id: u64,
    pub manifest: ManifestLocation,
    pub manifest_retries: u32,
    pub manifest_retry_delay: Duration,
    pub audio_base: Option<AudioBase>,
    pub playback_mode: PlaybackMode,
    pub transcode: TranscodeSettings,
    pub controller: ControllerSettings,
    pub ready_timeout: Duration,
}

impl Config {
    /// Checks everything up front and names every missing setting at once.
    pub fn from_args(args: Args) -> Result<Self> {
        tracing::info!("TOKEN: {}", presence(args.token.is_some()));
        tracing::info!("CHANNEL_ID: {}", presence(args.channel_id.is_some()));

        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        let token = args.token.filter(|t| !t.trim().is_empty());
        if token.is_none() {
            missing.push("TOKEN");
        }
        match args.channel_id {
            None => missing.push("CHANNEL_ID"),
            Some(0) => invalid.push("CHANNEL_ID must be non-zero".to_string()),
            Some(_) => {}
        }

        let tracks: Vec<String> = args
            .tracks
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let manifest = match args.manifest.filter(|m| !m.trim().is_empty()) {
            Some(raw) => Some(ManifestLocation::parse(raw.trim())),
            None if !tracks.is_empty() => Some(ManifestLocation::Static(tracks)),
            None => {
                missing.push("MANIFEST_URL or TRACKS");
                None
            }
        };

        let audio_base = match args.audio_base.filter(|b| !b.trim().is_empty()) {
            Some(raw) => Some(AudioBase::parse(raw.trim())),
            None => manifest
                .as_ref()
                .and_then(ManifestLocation::directory)
                .map(|dir| AudioBase::Path(dir.to_path_buf())),
        };
        if audio_base.is_none() {
            match &manifest {
                Some(ManifestLocation::Static(tracks)) if tracks.iter().any(|t| !source::is_url(t)) => {
                    missing.push("AUDIO_BASE_URL")
                }
                Some(ManifestLocation::File(_) | ManifestLocation::Remote(_)) => tracing::info!(
                    "AUDIO_BASE_URL not set; only absolute track URLs in the manifest will play"
                ),
                _ => {}
            }
        }

        if args.manifest_retries == 0 {
            invalid.push("MANIFEST_RETRIES must be at least 1".to_string());
        }
        if let Some(pad) = args.pad_secs {
            if !pad.is_finite() || pad < 0.0 {
                invalid.push(format!("TRANSCODE_PAD_SECS must be a non-negative number, got {}", pad));
            }
        }

        if !missing.is_empty() || !invalid.is_empty() {
            let mut problems = Vec::new();
            if !missing.is_empty() {
                problems.push(format!("missing {}", missing.join(", ")));
            }
            problems.extend(invalid);
            return Err(BotError::Config(problems.join("; ")));
        }

        // Every None above pushed onto `missing`, so these are all present.
        let (Some(token), Some(channel_id), Some(manifest)) = (token, args.channel_id, manifest)
        else {
            return Err(BotError::Config("incomplete configuration".to_string()));
        };

        Ok(Self {
            token,
            channel_id,
            manifest,
            manifest_retries: args.manifest_retries,
            manifest_retry_delay: Duration::from_millis(args.manifest_retry_delay_ms),
            audio_base,
            playback_mode: args.playback_mode,
            transcode: TranscodeSettings {
                program: args.ffmpeg,
                reconnect_delay_max: args.reconnect_delay_max,
                pad_secs: args.pad_secs,
            },
            controller: ControllerSettings {
                policy: args.advance_policy,
                start_index: args.start_index,
                track_gap: Duration::from_millis(args.track_gap_ms),
                error_cooldown: Duration::from_millis(args.error_cooldown_ms),
            },
            ready_timeout: Duration::from_secs(args.ready_timeout_secs),
        })
    }
}

fn presence(found: bool) -> &'static str {
    if found {
        "found"
    } else {
        "missing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Built directly; exported TOKEN, CHANNEL_ID etc. must not leak into tests.
    fn args() -> Args {
        Args {
            token: Some("secret".into()),
            channel_id: Some(42),
            manifest: None,
            tracks: Vec::new(),
            audio_base: None,
            manifest_retries: manifest::DEFAULT_MAX_ATTEMPTS,
            manifest_retry_delay_ms: 2000,
            advance_policy: AdvancePolicy::Cyclic,
            playback_mode: PlaybackMode::Direct,
            ffmpeg: "ffmpeg".into(),
            reconnect_delay_max: transcode::DEFAULT_RECONNECT_DELAY_MAX,
            pad_secs: None,
            error_cooldown_ms: 500,
            track_gap_ms: 0,
            ready_timeout_secs: 20,
            start_index: 0,
        }
    }

    fn remote_args() -> Args {
        Args {
            manifest: Some("https://host/manifest.json".into()),
            audio_base: Some("https://host/audio/".into()),
            ..args()
        }
    }

    #[test]
    fn command_line_flags_fill_args() {
        let args = Args::try_parse_from([
            "tod-stream",
            "--token",
            "secret",
            "--channel-id",
            "42",
            "--tracks",
            "a.mp3, b.mp3",
            "--advance-policy",
            "finite",
            "--playback-mode",
            "transcoded",
            "--pad-secs",
            "2",
        ])
        .unwrap();

        assert_eq!(args.token.as_deref(), Some("secret"));
        assert_eq!(args.channel_id, Some(42));
        assert_eq!(args.tracks, vec!["a.mp3", " b.mp3"]);
        assert_eq!(args.advance_policy, AdvancePolicy::Finite);
        assert_eq!(args.playback_mode, PlaybackMode::Transcoded);
        assert_eq!(args.pad_secs, Some(2.0));
    }

    #[test]
    fn full_configuration() {
        let config = Config::from_args(Args {
            advance_policy: AdvancePolicy::Finite,
            playback_mode: PlaybackMode::Transcoded,
            pad_secs: Some(2.0),
            ..remote_args()
        })
        .unwrap();

        assert_eq!(config.channel_id, 42);
        assert_eq!(
            config.manifest,
            ManifestLocation::Remote("https://host/manifest.json".into())
        );
        assert_eq!(config.audio_base, Some(AudioBase::Url("https://host/audio/".into())));
        assert_eq!(config.controller.policy, AdvancePolicy::Finite);
        assert_eq!(config.playback_mode, PlaybackMode::Transcoded);
        assert_eq!(config.transcode.pad_secs, Some(2.0));
        assert_eq!(config.manifest_retries, 3);
        assert_eq!(config.manifest_retry_delay, Duration::from_secs(2));
        assert_eq!(config.controller.error_cooldown, Duration::from_millis(500));
    }

    #[test]
    fn static_tracks_stand_in_for_a_manifest() {
        let config = Config::from_args(Args {
            tracks: vec!["a.mp3".into(), " b.mp3".into()],
            audio_base: Some("https://host/".into()),
            ..args()
        })
        .unwrap();
        assert_eq!(
            config.manifest,
            ManifestLocation::Static(vec!["a.mp3".into(), "b.mp3".into()])
        );
    }

    #[test]
    fn directory_manifest_defaults_audio_base() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_args(Args {
            manifest: Some(dir.path().to_string_lossy().into_owned()),
            ..args()
        })
        .unwrap();
        assert_eq!(config.audio_base, Some(AudioBase::Path(dir.path().to_path_buf())));
    }

    #[test]
    fn enumerates_every_missing_setting() {
        let result = Config::from_args(Args {
            token: None,
            channel_id: None,
            ..args()
        });
        match result {
            Err(BotError::Config(message)) => {
                assert!(message.contains("TOKEN"));
                assert!(message.contains("CHANNEL_ID"));
                assert!(message.contains("MANIFEST_URL or TRACKS"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_zero_retries() {
        let result = Config::from_args(Args {
            manifest_retries: 0,
            ..remote_args()
        });
        assert!(matches!(result, Err(BotError::Config(m)) if m.contains("MANIFEST_RETRIES")));
    }

    #[test]
    fn remote_manifest_runs_without_audio_base() {
        let config = Config::from_args(Args {
            audio_base: None,
            ..remote_args()
        })
        .unwrap();
        assert_eq!(config.audio_base, None);
    }

    #[test]
    fn absolute_static_tracks_need_no_audio_base() {
        let config = Config::from_args(Args {
            tracks: vec!["https://cdn/a.ogg".into(), "https://cdn/b.ogg".into()],
            ..args()
        })
        .unwrap();
        assert_eq!(config.audio_base, None);
    }

    #[test]
    fn relative_static_tracks_need_audio_base() {
        let result = Config::from_args(Args {
            tracks: vec!["https://cdn/a.ogg".into(), "b.ogg".into()],
            ..args()
        });
        assert!(matches!(result, Err(BotError::Config(m)) if m.contains("AUDIO_BASE_URL")));
    }
}
