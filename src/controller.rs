//! Playlist playback state machine.
//!
//! [`PlaybackController::handle`] is a pure transition function: it takes one
//! [`Event`], updates the controller's state and cursor, and returns the
//! [`Action`]s the runtime must execute, in order. No I/O happens here.

use std::time::Duration;

use crate::error::BotError;
use crate::manifest::TrackList;

/// What happens after the last track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AdvancePolicy {
    /// Wrap to the first track; playback never ends on its own.
    #[default]
    Cyclic,
    /// Stop and leave the channel after the last track.
    Finite,
}

/// Identifies one submission of a track to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackAttempt {
    pub id: AttemptId,
    pub index: usize,
    pub identifier: String,
    /// How many times the playlist has wrapped before this attempt.
    pub lap: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Connecting,
    Ready,
    Playing(PlaybackAttempt),
    Advancing,
    Stopped,
    Failed,
}

impl PlaybackState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Stopped | PlaybackState::Failed)
    }
}

#[derive(Debug)]
pub enum Event {
    /// The gateway is up; begin loading the playlist.
    Start,
    ManifestLoaded(TrackList),
    ManifestFailed(BotError),
    SessionReady,
    SessionFailed(BotError),
    PlayerIdle { attempt: AttemptId },
    PlayerError { attempt: AttemptId, message: String },
    /// `code` is `None` when the process was killed by a signal.
    ProcessExited { attempt: AttemptId, code: Option<i32> },
    CooldownElapsed,
    Shutdown,
}

#[derive(Debug)]
pub enum Outcome {
    /// A finite playlist played to the end.
    Finished,
    /// Shutdown was requested.
    Interrupted,
    Failed(BotError),
}

#[derive(Debug)]
pub enum Action {
    FetchManifest,
    JoinSession,
    Submit(PlaybackAttempt),
    Teardown(AttemptId),
    StartCooldown(Duration),
    Release,
    Exit(Outcome),
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub policy: AdvancePolicy,
    pub start_index: usize,
    /// Pause after a track finishes normally.
    pub track_gap: Duration,
    /// Pause after a track fails, to avoid a tight error loop.
    pub error_cooldown: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            policy: AdvancePolicy::Cyclic,
            start_index: 0,
            track_gap: Duration::ZERO,
            error_cooldown: Duration::from_millis(500),
        }
    }
}

pub struct PlaybackController {
    settings: ControllerSettings,
    state: PlaybackState,
    tracks: Option<TrackList>,
    cursor: usize,
    lap: u64,
    next_attempt: u64,
}

impl PlaybackController {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            settings,
            state: PlaybackState::Idle,
            tracks: None,
            cursor: 0,
            lap: 0,
            next_attempt: 1,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.state.is_terminal() {
            tracing::debug!("Ignoring {:?} after playback ended", event);
            return Vec::new();
        }

        match event {
            Event::Start => {
                if self.state != PlaybackState::Idle {
                    tracing::debug!("Already started; ignoring repeated start");
                    return Vec::new();
                }
                self.state = PlaybackState::Loading;
                vec![Action::FetchManifest]
            }
            Event::ManifestLoaded(tracks) => {
                if self.state != PlaybackState::Loading {
                    return Vec::new();
                }
                if self.settings.start_index >= tracks.len() {
                    self.state = PlaybackState::Failed;
                    return vec![Action::Exit(Outcome::Failed(BotError::Config(format!(
                        "start index {} is out of range for {} track(s)",
                        self.settings.start_index,
                        tracks.len()
                    ))))];
                }
                self.cursor = self.settings.start_index;
                self.tracks = Some(tracks);
                self.state = PlaybackState::Connecting;
                vec![Action::JoinSession]
            }
            Event::ManifestFailed(error) => {
                if self.state != PlaybackState::Loading {
                    return Vec::new();
                }
                self.state = PlaybackState::Failed;
                vec![Action::Exit(Outcome::Failed(error))]
            }
            Event::SessionReady => {
                if self.state != PlaybackState::Connecting {
                    return Vec::new();
                }
                self.state = PlaybackState::Ready;
                self.submit_current()
            }
            Event::SessionFailed(error) => {
                if self.state != PlaybackState::Connecting {
                    return Vec::new();
                }
                self.state = PlaybackState::Failed;
                vec![Action::Release, Action::Exit(Outcome::Failed(error))]
            }
            Event::PlayerIdle { attempt } => {
                if !self.is_current(attempt) {
                    tracing::debug!("Ignoring idle for stale attempt {}", attempt);
                    return Vec::new();
                }
                self.advance(attempt, self.settings.track_gap)
            }
            Event::PlayerError { attempt, message } => {
                if !self.is_current(attempt) {
                    tracing::debug!("Ignoring error for stale attempt {}: {}", attempt, message);
                    return Vec::new();
                }
                tracing::error!("Playback of attempt {} failed: {}", attempt, message);
                self.advance(attempt, self.settings.error_cooldown)
            }
            Event::ProcessExited { attempt, code } => {
                if code == Some(0) || !self.is_current(attempt) {
                    // Expected shutdown of a finished or superseded stream.
                    return Vec::new();
                }
                let status = code.map_or_else(|| "a signal".to_string(), |c| format!("code {}", c));
                tracing::error!("Transcoder for attempt {} exited with {} mid-stream", attempt, status);
                self.advance(attempt, self.settings.error_cooldown)
            }
            Event::CooldownElapsed => {
                if self.state != PlaybackState::Advancing {
                    return Vec::new();
                }
                self.submit_current()
            }
            Event::Shutdown => {
                let mut actions = Vec::new();
                if let PlaybackState::Playing(current) = &self.state {
                    actions.push(Action::Teardown(current.id));
                }
                if !matches!(self.state, PlaybackState::Idle | PlaybackState::Loading) {
                    actions.push(Action::Release);
                }
                actions.push(Action::Exit(Outcome::Interrupted));
                self.state = PlaybackState::Stopped;
                actions
            }
        }
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        matches!(&self.state, PlaybackState::Playing(current) if current.id == attempt)
    }

    fn submit_current(&mut self) -> Vec<Action> {
        let Some(identifier) = self
            .tracks
            .as_ref()
            .and_then(|tracks| tracks.get(self.cursor))
            .map(str::to_string)
        else {
            self.state = PlaybackState::Failed;
            return vec![
                Action::Release,
                Action::Exit(Outcome::Failed(BotError::Config(
                    "no track at the playback cursor".to_string(),
                ))),
            ];
        };
        let attempt = PlaybackAttempt {
            id: AttemptId(self.next_attempt),
            index: self.cursor,
            identifier,
            lap: self.lap,
        };
        self.next_attempt += 1;
        self.state = PlaybackState::Playing(attempt.clone());
        vec![Action::Submit(attempt)]
    }

    fn advance(&mut self, finished: AttemptId, pause: Duration) -> Vec<Action> {
        let mut actions = vec![Action::Teardown(finished)];
        let len = self.tracks.as_ref().map_or(0, TrackList::len);
        let next = self.cursor + 1;

        if next >= len {
            match self.settings.policy {
                AdvancePolicy::Cyclic => {
                    self.cursor = 0;
                    self.lap += 1;
                }
                AdvancePolicy::Finite => {
                    tracing::info!("Reached the end of the playlist");
                    self.state = PlaybackState::Stopped;
                    actions.push(Action::Release);
                    actions.push(Action::Exit(Outcome::Finished));
                    return actions;
                }
            }
        } else {
            self.cursor = next;
        }

        if pause.is_zero() {
            actions.extend(self.submit_current());
        } else {
            self.state = PlaybackState::Advancing;
            actions.push(Action::StartCooldown(pause));
        }
        actions
    }
}
