//! Async driver around [`PlaybackController`].
//!
//! Every notification (gateway ready, track end, track error, transcoder exit,
//! cooldown expiry, shutdown) arrives on a single channel and is handled one
//! at a time. Actions are executed in the order the controller returns them,
//! so a previous attempt is always torn down before the next is submitted.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::controller::{
    Action, AttemptId, ControllerSettings, Event, Outcome, PlaybackAttempt, PlaybackController,
};
use crate::error::{BotError, Result};
use crate::manifest::ManifestResolver;
use crate::source::{PlayableSource, TrackAddress, TrackSourceResolver};
use crate::transcode::{PcmStream, TranscodeProcess};

pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Input handed to the voice session for one attempt.
pub enum PlayerInput {
    Direct(TrackAddress),
    Pcm(PcmStream<std::process::ChildStdout>),
}

impl std::fmt::Debug for PlayerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerInput::Direct(address) => write!(f, "Direct({})", address),
            PlayerInput::Pcm(_) => f.write_str("Pcm(..)"),
        }
    }
}

/// Finds the voice channel and prepares a session for it.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    type Session: VoiceSession;

    async fn join(&self, channel_id: u64) -> Result<Self::Session>;
}

/// A joined voice channel with an audio player subscribed to it.
#[async_trait]
pub trait VoiceSession: Send {
    async fn await_ready(&mut self, timeout: Duration) -> Result<()>;

    /// Starts playing `input`. The session reports the end or failure of the
    /// track as [`Event::PlayerIdle`] / [`Event::PlayerError`] for `attempt`.
    async fn play(
        &mut self,
        attempt: AttemptId,
        input: PlayerInput,
        events: mpsc::Sender<Event>,
    ) -> Result<()>;

    /// Stops the current track, if any.
    async fn stop(&mut self);

    /// Leaves the channel. Calling it again is a no-op.
    async fn release(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub channel_id: u64,
    pub ready_timeout: Duration,
    pub controller: ControllerSettings,
}

pub struct PlaybackRuntime<C: VoiceConnector> {
    settings: RuntimeSettings,
    controller: PlaybackController,
    manifest: ManifestResolver,
    sources: TrackSourceResolver,
    connector: C,
    session: Option<C::Session>,
    transcoder: Option<TranscodeProcess>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

impl<C: VoiceConnector> PlaybackRuntime<C> {
    pub fn new(
        settings: RuntimeSettings,
        manifest: ManifestResolver,
        sources: TrackSourceResolver,
        connector: C,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            controller: PlaybackController::new(settings.controller.clone()),
            settings,
            manifest,
            sources,
            connector,
            session: None,
            transcoder: None,
            events_tx,
            events_rx,
        }
    }

    /// Sender for external notifications such as [`Event::Start`] and [`Event::Shutdown`].
    pub fn events(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    pub async fn run(mut self) -> Outcome {
        tracing::info!("Playback runtime started; waiting for the gateway");
        let mut pending: VecDeque<Action> = VecDeque::new();
        // Failure of a submission that never reached the player. Handled only
        // once the event queue is empty.
        let mut rejected: Option<Event> = None;
        loop {
            while let Some(action) = pending.pop_front() {
                if let Action::Exit(outcome) = action {
                    self.teardown_transcoder();
                    tracing::info!("Playback runtime finished: {:?}", outcome);
                    return outcome;
                }
                let is_submit = matches!(action, Action::Submit(_));
                match self.execute(action).await {
                    Some(event) if is_submit => rejected = Some(event),
                    Some(event) => pending.extend(self.controller.handle(event)),
                    None => {}
                }
            }

            let event = match rejected.take() {
                Some(failure) => {
                    tokio::task::yield_now().await;
                    match self.events_rx.try_recv() {
                        Ok(event) => {
                            rejected = Some(failure);
                            event
                        }
                        Err(_) => failure,
                    }
                }
                // We hold a sender ourselves, so the channel never closes here.
                None => self.events_rx.recv().await.unwrap_or(Event::Shutdown),
            };
            pending.extend(self.controller.handle(event));
        }
    }

    /// Runs one action. Actions whose result is known immediately return the follow-up event.
    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::FetchManifest => {
                tracing::info!("Fetching track list from {}", self.manifest.location());
                Some(match self.manifest.resolve().await {
                    Ok(tracks) => Event::ManifestLoaded(tracks),
                    Err(e) => {
                        tracing::error!("Giving up on the track list: {}", e);
                        Event::ManifestFailed(e)
                    }
                })
            }
            Action::JoinSession => Some(match self.join().await {
                Ok(()) => Event::SessionReady,
                Err(e) => {
                    tracing::error!("Could not join voice channel {}: {}", self.settings.channel_id, e);
                    Event::SessionFailed(e)
                }
            }),
            Action::Submit(attempt) => {
                let id = attempt.id;
                match self.submit(attempt).await {
                    Ok(()) => None,
                    Err(e) => Some(Event::PlayerError {
                        attempt: id,
                        message: e.to_string(),
                    }),
                }
            }
            Action::Teardown(attempt) => {
                if let Some(session) = self.session.as_mut() {
                    session.stop().await;
                }
                if self.transcoder.as_ref().map(TranscodeProcess::attempt) == Some(attempt) {
                    self.teardown_transcoder();
                }
                None
            }
            Action::StartCooldown(pause) => {
                tracing::debug!("Waiting {:?} before the next track", pause);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(pause).await;
                    let _ = events.send(Event::CooldownElapsed).await;
                });
                None
            }
            Action::Release => {
                self.teardown_transcoder();
                if let Some(session) = self.session.as_mut() {
                    session.stop().await;
                    match session.release().await {
                        Ok(()) => tracing::info!("Left voice channel {}", self.settings.channel_id),
                        Err(e) => tracing::warn!("Error while leaving the voice channel: {}", e),
                    }
                }
                None
            }
            Action::Exit(_) => None,
        }
    }

    async fn join(&mut self) -> Result<()> {
        tracing::info!("Joining voice channel {}", self.settings.channel_id);
        // Kept even if readiness fails so that Release can clean up a half-open call.
        let session = self.session.insert(self.connector.join(self.settings.channel_id).await?);
        session.await_ready(self.settings.ready_timeout).await?;
        tracing::info!("Voice session ready");
        Ok(())
    }

    async fn submit(&mut self, attempt: PlaybackAttempt) -> Result<()> {
        let source = self.sources.resolve(&attempt.identifier)?;
        tracing::info!(
            "Now streaming [{}] {} (attempt {})",
            attempt.index,
            attempt.identifier,
            attempt.id
        );

        let input = match source {
            PlayableSource::Direct(address) => PlayerInput::Direct(address),
            PlayableSource::Transcoded(command) => {
                let (process, stream) =
                    TranscodeProcess::start(&command, attempt.id, self.events_tx.clone())?;
                self.transcoder = Some(process);
                PlayerInput::Pcm(stream)
            }
        };

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BotError::Playback("no voice session to play into".to_string()))?;
        if let Err(e) = session.play(attempt.id, input, self.events_tx.clone()).await {
            self.teardown_transcoder();
            return Err(e);
        }
        Ok(())
    }

    fn teardown_transcoder(&mut self) {
        // Dropping the guard kills and reaps the process.
        self.transcoder.take();
    }
}
