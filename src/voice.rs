//! Discord voice glue on top of serenity and songbird.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::channel::{Channel, ChannelType};
use serenity::model::id::{ChannelId, GuildId};
use songbird::events::{Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::input::{File as FileInput, HttpRequest, Input, RawAdapter};
use songbird::tracks::TrackHandle;
use songbird::{Call, Songbird};
use tokio::sync::{mpsc, Mutex};

use crate::controller::{AttemptId, Event};
use crate::error::{BotError, Result};
use crate::runtime::{PlayerInput, VoiceConnector, VoiceSession};
use crate::source::TrackAddress;
use crate::transcode::{TARGET_CHANNELS, TARGET_SAMPLE_RATE};

pub struct SongbirdConnector {
    manager: Arc<Songbird>,
    http: Arc<Http>,
    client: reqwest::Client,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>, http: Arc<Http>) -> Self {
        Self {
            manager,
            http,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    type Session = SongbirdSession;

    async fn join(&self, channel_id: u64) -> Result<SongbirdSession> {
        if channel_id == 0 {
            return Err(BotError::Channel("channel id 0 is not valid".to_string()));
        }
        let channel_id = ChannelId::new(channel_id);
        let channel = self
            .http
            .get_channel(channel_id)
            .await
            .map_err(|e| BotError::Channel(format!("voice channel {} not found: {}", channel_id, e)))?;

        let guild_id = match channel {
            Channel::Guild(gc) if matches!(gc.kind, ChannelType::Voice | ChannelType::Stage) => {
                tracing::info!("Found voice channel '{}' in guild {}", gc.name, gc.guild_id);
                gc.guild_id
            }
            Channel::Guild(gc) => {
                return Err(BotError::Channel(format!(
                    "channel '{}' ({}) is not a voice channel",
                    gc.name, channel_id
                )))
            }
            _ => {
                return Err(BotError::Channel(format!(
                    "channel {} is not a guild voice channel",
                    channel_id
                )))
            }
        };

        Ok(SongbirdSession {
            manager: Arc::clone(&self.manager),
            client: self.client.clone(),
            guild_id,
            channel_id,
            call: None,
            track: None,
            released: false,
        })
    }
}

pub struct SongbirdSession {
    manager: Arc<Songbird>,
    client: reqwest::Client,
    guild_id: GuildId,
    channel_id: ChannelId,
    call: Option<Arc<Mutex<Call>>>,
    track: Option<TrackHandle>,
    released: bool,
}

impl SongbirdSession {
    fn to_input(&self, input: PlayerInput) -> Input {
        match input {
            PlayerInput::Direct(TrackAddress::Url(url)) => {
                HttpRequest::new(self.client.clone(), url).into()
            }
            PlayerInput::Direct(TrackAddress::Path(path)) => FileInput::new(path).into(),
            PlayerInput::Pcm(stream) => {
                RawAdapter::new(stream, TARGET_SAMPLE_RATE, TARGET_CHANNELS).into()
            }
        }
    }
}

#[async_trait]
impl VoiceSession for SongbirdSession {
    async fn await_ready(&mut self, timeout: Duration) -> Result<()> {
        let joined = tokio::time::timeout(timeout, self.manager.join(self.guild_id, self.channel_id))
            .await
            .map_err(|_| BotError::SessionTimeout(timeout))?;
        let call = joined.map_err(|e| {
            BotError::Channel(format!("failed to connect to {}: {}", self.channel_id, e))
        })?;
        self.call = Some(call);
        Ok(())
    }

    async fn play(
        &mut self,
        attempt: AttemptId,
        input: PlayerInput,
        events: mpsc::Sender<Event>,
    ) -> Result<()> {
        let call = self
            .call
            .clone()
            .ok_or_else(|| BotError::Playback("voice session is not connected".to_string()))?;
        let input = self.to_input(input);
        let handle = call.lock().await.play_only_input(input);

        for (kind, notice) in [(TrackEvent::End, Notice::Idle), (TrackEvent::Error, Notice::Error)] {
            handle
                .add_event(
                    VoiceEvent::Track(kind),
                    TrackNotifier {
                        attempt,
                        notice,
                        events: events.clone(),
                    },
                )
                .map_err(|e| BotError::Playback(format!("cannot watch track: {}", e)))?;
        }
        self.track = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(track) = self.track.take() {
            // Already-finished tracks report an error here; nothing to do about it.
            let _ = track.stop();
        }
    }

    async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.stop().await;
        self.call = None;
        if self.manager.get(self.guild_id).is_none() {
            return Ok(());
        }
        self.manager
            .remove(self.guild_id)
            .await
            .map_err(|e| BotError::Channel(format!("failed to leave {}: {}", self.channel_id, e)))
    }
}

#[derive(Clone, Copy)]
enum Notice {
    Idle,
    Error,
}

/// Forwards songbird track events into the playback runtime.
struct TrackNotifier {
    attempt: AttemptId,
    notice: Notice,
    events: mpsc::Sender<Event>,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        let event = match self.notice {
            Notice::Idle => Event::PlayerIdle {
                attempt: self.attempt,
            },
            Notice::Error => {
                let message = match ctx {
                    EventContext::Track(tracks) => tracks
                        .first()
                        .map(|(state, _)| format!("{:?}", state.playing))
                        .unwrap_or_else(|| "unknown track error".to_string()),
                    _ => "unknown track error".to_string(),
                };
                Event::PlayerError {
                    attempt: self.attempt,
                    message,
                }
            }
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!("Playback runtime gone; dropping track notice for {}", self.attempt);
        }
        // One notice per attempt is enough.
        Some(VoiceEvent::Cancel)
    }
}
