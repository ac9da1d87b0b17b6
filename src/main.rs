use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    http::Http,
    model::gateway::Ready,
    prelude::GatewayIntents,
};
use songbird::{SerenityInit, Songbird};
use tod_stream::{
    config::{Args, Config},
    controller::{Event, Outcome},
    manifest::ManifestResolver,
    runtime::{PlaybackRuntime, RuntimeSettings},
    source::{PlaybackMode, TrackSourceResolver},
    transcode,
    voice::SongbirdConnector,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "tod_stream=info,songbird=warn,serenity=warn";

// Starts playback once the gateway session is up.
struct Handler {
    events: mpsc::Sender<Event>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!("Connected to Discord as {}", ready.user.name);
        if let Err(e) = self.events.send(Event::Start).await {
            tracing::error!("Playback runtime is not listening: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();
    tracing::info!("tod-stream starting");

    // --- Configuration (validated before any connection) ---
    let config = match Config::from_args(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e).context("Refusing to start");
        }
    };
    tracing::info!(
        "Streaming from {} into channel {} ({:?} policy, {:?} mode)",
        config.manifest,
        config.channel_id,
        config.controller.policy,
        config.playback_mode
    );
    if config.playback_mode == PlaybackMode::Transcoded {
        transcode::probe_transcoder(&config.transcode.program).await;
    }

    // --- Playback runtime ---
    let manager = Songbird::serenity();
    let connector = SongbirdConnector::new(Arc::clone(&manager), Arc::new(Http::new(&config.token)));
    let manifest = ManifestResolver::new(config.manifest.clone())
        .with_retry(config.manifest_retries, config.manifest_retry_delay);
    let sources = TrackSourceResolver::new(
        config.audio_base.clone(),
        config.playback_mode,
        config.transcode.clone(),
    );
    let runtime = PlaybackRuntime::new(
        RuntimeSettings {
            channel_id: config.channel_id,
            ready_timeout: config.ready_timeout,
            controller: config.controller.clone(),
        },
        manifest,
        sources,
        connector,
    );
    let events = runtime.events();

    // --- Discord client ---
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler {
            events: events.clone(),
        })
        .register_songbird_with(manager)
        .await
        .context("Failed to build Discord client")?;
    let shard_manager = Arc::clone(&client.shard_manager);

    tracing::info!("Connecting to Discord...");
    let mut gateway = tokio::spawn(async move { client.start().await });
    let mut playback = tokio::spawn(runtime.run());

    // --- Main wait: playback end, gateway loss or Ctrl+C ---
    let outcome = tokio::select! {
        result = &mut playback => result.context("Playback task panicked")?,
        result = &mut gateway => {
            let reason = match result {
                Ok(Ok(())) => anyhow!("gateway connection closed"),
                Ok(Err(e)) => anyhow!(e).context("Discord gateway error"),
                Err(e) => anyhow!(e).context("Gateway task panicked"),
            };
            tracing::error!("{:#}", reason);
            let _ = events.send(Event::Shutdown).await;
            let _ = (&mut playback).await;
            return Err(reason);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, initiating shutdown...");
            let _ = events.send(Event::Shutdown).await;
            (&mut playback).await.context("Playback task panicked")?
        }
    };

    // --- Disconnect Gracefully ---
    tracing::info!("Disconnecting from Discord...");
    shard_manager.shutdown_all().await;

    match outcome {
        Outcome::Finished => tracing::info!("Playlist finished. Application exiting."),
        Outcome::Interrupted => tracing::info!("Playback stopped. Application exiting."),
        Outcome::Failed(e) => {
            tracing::error!("Playback failed: {}", e);
            return Err(e).context("Fatal playback error");
        }
    }
    Ok(())
}
