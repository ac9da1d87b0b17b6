//! External decoder process that turns a track address into raw PCM.
//!
//! The decoder writes interleaved signed 16-bit little-endian samples at
//! 48 kHz stereo to stdout. stderr is only ever logged. The process is owned
//! by a [`TranscodeProcess`] guard: dropping the guard kills and reaps it.

use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use symphonia::core::io::MediaSource;
use tokio::sync::{mpsc, oneshot};

use crate::controller::{AttemptId, Event};
use crate::error::{BotError, Result};
use crate::source::TrackAddress;

pub const TARGET_SAMPLE_RATE: u32 = 48_000;
pub const TARGET_CHANNELS: u32 = 2;
pub const DEFAULT_RECONNECT_DELAY_MAX: u32 = 5;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSettings {
    pub program: String,
    pub reconnect_delay_max: u32,
    /// Seconds of trailing silence appended to each track.
    pub pad_secs: Option<f32>,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            reconnect_delay_max: DEFAULT_RECONNECT_DELAY_MAX,
            pad_secs: None,
        }
    }
}

/// Fully built decoder command line for one track.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeCommand {
    program: String,
    args: Vec<String>,
}

impl TranscodeCommand {
    pub fn new(settings: &TranscodeSettings, address: &TrackAddress) -> Self {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();
        // Reconnect options belong to ffmpeg's http protocol and are rejected for files.
        if address.is_network() {
            args.extend([
                "-reconnect".to_string(),
                "1".to_string(),
                "-reconnect_streamed".to_string(),
                "1".to_string(),
                "-reconnect_delay_max".to_string(),
                settings.reconnect_delay_max.to_string(),
            ]);
        }
        args.extend(["-i".to_string(), address.as_input_arg(), "-vn".to_string()]);
        if let Some(pad) = settings.pad_secs {
            args.extend(["-af".to_string(), format!("apad=pad_dur={}", pad)]);
        }
        args.extend([
            "-f".to_string(),
            "s16le".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            TARGET_SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            TARGET_CHANNELS.to_string(),
            "pipe:1".to_string(),
        ]);
        Self {
            program: settings.program.clone(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Running decoder for one playback attempt.
pub struct TranscodeProcess {
    attempt: AttemptId,
    child: Arc<Mutex<Child>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl TranscodeProcess {
    pub fn start(
        command: &TranscodeCommand,
        attempt: AttemptId,
        events: mpsc::Sender<Event>,
    ) -> Result<(Self, PcmStream<ChildStdout>)> {
        Self::spawn(command.to_command(), attempt, events)
    }

    /// Spawns `cmd` with piped stdout/stderr and starts watching for its exit.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        mut cmd: Command,
        attempt: AttemptId,
        events: mpsc::Sender<Event>,
    ) -> Result<(Self, PcmStream<ChildStdout>)> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| BotError::Process(format!("failed to spawn transcoder: {}", e)))?;
        tracing::debug!("Transcoder for attempt {} started (pid {})", attempt, child.id());

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BotError::Process("transcoder stdout was not captured".to_string()));
            }
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::task::spawn_blocking(move || log_stderr(attempt, stderr));
        }

        let child = Arc::new(Mutex::new(child));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(monitor_exit(attempt, Arc::clone(&child), cancel_rx, events));

        Ok((
            Self {
                attempt,
                child,
                cancel: Some(cancel_tx),
            },
            PcmStream::new(stdout),
        ))
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let mut child = self.child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.kill() {
            tracing::warn!("Failed to kill transcoder for attempt {}: {}", self.attempt, e);
        }
        let _ = child.wait();
        tracing::debug!("Transcoder for attempt {} terminated", self.attempt);
    }
}

async fn monitor_exit(
    attempt: AttemptId,
    child: Arc<Mutex<Child>>,
    mut cancel: oneshot::Receiver<()>,
    events: mpsc::Sender<Event>,
) {
    let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => return,
            _ = poll.tick() => {
                let status = child.lock().try_wait();
                match status {
                    // Reaped by the guard while we waited on the lock.
                    Ok(Some(_)) if cancel.try_recv().is_ok() => return,
                    Ok(Some(status)) => {
                        let code = status.code();
                        if code == Some(0) {
                            tracing::debug!("Transcoder for attempt {} exited cleanly", attempt);
                        } else {
                            tracing::warn!("Transcoder for attempt {} exited with {}", attempt, status);
                        }
                        let _ = events.send(Event::ProcessExited { attempt, code }).await;
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!("Failed to poll transcoder for attempt {}: {}", attempt, e);
                        return;
                    }
                }
            }
        }
    }
}

fn log_stderr(attempt: AttemptId, stderr: ChildStderr) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => tracing::warn!("transcoder [{}]: {}", attempt, line.trim_end()),
            Err(_) => break,
        }
    }
}

/// Checks that the decoder binary can be run at all.
pub async fn probe_transcoder(program: &str) -> bool {
    match tokio::process::Command::new(program).arg("-version").output().await {
        Ok(o) if o.status.success() => {
            tracing::info!("Transcoder '{}' found", program);
            true
        }
        Ok(o) => {
            tracing::warn!(
                "Transcoder '{}' exists but failed to run: {}",
                program,
                String::from_utf8_lossy(&o.stderr).trim()
            );
            false
        }
        Err(e) => {
            tracing::warn!("Transcoder '{}' not found ({}). Playback may fail.", program, e);
            false
        }
    }
}

/// Reads s16le PCM from the decoder and yields f32le samples for the mixer.
pub struct PcmStream<R> {
    inner: R,
    carry: Option<u8>,
    pending: Vec<u8>,
    cursor: usize,
}

impl<R: Read> PcmStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            carry: None,
            pending: Vec::new(),
            cursor: 0,
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        let mut raw = [0u8; 4096];
        let start = match self.carry.take() {
            Some(byte) => {
                raw[0] = byte;
                1
            }
            None => 0,
        };
        let read = self.inner.read(&mut raw[start..])?;
        if read == 0 {
            // A dangling half sample at EOF is dropped.
            return Ok(false);
        }
        let total = start + read;
        let whole = total - total % 2;
        if whole < total {
            self.carry = Some(raw[total - 1]);
        }
        self.pending.clear();
        self.cursor = 0;
        for pair in raw[..whole].chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            let scaled = sample as f32 / (i16::MAX as f32 + 1.0);
            self.pending.extend_from_slice(&scaled.to_le_bytes());
        }
        Ok(true)
    }
}

impl<R: Read> Read for PcmStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.cursor >= self.pending.len() {
            if !self.refill()? {
                return Ok(0);
            }
        }
        let available = &self.pending[self.cursor..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.cursor += n;
        Ok(n)
    }
}

impl<R> Seek for PcmStream<R> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "live PCM stream cannot seek",
        ))
    }
}

impl<R: Read + Send + Sync> MediaSource for PcmStream<R> {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
