//! # Recognition Provider Adapter
//!
//! Narrow interface between a relay session and an external speech-recognition
//! engine. The session never sees a vendor API; it only drives these calls:
//!
//! 1. [`RecognitionProvider::configure`] turns credentials and a language tag into a
//!    [`RecognitionHandle`]
//! 2. [`RecognitionHandle::open_audio_sink`] hands out the single append-only PCM sink
//! 3. [`RecognitionHandle::start`] begins continuous recognition and delivers
//!    [`RecognitionEvent`]s through an [`EventSink`]
//! 4. [`RecognitionHandle::stop`] asks for graceful termination
//! 5. [`RecognitionHandle::close`] releases everything (idempotent)
//!
//! ## Audio Format:
//! Frames are raw PCM, 16 kHz, 16-bit little-endian, mono, with no framing metadata.

pub mod azure;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

pub use azure::AzureSpeechProvider;

pub const SAMPLE_RATE_HZ: u32 = 16_000;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const CHANNELS: u16 = 1;

/// Credentials a client supplies in its `config` command.
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub region: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            region: region.into(),
        }
    }
}

// Keys end up in logs through `{:?}` otherwise.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Which recognition endpoint flavour to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    Interactive,
    Conversation,
    Dictation,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Interactive => "interactive",
            RecognitionMode::Conversation => "conversation",
            RecognitionMode::Dictation => "dictation",
        }
    }
}

/// Engine tuning applied to every session.
///
/// ## Defaults:
/// Very short segmentation and end silences so partial and final results come back
/// as quickly as the engine allows; raw profanity so the transcript is verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionOptions {
    pub segmentation_silence_timeout_ms: u32,
    pub initial_silence_timeout_ms: u32,
    pub end_silence_timeout_ms: u32,
    pub word_level_timestamps: bool,
    pub profanity: String,
    pub mode: RecognitionMode,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            segmentation_silence_timeout_ms: 100,
            initial_silence_timeout_ms: 3_000,
            end_silence_timeout_ms: 100,
            word_level_timestamps: true,
            profanity: "raw".to_string(),
            mode: RecognitionMode::Conversation,
        }
    }
}

/// Why the engine cancelled recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationReason {
    Error,
    EndOfStream,
}

/// Everything an engine may report after `start`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Partial(String),
    Final(String),
    Canceled {
        reason: CancellationReason,
        details: String,
    },
    SessionStopped,
    Error(String),
}

impl RecognitionEvent {
    /// `SessionStopped` and `Canceled` close a recognition; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecognitionEvent::SessionStopped | RecognitionEvent::Canceled { .. }
        )
    }
}

/// Errors raised by provider calls.
///
/// ## Error Categories:
/// - **Configuration**: credentials missing, malformed, or rejected upstream
/// - **Connection**: the engine could not be reached or dropped the link
/// - **Protocol**: the engine or the caller broke the call sequence
/// - **Closed**: the handle was already released
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Configuration(String),
    Connection(String),
    Protocol(String),
    Closed,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ProviderError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ProviderError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ProviderError::Closed => write!(f, "Recognition handle is closed"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// What travels from a provider to its session.
///
/// `StopAcknowledged` is only ever queued by the session itself, right after a
/// provider's `stop` returned, so it marks the point after which results are
/// no longer relayed.
#[derive(Debug)]
pub(crate) enum Delivery {
    Event(RecognitionEvent),
    StopAcknowledged,
}

/// Callback target handed to [`RecognitionHandle::start`].
///
/// Cloneable and callable from any task; deliveries keep the order in which
/// `emit` was called.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the owning session is gone.
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.tx.send(Delivery::Event(event)).is_ok()
    }

    pub(crate) fn acknowledge_stop(&self) {
        let _ = self.tx.send(Delivery::StopAcknowledged);
    }
}

/// Writing end of the audio channel owned by a session.
#[derive(Debug)]
pub struct AudioSink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Reading end of the audio channel, consumed by the provider.
#[derive(Debug)]
pub struct AudioStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected sink/stream pair. Frames come out in the order written.
pub fn audio_channel() -> (AudioSink, AudioStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AudioSink { tx: Some(tx) }, AudioStream { rx })
}

impl AudioSink {
    pub fn write(&self, frame: Bytes) -> Result<(), ProviderError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| ProviderError::Closed),
            None => Err(ProviderError::Closed),
        }
    }

    /// Marks end of audio. Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        self.tx.take().is_some()
    }
}

impl AudioStream {
    /// `None` once the sink is closed and every written frame was read.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Factory for engine sessions; one instance is shared by the whole server.
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with [`ProviderError::Configuration`] for absent or unusable credentials.
    async fn configure(
        &self,
        credentials: Credentials,
        language: &str,
        options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionHandle>, ProviderError>;
}

/// One engine session, exclusively owned by one relay session.
#[async_trait]
pub trait RecognitionHandle: Send {
    /// At most one sink per handle.
    fn open_audio_sink(&mut self) -> Result<AudioSink, ProviderError>;

    /// Begin continuous recognition. Faults after a successful return are reported
    /// through `events`, never both ways for the same fault.
    async fn start(&mut self, events: EventSink) -> Result<(), ProviderError>;

    /// Graceful termination. No `Partial`/`Final` is emitted after this returns,
    /// though a closing `SessionStopped` or `Canceled` may still arrive.
    async fn stop(&mut self) -> Result<(), ProviderError>;

    /// Release all resources. Must be safe to call repeatedly and after `stop`.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audio_channel_preserves_order_and_reports_close() {
        let (mut sink, mut stream) = audio_channel();
        sink.write(Bytes::from_static(b"one")).unwrap();
        sink.write(Bytes::from_static(b"two")).unwrap();

        assert!(sink.close());
        assert!(!sink.close());
        assert_eq!(sink.write(Bytes::from_static(b"three")), Err(ProviderError::Closed));

        assert_eq!(stream.next_frame().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream.next_frame().await.unwrap(), Bytes::from_static(b"two"));
        assert!(stream.next_frame().await.is_none());
    }

    #[test]
    fn credentials_debug_hides_key() {
        let credentials = Credentials::new("super-secret", "westeurope");
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("westeurope"));
    }
}
