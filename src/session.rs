//! # Relay Session
//!
//! One session per WebSocket connection. The session owns the recognition handle,
//! its audio sink and the outbound relay, and runs as its own task so that slow
//! provider calls never hold up the server.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: waiting for a valid `config` command
//! 2. **Configured**: provider handle and audio sink exist, recognition is starting
//! 3. **Recognizing**: audio flows to the provider, results flow to the client
//! 4. **Stopping**: sink closed, provider asked to stop, waiting for its last word
//! 5. **Errored**: the provider reported a fault; cleanup follows immediately
//! 6. **Closed**: terminal, every resource released exactly once
//!
//! ## Concurrency:
//! Inbound messages, provider deliveries and the stop deadline are all handled by
//! the single loop in [`Session::run`], one at a time. Provider callbacks only ever
//! enqueue; the state machine is never touched from another task.

use crate::config::AppConfig;
use crate::protocol::{ControlMessage, InboundMessage, OutboundEvent};
use crate::provider::{
    AudioSink, CancellationReason, Credentials, Delivery, EventSink, RecognitionEvent,
    RecognitionHandle, RecognitionOptions, RecognitionProvider,
};
use crate::relay::{CloseKind, EventRelay};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Recognizing,
    Stopping,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configured => "configured",
            SessionState::Recognizing => "recognizing",
            SessionState::Stopping => "stopping",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }

    /// Audio is only forwarded while a sink can exist.
    pub fn accepts_audio(&self) -> bool {
        matches!(self, SessionState::Configured | SessionState::Recognizing)
    }
}

/// What the client asked for, fixed once accepted.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,
    pub language: String,
}

/// Server-wide knobs every session is created with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_language: String,
    pub stop_timeout: Duration,
    pub recognition: RecognitionOptions,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_language: config.relay.default_language.clone(),
            stop_timeout: config.relay.stop_timeout(),
            recognition: config.recognition.clone(),
        }
    }
}

/// Audio accounting, logged when the session closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    pub frames_dropped: u64,
}

pub struct Session {
    id: Uuid,
    state: SessionState,
    config: Option<SessionConfig>,
    settings: SessionSettings,
    provider: Arc<dyn RecognitionProvider>,
    handle: Option<Box<dyn RecognitionHandle>>,
    audio_sink: Option<AudioSink>,
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    // Clone of the provider's sink, used to mark the stop boundary.
    acknowledger: Option<EventSink>,
    results_closed: bool,
    stop_deadline: Option<Instant>,
    relay: EventRelay,
    stats: SessionStats,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn next_delivery(deliveries: &mut Option<mpsc::UnboundedReceiver<Delivery>>) -> Option<Delivery> {
    match deliveries {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    pub fn new(
        id: Uuid,
        provider: Arc<dyn RecognitionProvider>,
        settings: SessionSettings,
        relay: EventRelay,
    ) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            config: None,
            settings,
            provider,
            handle: None,
            audio_sink: None,
            deliveries: None,
            acknowledger: None,
            results_closed: false,
            stop_deadline: None,
            relay,
            stats: SessionStats::default(),
        }
    }

    /// Drive the session until it is closed.
    ///
    /// `inbound` carries classified client messages in wire order; when its sender
    /// is dropped the connection is considered gone and the session shuts down
    /// through the same path as an explicit `stop`.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) -> SessionStats {
        info!(session_id = %self.id, provider = self.provider.name(), "Session opened");
        let mut connected = true;

        while self.state != SessionState::Closed {
            let deadline = self.stop_deadline;
            tokio::select! {
                message = inbound.recv(), if connected => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        connected = false;
                        self.handle_disconnect().await;
                    }
                },
                Some(delivery) = next_delivery(&mut self.deliveries) => {
                    self.handle_delivery(delivery).await;
                }
                _ = wait_until(deadline) => self.handle_stop_timeout().await,
            }
        }

        self.stats
    }

    pub async fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Control(ControlMessage::Config { key, region, language }) => {
                self.configure(key, region, language).await
            }
            InboundMessage::Control(ControlMessage::Stop) => self.stop().await,
            InboundMessage::Audio(frame) => self.push_audio(frame),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Session state change"
        );
        self.state = next;
    }

    async fn configure(&mut self, key: Option<String>, region: Option<String>, language: Option<String>) {
        match self.state {
            SessionState::Idle => {}
            SessionState::Configured | SessionState::Recognizing => {
                warn!(session_id = %self.id, "Config rejected: session already configured");
                self.relay.emit(OutboundEvent::error("session is already configured")).await;
                return;
            }
            _ => {
                debug!(session_id = %self.id, state = self.state.as_str(), "Config ignored");
                return;
            }
        }

        let (Some(key), Some(region)) = (non_empty(key), non_empty(region)) else {
            warn!(session_id = %self.id, "Config rejected: credential key or region missing");
            self.relay
                .emit(OutboundEvent::error("credential key and region are required"))
                .await;
            return;
        };
        let language = non_empty(language).unwrap_or_else(|| self.settings.default_language.clone());

        info!(session_id = %self.id, region = %region, language = %language, "Configuring recognition");

        let credentials = Credentials::new(key, region);
        let configured = self
            .provider
            .configure(credentials.clone(), &language, &self.settings.recognition)
            .await;
        let mut handle = match configured {
            Ok(handle) => handle,
            Err(err) => return self.reject_config(err.to_string()).await,
        };

        let sink = match handle.open_audio_sink() {
            Ok(sink) => sink,
            Err(err) => {
                handle.close();
                return self.reject_config(err.to_string()).await;
            }
        };

        let (events, deliveries) = EventSink::channel();
        self.audio_sink = Some(sink);
        self.deliveries = Some(deliveries);
        self.acknowledger = Some(events.clone());
        self.results_closed = false;
        self.config = Some(SessionConfig { credentials, language });
        self.transition(SessionState::Configured);

        match handle.start(events).await {
            Ok(()) => {
                self.handle = Some(handle);
                self.transition(SessionState::Recognizing);
                info!(session_id = %self.id, "Recognition started");
                self.relay.emit(OutboundEvent::Started).await;
            }
            Err(err) => {
                handle.close();
                self.release_audio_sink();
                self.deliveries = None;
                self.acknowledger = None;
                self.config = None;
                self.transition(SessionState::Idle);
                self.reject_config(err.to_string()).await;
            }
        }
    }

    async fn reject_config(&mut self, message: String) {
        warn!(session_id = %self.id, error = %message, "Recognition could not be set up");
        self.relay.emit(OutboundEvent::error(message)).await;
    }

    async fn stop(&mut self) {
        match self.state {
            SessionState::Configured | SessionState::Recognizing => {
                info!(session_id = %self.id, "Stop requested");
                self.begin_stopping().await;
            }
            _ => debug!(session_id = %self.id, state = self.state.as_str(), "Stop ignored"),
        }
    }

    fn push_audio(&mut self, frame: Bytes) {
        let len = frame.len() as u64;
        let forwarded = match &self.audio_sink {
            Some(sink) if self.state.accepts_audio() => sink.write(frame).is_ok(),
            _ => false,
        };

        if forwarded {
            self.stats.frames_forwarded += 1;
            self.stats.bytes_forwarded += len;
        } else {
            self.stats.frames_dropped += 1;
            trace!(session_id = %self.id, bytes = len, state = self.state.as_str(), "Audio frame dropped");
        }
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::StopAcknowledged => self.results_closed = true,
            Delivery::Event(event) => self.handle_recognition_event(event).await,
        }
    }

    async fn handle_recognition_event(&mut self, event: RecognitionEvent) {
        let faulted = matches!(
            event,
            RecognitionEvent::Error(_)
                | RecognitionEvent::Canceled {
                    reason: CancellationReason::Error,
                    ..
                }
        );
        let ends = faulted || event.is_terminal();

        match self.state {
            SessionState::Configured | SessionState::Recognizing => {
                self.relay.emit(event.into()).await;
                if faulted {
                    warn!(session_id = %self.id, "Provider reported a fault");
                    self.transition(SessionState::Errored);
                    self.shut_down(CloseKind::Faulted).await;
                } else if ends {
                    info!(session_id = %self.id, "Provider ended recognition");
                    self.transition(SessionState::Stopping);
                    self.shut_down(CloseKind::Completed).await;
                }
            }
            SessionState::Stopping => {
                let result = matches!(event, RecognitionEvent::Partial(_) | RecognitionEvent::Final(_));
                if result && self.results_closed {
                    debug!(session_id = %self.id, "Result after stop suppressed");
                    return;
                }
                self.relay.emit(event.into()).await;
                if ends {
                    let kind = if faulted { CloseKind::Faulted } else { CloseKind::Completed };
                    self.finish(kind).await;
                }
            }
            _ => debug!(session_id = %self.id, state = self.state.as_str(), "Stale provider event dropped"),
        }
    }

    /// Recognizing → Stopping: close the sink, then ask the provider to stop.
    async fn begin_stopping(&mut self) {
        self.transition(SessionState::Stopping);
        self.release_audio_sink();
        self.stop_provider().await;
        if let Some(acknowledger) = &self.acknowledger {
            acknowledger.acknowledge_stop();
        }
        self.stop_deadline = Some(Instant::now() + self.settings.stop_timeout);
    }

    /// Cleanup after the provider ended on its own; nothing further is awaited from it.
    async fn shut_down(&mut self, kind: CloseKind) {
        self.release_audio_sink();
        self.stop_provider().await;
        self.finish(kind).await;
    }

    async fn stop_provider(&mut self) {
        let limit = self.settings.stop_timeout;
        let Some(handle) = self.handle.as_mut() else {
            return;
        };

        match timeout(limit, handle.stop()).await {
            Ok(Ok(())) => debug!(session_id = %self.id, "Provider stop acknowledged"),
            Ok(Err(err)) => warn!(session_id = %self.id, error = %err, "Provider stop failed, continuing cleanup"),
            Err(_) => warn!(session_id = %self.id, "Provider stop timed out, continuing cleanup"),
        }
    }

    async fn handle_disconnect(&mut self) {
        info!(session_id = %self.id, state = self.state.as_str(), "Client connection gone");
        match self.state {
            SessionState::Configured | SessionState::Recognizing => self.begin_stopping().await,
            SessionState::Idle | SessionState::Errored => self.finish(CloseKind::Completed).await,
            SessionState::Stopping | SessionState::Closed => {}
        }
    }

    async fn handle_stop_timeout(&mut self) {
        warn!(session_id = %self.id, "Provider never confirmed stop, closing session");
        self.relay.emit(OutboundEvent::SessionStopped).await;
        self.finish(CloseKind::Completed).await;
    }

    fn release_audio_sink(&mut self) {
        if let Some(mut sink) = self.audio_sink.take() {
            if sink.close() {
                debug!(session_id = %self.id, "Audio sink closed");
            }
        }
    }

    fn release_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(session_id = %self.id, "Recognition handle closed");
        }
    }

    async fn finish(&mut self, kind: CloseKind) {
        self.release_audio_sink();
        self.release_handle();
        self.deliveries = None;
        self.acknowledger = None;
        self.stop_deadline = None;
        self.transition(SessionState::Closed);
        self.relay.close(kind).await;

        let (region, language) = self.config.as_ref().map_or(("-", "-"), |config| {
            (config.credentials.region.as_str(), config.language.as_str())
        });
        info!(
            session_id = %self.id,
            region = %region,
            language = %language,
            frames_forwarded = self.stats.frames_forwarded,
            bytes_forwarded = self.stats.bytes_forwarded,
            frames_dropped = self.stats.frames_dropped,
            "Session closed"
        );
    }
}

// Covers a session task that is aborted or panics before reaching `finish`.
impl Drop for Session {
    fn drop(&mut self) {
        if self.handle.is_some() || self.audio_sink.is_some() {
            warn!(session_id = %self.id, "Session dropped with live resources, releasing");
        }
        self.release_audio_sink();
        self.release_handle();
    }
}
