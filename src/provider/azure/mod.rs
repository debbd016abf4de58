//! # Azure Speech Provider
//!
//! Talks to the Azure Speech service over its WebSocket speech protocol instead of
//! a vendor SDK. Each relay session gets its own service connection.
//!
//! ## Connection Lifecycle:
//! 1. **configure**: validate credentials and language, build the service URL
//! 2. **start**: connect, send `speech.config`, spawn the upload and receive tasks
//! 3. **upload task**: WAV header, then every PCM frame, then an empty end-of-stream frame
//! 4. **receive task**: hypotheses become partials, phrases become finals
//! 5. **turns**: the service ends a turn after silence; until `stop` the upload task
//!    opens the next one on the same socket, afterwards `turn.end` becomes `SessionStopped`
//! 6. **stop**: wait (bounded) for end of stream to be flushed and the turn to end
//! 7. **close**: abort whatever is still running

pub mod wire;

use crate::config::AppConfig;
use crate::provider::{
    audio_channel, AudioSink, AudioStream, CancellationReason, Credentials, EventSink,
    ProviderError, RecognitionEvent, RecognitionHandle, RecognitionOptions, RecognitionProvider,
    BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE_HZ,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use wire::{PhraseOutcome, ServiceEvent, ServiceMessage};

type ServiceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ServiceWriter = SplitSink<ServiceSocket, Message>;
type ServiceReader = SplitStream<ServiceSocket>;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const CONNECTION_ID_HEADER: &str = "X-ConnectionId";

/// Factory for Azure Speech recognitions.
#[derive(Debug, Clone)]
pub struct AzureSpeechProvider {
    endpoint_template: String,
    connect_timeout: Duration,
    stop_timeout: Duration,
}

impl AzureSpeechProvider {
    pub fn new(endpoint_template: impl Into<String>, connect_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            endpoint_template: endpoint_template.into(),
            connect_timeout,
            stop_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.azure.endpoint_template.clone(),
            config.azure.connect_timeout(),
            config.relay.stop_timeout(),
        )
    }

    fn service_url(&self, region: &str, language: &str, options: &RecognitionOptions) -> String {
        let endpoint = self.endpoint_template.replace("{region}", region);
        format!(
            "{}/speech/recognition/{}/cognitiveservices/v1?language={}&format=simple&profanity={}\
             &wordLevelTimestamps={}&initialSilenceTimeoutMs={}&endSilenceTimeoutMs={}\
             &segmentationSilenceTimeoutMs={}",
            endpoint.trim_end_matches('/'),
            options.mode.as_str(),
            language,
            options.profanity,
            options.word_level_timestamps,
            options.initial_silence_timeout_ms,
            options.end_silence_timeout_ms,
            options.segmentation_silence_timeout_ms,
        )
    }
}

fn validate(credentials: &Credentials, language: &str, options: &RecognitionOptions) -> Result<(), ProviderError> {
    if credentials.key.trim().is_empty() || HeaderValue::from_str(&credentials.key).is_err() {
        return Err(ProviderError::Configuration("credential key is missing or malformed".to_string()));
    }
    if credentials.region.is_empty() || !credentials.region.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ProviderError::Configuration(format!("invalid region '{}'", credentials.region)));
    }
    if language.is_empty() || !language.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ProviderError::Configuration(format!("invalid language tag '{}'", language)));
    }
    if options.profanity.is_empty() || !options.profanity.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ProviderError::Configuration(format!("invalid profanity option '{}'", options.profanity)));
    }
    Ok(())
}

#[async_trait]
impl RecognitionProvider for AzureSpeechProvider {
    fn name(&self) -> &'static str {
        "azure-speech"
    }

    async fn configure(
        &self,
        credentials: Credentials,
        language: &str,
        options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionHandle>, ProviderError> {
        validate(&credentials, language, options)?;

        let url = self.service_url(&credentials.region, language, options);
        debug!(region = %credentials.region, language = %language, "Azure Speech recognition configured");

        Ok(Box::new(AzureRecognition {
            url,
            key: credentials.key,
            connection_id: wire::new_id(),
            connect_timeout: self.connect_timeout,
            stop_timeout: self.stop_timeout,
            audio: None,
            sink_opened: false,
            flags: Arc::new(TurnFlags::default()),
            upload: None,
            receive: None,
            closed: false,
        }))
    }
}

/// State shared between a recognition and its receive task.
#[derive(Debug, Default)]
struct TurnFlags {
    stopping: AtomicBool,
    results_closed: AtomicBool,
    terminal_sent: AtomicBool,
}

impl TurnFlags {
    fn emit_result(&self, events: &EventSink, event: RecognitionEvent) {
        let empty = matches!(&event, RecognitionEvent::Partial(text) | RecognitionEvent::Final(text) if text.is_empty());
        if empty || self.results_closed.load(Ordering::SeqCst) {
            return;
        }
        events.emit(event);
    }

    /// Only the first terminal event of a recognition is delivered.
    fn finish(&self, events: &EventSink, event: RecognitionEvent) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            events.emit(event);
        }
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// One Azure Speech service connection.
pub struct AzureRecognition {
    url: String,
    key: String,
    connection_id: String,
    connect_timeout: Duration,
    stop_timeout: Duration,
    audio: Option<AudioStream>,
    sink_opened: bool,
    flags: Arc<TurnFlags>,
    upload: Option<JoinHandle<()>>,
    receive: Option<JoinHandle<()>>,
    closed: bool,
}

impl AzureRecognition {
    async fn connect(&self) -> Result<ServiceSocket, ProviderError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Configuration(format!("invalid service URL: {}", e)))?;

        let key = HeaderValue::from_str(&self.key)
            .map_err(|_| ProviderError::Configuration("credential key is malformed".to_string()))?;
        let connection_id = HeaderValue::from_str(&self.connection_id)
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        request.headers_mut().insert(SUBSCRIPTION_KEY_HEADER, key);
        request.headers_mut().insert(CONNECTION_ID_HEADER, connection_id);

        let (socket, _response) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ProviderError::Connection("timed out connecting to Azure Speech".to_string()))?
            .map_err(connect_error)?;

        Ok(socket)
    }
}

fn connect_error(err: tungstenite::Error) -> ProviderError {
    match err {
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            ProviderError::Configuration(format!("credentials rejected by Azure Speech ({})", response.status()))
        }
        tungstenite::Error::Http(response) => {
            ProviderError::Connection(format!("Azure Speech refused the connection ({})", response.status()))
        }
        other => ProviderError::Connection(other.to_string()),
    }
}

fn speech_config() -> String {
    json!({
        "context": {
            "system": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "build": "rust",
                "lang": "Rust"
            },
            "os": {
                "platform": std::env::consts::OS,
                "name": std::env::consts::OS,
                "version": ""
            },
            "audio": {
                "source": {
                    "bitspersample": BITS_PER_SAMPLE,
                    "channelcount": CHANNELS,
                    "samplerate": SAMPLE_RATE_HZ,
                    "connectivity": "Unknown",
                    "manufacturer": "Speech Relay",
                    "model": "PCM stream",
                    "type": "Stream"
                }
            }
        }
    })
    .to_string()
}

#[async_trait]
impl RecognitionHandle for AzureRecognition {
    fn open_audio_sink(&mut self) -> Result<AudioSink, ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        if self.sink_opened {
            return Err(ProviderError::Protocol("audio sink already open".to_string()));
        }
        let (sink, stream) = audio_channel();
        self.audio = Some(stream);
        self.sink_opened = true;
        Ok(sink)
    }

    async fn start(&mut self, events: EventSink) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        if self.receive.is_some() {
            return Err(ProviderError::Protocol("recognition already started".to_string()));
        }
        let audio = self
            .audio
            .take()
            .ok_or_else(|| ProviderError::Protocol("audio sink must be opened before start".to_string()))?;

        let socket = self.connect().await?;
        let (mut writer, reader) = socket.split();

        let request_id = wire::new_id();
        let config = wire::text_message(wire::PATH_SPEECH_CONFIG, &request_id, "application/json", &speech_config());
        writer
            .send(Message::Text(config))
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        info!(connection_id = %self.connection_id, "Connected to Azure Speech");

        let (next_turn, turns) = mpsc::unbounded_channel();
        let connection_id = self.connection_id.clone();
        self.upload = Some(tokio::spawn(async move {
            if let Err(err) = upload_loop(writer, audio, turns, request_id).await {
                warn!(connection_id = %connection_id, error = %err, "Audio upload to Azure Speech failed");
            }
        }));

        let flags = self.flags.clone();
        let connection_id = self.connection_id.clone();
        self.receive = Some(tokio::spawn(receive_loop(reader, events, flags, next_turn, connection_id)));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::Closed);
        }
        self.flags.stopping.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.stop_timeout;

        if let Some(mut upload) = self.upload.take() {
            if timeout_at(deadline, &mut upload).await.is_err() {
                warn!(connection_id = %self.connection_id, "Audio upload did not finish before stop timeout");
                upload.abort();
            }
        }

        if let Some(receive) = self.receive.as_mut() {
            if timeout_at(deadline, receive).await.is_ok() {
                self.receive = None;
            } else {
                warn!(connection_id = %self.connection_id, "Azure Speech did not end the turn before stop timeout");
            }
        }

        self.flags.results_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
        if let Some(receive) = self.receive.take() {
            receive.abort();
        }
        self.audio = None;
        debug!(connection_id = %self.connection_id, "Azure Speech recognition closed");
    }
}

impl Drop for AzureRecognition {
    fn drop(&mut self) {
        self.close();
    }
}

/// Every turn is its own request: a fresh `X-RequestId` and a WAV header ahead of
/// the frames that follow.
async fn begin_turn(writer: &mut ServiceWriter, request_id: &str) -> Result<(), tungstenite::Error> {
    writer
        .send(Message::Binary(wire::audio_message(request_id, &wire::wav_header())))
        .await
}

async fn upload_loop(
    mut writer: ServiceWriter,
    mut audio: AudioStream,
    mut turns: mpsc::UnboundedReceiver<()>,
    mut request_id: String,
) -> Result<(), tungstenite::Error> {
    begin_turn(&mut writer, &request_id).await?;

    loop {
        tokio::select! {
            biased;
            Some(()) = turns.recv() => {
                request_id = wire::new_id();
                debug!(request_id = %request_id, "Opening next turn");
                begin_turn(&mut writer, &request_id).await?;
            }
            frame = audio.next_frame() => match frame {
                // An empty audio message would end the stream early.
                Some(frame) if frame.is_empty() => {}
                Some(frame) => {
                    writer
                        .send(Message::Binary(wire::audio_message(&request_id, &frame)))
                        .await?;
                }
                None => break,
            },
        }
    }

    // End of stream has to go out on a live turn.
    if turns.try_recv().is_ok() {
        request_id = wire::new_id();
        begin_turn(&mut writer, &request_id).await?;
    }
    writer.send(Message::Binary(wire::audio_message(&request_id, &[]))).await?;
    Ok(())
}

async fn receive_loop(
    mut reader: ServiceReader,
    events: EventSink,
    flags: Arc<TurnFlags>,
    next_turn: mpsc::UnboundedSender<()>,
    connection_id: String,
) {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Some(message) = ServiceMessage::parse(&text) else {
                    warn!(connection_id = %connection_id, "Ignoring service message without a path");
                    continue;
                };

                match ServiceEvent::interpret(&message) {
                    Ok(ServiceEvent::Hypothesis(text)) => {
                        flags.emit_result(&events, RecognitionEvent::Partial(text));
                    }
                    Ok(ServiceEvent::Phrase(PhraseOutcome::Recognized(text))) => {
                        flags.emit_result(&events, RecognitionEvent::Final(text));
                    }
                    Ok(ServiceEvent::Phrase(PhraseOutcome::Nothing)) => {}
                    Ok(ServiceEvent::Phrase(PhraseOutcome::Failed(status))) => {
                        warn!(connection_id = %connection_id, status = %status, "Recognition failed");
                        flags.finish(
                            &events,
                            RecognitionEvent::Canceled {
                                reason: CancellationReason::Error,
                                details: format!("recognition failed: {}", status),
                            },
                        );
                        return;
                    }
                    Ok(ServiceEvent::TurnEnd) if !flags.stopping() && next_turn.send(()).is_ok() => {
                        debug!(connection_id = %connection_id, "Turn ended, recognition continues");
                    }
                    Ok(ServiceEvent::TurnEnd) => {
                        debug!(connection_id = %connection_id, "Final turn ended");
                        flags.finish(&events, RecognitionEvent::SessionStopped);
                        return;
                    }
                    Ok(ServiceEvent::Other(path)) => {
                        debug!(connection_id = %connection_id, path = %path, "Service message");
                    }
                    Err(err) => {
                        warn!(connection_id = %connection_id, path = %message.path, error = %err, "Unreadable service message");
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                let normal = frame.as_ref().map_or(true, |f| f.code == CloseCode::Normal);
                let event = match (normal, flags.stopping()) {
                    (true, true) => RecognitionEvent::SessionStopped,
                    (true, false) => RecognitionEvent::Canceled {
                        reason: CancellationReason::EndOfStream,
                        details: "service closed the connection".to_string(),
                    },
                    (false, _) => RecognitionEvent::Canceled {
                        reason: CancellationReason::Error,
                        details: frame
                            .map(|f| format!("{}: {}", u16::from(f.code), f.reason))
                            .unwrap_or_default(),
                    },
                };
                flags.finish(&events, event);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "Azure Speech connection failed");
                flags.finish(
                    &events,
                    RecognitionEvent::Canceled {
                        reason: CancellationReason::Error,
                        details: err.to_string(),
                    },
                );
                return;
            }
        }
    }

    let event = if flags.stopping() {
        RecognitionEvent::SessionStopped
    } else {
        RecognitionEvent::Canceled {
            reason: CancellationReason::Error,
            details: "connection closed by service".to_string(),
        }
    };
    flags.finish(&events, event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Delivery, RecognitionMode};
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(2);

    fn service_text(path: &str, body: &str) -> Message {
        Message::Text(format!(
            "X-RequestId: {}\r\nPath: {}\r\nContent-Type: application/json; charset=utf-8\r\n\r\n{}",
            wire::new_id(),
            path,
            body
        ))
    }

    /// Request id and payload of a binary audio message.
    fn audio_parts(message: Message) -> (String, Vec<u8>) {
        let Message::Binary(data) = message else {
            panic!("expected audio message, got {:?}", message);
        };
        let header_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let header = std::str::from_utf8(&data[2..2 + header_len]).unwrap();
        let request_id = header
            .split("\r\n")
            .find_map(|line| line.strip_prefix("X-RequestId: "))
            .unwrap()
            .to_string();
        (request_id, data[2 + header_len..].to_vec())
    }

    fn provider() -> AzureSpeechProvider {
        AzureSpeechProvider::new(
            "wss://{region}.stt.speech.microsoft.com",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn service_url_carries_language_and_tuning() {
        let options = RecognitionOptions::default();
        let url = provider().service_url("westeurope", "de-DE", &options);

        assert!(url.starts_with(
            "wss://westeurope.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?"
        ));
        assert!(url.contains("language=de-DE"));
        assert!(url.contains("profanity=raw"));
        assert!(url.contains("segmentationSilenceTimeoutMs=100"));
        assert!(url.contains("initialSilenceTimeoutMs=3000"));
    }

    #[test]
    fn dictation_mode_changes_path() {
        let options = RecognitionOptions {
            mode: RecognitionMode::Dictation,
            ..RecognitionOptions::default()
        };
        let url = provider().service_url("eastus", "en-US", &options);
        assert!(url.contains("/speech/recognition/dictation/"));
    }

    #[tokio::test]
    async fn configure_rejects_bad_input() {
        let options = RecognitionOptions::default();
        let provider = provider();

        for (key, region, language) in [
            ("", "eastus", "en-US"),
            ("key", "east us", "en-US"),
            ("key", "eastus.evil.com/", "en-US"),
            ("key", "eastus", "en US&x=1"),
            ("bad\nkey", "eastus", "en-US"),
        ] {
            let result = provider
                .configure(Credentials::new(key, region), language, &options)
                .await;
            assert!(matches!(result, Err(ProviderError::Configuration(_))), "{key:?} {region:?} {language:?}");
        }
    }

    #[tokio::test]
    async fn sink_is_single_and_close_is_idempotent() {
        let mut handle = provider()
            .configure(Credentials::new("key", "eastus"), "en-US", &RecognitionOptions::default())
            .await
            .unwrap();

        assert!(handle.open_audio_sink().is_ok());
        assert!(matches!(handle.open_audio_sink(), Err(ProviderError::Protocol(_))));

        handle.close();
        handle.close();
        assert!(matches!(handle.stop().await, Err(ProviderError::Closed)));
    }

    #[test]
    fn only_first_terminal_event_is_delivered() {
        let (events, mut deliveries) = EventSink::channel();
        let flags = TurnFlags::default();

        flags.emit_result(&events, RecognitionEvent::Partial(String::new()));
        flags.emit_result(&events, RecognitionEvent::Partial("hel".to_string()));
        flags.finish(&events, RecognitionEvent::SessionStopped);
        flags.finish(
            &events,
            RecognitionEvent::Canceled {
                reason: CancellationReason::Error,
                details: "late".to_string(),
            },
        );

        let mut received = Vec::new();
        while let Ok(delivery) = deliveries.try_recv() {
            received.push(delivery);
        }
        assert_eq!(received.len(), 2);
        assert!(matches!(&received[0], crate::provider::Delivery::Event(RecognitionEvent::Partial(t)) if t == "hel"));
        assert!(matches!(&received[1], crate::provider::Delivery::Event(RecognitionEvent::SessionStopped)));
    }

    #[tokio::test]
    async fn silent_turn_end_opens_next_turn_until_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (reopened_tx, reopened) = oneshot::channel();

        let service = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();

            let config = socket.next().await.unwrap().unwrap();
            assert!(config.to_text().unwrap().contains("Path: speech.config"));
            let (first_turn, header) = audio_parts(socket.next().await.unwrap().unwrap());
            assert_eq!(&header[..4], b"RIFF");

            // Nobody spoke within the initial silence window.
            socket
                .send(service_text(
                    "speech.phrase",
                    r#"{"RecognitionStatus":"InitialSilenceTimeout","Offset":0,"Duration":30000000}"#,
                ))
                .await
                .unwrap();
            socket.send(service_text("turn.end", "{}")).await.unwrap();

            let (second_turn, header) = audio_parts(socket.next().await.unwrap().unwrap());
            assert_ne!(second_turn, first_turn);
            assert_eq!(&header[..4], b"RIFF");
            reopened_tx.send(()).unwrap();

            let (request_id, frame) = audio_parts(socket.next().await.unwrap().unwrap());
            assert_eq!(request_id, second_turn);
            assert_eq!(frame, vec![0x01, 0x00, 0x02, 0x00]);
            socket
                .send(service_text("speech.hypothesis", r#"{"Text":"hello"}"#))
                .await
                .unwrap();

            let (request_id, end_of_stream) = audio_parts(socket.next().await.unwrap().unwrap());
            assert_eq!(request_id, second_turn);
            assert!(end_of_stream.is_empty());
            socket.send(service_text("turn.end", "{}")).await.unwrap();

            while let Some(Ok(_)) = socket.next().await {}
        });

        let provider = AzureSpeechProvider::new(format!("ws://{}", addr), WAIT, WAIT);
        let mut handle = provider
            .configure(Credentials::new("key", "local"), "en-US", &RecognitionOptions::default())
            .await
            .unwrap();
        let mut sink = handle.open_audio_sink().unwrap();
        let (events, mut deliveries) = EventSink::channel();
        handle.start(events).await.unwrap();

        timeout(WAIT, reopened).await.unwrap().unwrap();
        sink.write(Bytes::from_static(&[0x01, 0x00, 0x02, 0x00])).unwrap();

        // The first turn ending must not surface as the end of the session.
        let first = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
        assert!(
            matches!(&first, Delivery::Event(RecognitionEvent::Partial(text)) if text == "hello"),
            "{:?}",
            first
        );

        sink.close();
        handle.stop().await.unwrap();
        let last = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
        assert!(
            matches!(&last, Delivery::Event(RecognitionEvent::SessionStopped)),
            "{:?}",
            last
        );

        handle.close();
        timeout(WAIT, service).await.unwrap().unwrap();
    }

    #[test]
    fn results_are_suppressed_after_stop() {
        let (events, mut deliveries) = EventSink::channel();
        let flags = TurnFlags::default();
        flags.results_closed.store(true, Ordering::SeqCst);

        flags.emit_result(&events, RecognitionEvent::Final("late".to_string()));
        assert!(deliveries.try_recv().is_err());
    }
}
