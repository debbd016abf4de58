//! Scripted provider for session tests.
//!
//! Every audio frame produces a `Partial` naming the frame, end of audio produces
//! one `Final`, and `stop` answers with `SessionStopped` unless scripted otherwise.
//! A frame reading `cancel` makes the engine fail with `Canceled { Error }`.

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct CallLog {
    pub configures: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub closes: AtomicUsize,
    pub frames: Mutex<Vec<Bytes>>,
    pub audio_ended: AtomicUsize,
    pub languages: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().expect("frames lock poisoned").clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Script {
    Normal,
    RejectCredentials,
    FailStart,
    /// Never answers `stop` with a terminal event.
    SilentOnStop,
    /// `stop` returns at once; a late `Partial` and `Final` follow, then `SessionStopped`.
    LateResults,
}

pub struct MockProvider {
    pub calls: Arc<CallLog>,
    script: Mutex<Vec<Script>>,
}

impl MockProvider {
    pub fn new(script: Script) -> Self {
        Self::scripted(vec![script])
    }

    /// One entry per `configure` call; the last entry repeats.
    pub fn scripted(script: Vec<Script>) -> Self {
        Self {
            calls: Arc::new(CallLog::default()),
            script: Mutex::new(script),
        }
    }

    fn next_script(&self) -> Script {
        let mut script = self.script.lock().expect("script lock poisoned");
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().copied().unwrap_or(Script::Normal)
        }
    }
}

#[async_trait]
impl RecognitionProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn configure(
        &self,
        _credentials: Credentials,
        language: &str,
        _options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionHandle>, ProviderError> {
        self.calls.configures.fetch_add(1, Ordering::SeqCst);
        self.calls
            .languages
            .lock()
            .expect("languages lock poisoned")
            .push(language.to_string());

        let script = self.next_script();
        if script == Script::RejectCredentials {
            return Err(ProviderError::Configuration("credentials rejected".to_string()));
        }

        Ok(Box::new(MockHandle {
            calls: self.calls.clone(),
            script,
            audio: None,
            events: None,
            reader: None,
            late: None,
        }))
    }
}

pub struct MockHandle {
    calls: Arc<CallLog>,
    script: Script,
    audio: Option<AudioStream>,
    events: Option<EventSink>,
    reader: Option<JoinHandle<()>>,
    late: Option<JoinHandle<()>>,
}

#[async_trait]
impl RecognitionHandle for MockHandle {
    fn open_audio_sink(&mut self) -> Result<AudioSink, ProviderError> {
        if self.audio.is_some() {
            return Err(ProviderError::Protocol("audio sink already open".to_string()));
        }
        let (sink, stream) = audio_channel();
        self.audio = Some(stream);
        Ok(sink)
    }

    async fn start(&mut self, events: EventSink) -> Result<(), ProviderError> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        if self.script == Script::FailStart {
            return Err(ProviderError::Connection("engine unreachable".to_string()));
        }

        let mut audio = self
            .audio
            .take()
            .ok_or_else(|| ProviderError::Protocol("no audio sink".to_string()))?;
        let calls = self.calls.clone();
        let sink = events.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut count = 0;
            while let Some(frame) = audio.next_frame().await {
                if frame.as_ref() == b"cancel" {
                    sink.emit(RecognitionEvent::Canceled {
                        reason: CancellationReason::Error,
                        details: "engine fault".to_string(),
                    });
                    return;
                }
                count += 1;
                calls.frames.lock().expect("frames lock poisoned").push(frame);
                sink.emit(RecognitionEvent::Partial(format!("frame {}", count)));
            }
            calls.audio_ended.fetch_add(1, Ordering::SeqCst);
            if count > 0 {
                sink.emit(RecognitionEvent::Final(format!("{} frames", count)));
            }
        }));
        self.events = Some(events);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProviderError> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        match (self.script, &self.events) {
            (Script::SilentOnStop, _) | (_, None) => {}
            (Script::LateResults, Some(events)) => {
                let events = events.clone();
                self.late = Some(tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    events.emit(RecognitionEvent::Partial("late".to_string()));
                    events.emit(RecognitionEvent::Final("late".to_string()));
                    events.emit(RecognitionEvent::SessionStopped);
                }));
            }
            (_, Some(events)) => {
                events.emit(RecognitionEvent::SessionStopped);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(late) = self.late.take() {
            late.abort();
        }
        self.events = None;
        self.audio = None;
    }
}
