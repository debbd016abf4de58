//! # Relay Wire Protocol
//!
//! ## Client → Server:
//! - **Control**: `{"cmd":"config","key":..,"region":..,"language":..}` or `{"cmd":"stop"}`
//! - **Audio**: anything else, taken as raw PCM (16 kHz, 16-bit, mono)
//!
//! ## Server → Client:
//! One JSON object per message, tagged by `type`: `started`, `partial`, `final`,
//! `canceled`, `sessionStopped`, `error`.
//!
//! ## Classification:
//! A message is control only when it parses completely as one of the two commands.
//! Everything else, including JSON that merely looks like a command, is audio.
//! Failure to parse is an answer, not an error.

use crate::provider::{CancellationReason, RecognitionEvent};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Structured commands a client can send.
///
/// ## Serde Tagging:
/// `#[serde(tag = "cmd")]` reads the variant name from the `cmd` field, so
/// `{"cmd":"stop"}` becomes `ControlMessage::Stop`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    Config {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        language: Option<String>,
    },
    Stop,
}

/// Result of classifying one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Control(ControlMessage),
    Audio(Bytes),
}

/// Decide whether `payload` is a command or an audio frame. Never fails.
pub fn classify(payload: Bytes) -> InboundMessage {
    // PCM only reaches the JSON parser when its first byte happens to be `{`.
    if payload.first() != Some(&b'{') {
        return InboundMessage::Audio(payload);
    }

    match serde_json::from_slice::<ControlMessage>(&payload) {
        Ok(command) => InboundMessage::Control(command),
        Err(_) => InboundMessage::Audio(payload),
    }
}

/// Messages sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundEvent {
    Started,
    Partial { text: String },
    Final { text: String },
    Canceled { reason: CancellationReason, details: String },
    SessionStopped,
    Error { message: String },
}

impl OutboundEvent {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Started => "started",
            OutboundEvent::Partial { .. } => "partial",
            OutboundEvent::Final { .. } => "final",
            OutboundEvent::Canceled { .. } => "canceled",
            OutboundEvent::SessionStopped => "sessionStopped",
            OutboundEvent::Error { .. } => "error",
        }
    }
}

impl From<RecognitionEvent> for OutboundEvent {
    fn from(event: RecognitionEvent) -> Self {
        match event {
            RecognitionEvent::Partial(text) => OutboundEvent::Partial { text },
            RecognitionEvent::Final(text) => OutboundEvent::Final { text },
            RecognitionEvent::Canceled { reason, details } => OutboundEvent::Canceled { reason, details },
            RecognitionEvent::SessionStopped => OutboundEvent::SessionStopped,
            RecognitionEvent::Error(message) => OutboundEvent::Error { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_str(text: &str) -> InboundMessage {
        classify(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn config_with_all_fields_is_control() {
        let message = classify_str(r#"{"cmd":"config","key":"k","region":"r","language":"en-US"}"#);
        assert_eq!(
            message,
            InboundMessage::Control(ControlMessage::Config {
                key: Some("k".to_string()),
                region: Some("r".to_string()),
                language: Some("en-US".to_string()),
            })
        );
    }

    #[test]
    fn config_missing_credentials_is_still_control() {
        let message = classify_str(r#"{"cmd":"config","region":null}"#);
        assert_eq!(
            message,
            InboundMessage::Control(ControlMessage::Config {
                key: None,
                region: None,
                language: None,
            })
        );
    }

    #[test]
    fn stop_ignores_extra_fields() {
        assert_eq!(
            classify_str(r#"{"cmd":"stop","reason":"user"}"#),
            InboundMessage::Control(ControlMessage::Stop)
        );
    }

    #[test]
    fn near_json_falls_back_to_audio() {
        for text in [
            r#"{"cmd":"config","key":"k""#,
            r#"{"cmd":"pause"}"#,
            r#"{"cmd":"config","key":42}"#,
            r#"{"type":"stop"}"#,
            "{",
            " {\"cmd\":\"stop\"}",
        ] {
            assert_eq!(
                classify_str(text),
                InboundMessage::Audio(Bytes::copy_from_slice(text.as_bytes())),
                "{}",
                text
            );
        }
    }

    #[test]
    fn pcm_is_audio() {
        let pcm = Bytes::from_static(&[0x7b, 0x00, 0xff, 0x7f, 0x10, 0x00]);
        assert_eq!(classify(pcm.clone()), InboundMessage::Audio(pcm));
        assert_eq!(classify(Bytes::new()), InboundMessage::Audio(Bytes::new()));
    }

    #[test]
    fn outbound_events_use_wire_names() {
        assert_eq!(OutboundEvent::Started.to_json().unwrap(), r#"{"type":"started"}"#);
        assert_eq!(OutboundEvent::SessionStopped.to_json().unwrap(), r#"{"type":"sessionStopped"}"#);
        assert_eq!(
            OutboundEvent::Partial { text: "hel".to_string() }.to_json().unwrap(),
            r#"{"type":"partial","text":"hel"}"#
        );
        assert_eq!(
            OutboundEvent::Canceled {
                reason: CancellationReason::Error,
                details: "401".to_string()
            }
            .to_json()
            .unwrap(),
            r#"{"type":"canceled","reason":"Error","details":"401"}"#
        );
        assert_eq!(
            OutboundEvent::error("Azure key and region are required").to_json().unwrap(),
            r#"{"type":"error","message":"Azure key and region are required"}"#
        );
    }
}
