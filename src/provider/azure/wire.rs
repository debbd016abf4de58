//! Azure Speech WebSocket message framing.
//!
//! Text messages are CRLF header lines, a blank line, then a body. Binary audio
//! messages start with a big-endian `u16` header length, followed by the same
//! header lines and the raw payload.

use crate::provider::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE_HZ};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use uuid::Uuid;

pub const PATH_SPEECH_CONFIG: &str = "speech.config";
pub const PATH_AUDIO: &str = "audio";
const AUDIO_CONTENT_TYPE: &str = "audio/x-wav";

/// Azure wants ids as 32 upper-case hex digits.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn headers(path: &str, request_id: &str, content_type: &str) -> String {
    format!(
        "Path: {}\r\nX-RequestId: {}\r\nX-Timestamp: {}\r\nContent-Type: {}\r\n",
        path,
        request_id,
        timestamp(),
        content_type
    )
}

pub fn text_message(path: &str, request_id: &str, content_type: &str, body: &str) -> String {
    format!("{}\r\n{}", headers(path, request_id, content_type), body)
}

/// An empty `payload` tells the service the audio stream has ended.
pub fn audio_message(request_id: &str, payload: &[u8]) -> Vec<u8> {
    let header = headers(PATH_AUDIO, request_id, AUDIO_CONTENT_TYPE);
    let mut message = Vec::with_capacity(2 + header.len() + payload.len());
    // Header lines are a few hundred bytes, far below u16::MAX.
    let _ = message.write_u16::<BigEndian>(header.len() as u16);
    message.extend_from_slice(header.as_bytes());
    message.extend_from_slice(payload);
    message
}

/// RIFF/WAVE header announcing the stream format; sizes are left at zero
/// because the stream length is unknown.
pub fn wav_header() -> Vec<u8> {
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE_HZ * block_align as u32;

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    let _ = header.write_u32::<LittleEndian>(0);
    header.extend_from_slice(b"WAVEfmt ");
    let _ = header.write_u32::<LittleEndian>(16);
    let _ = header.write_u16::<LittleEndian>(1); // PCM
    let _ = header.write_u16::<LittleEndian>(CHANNELS);
    let _ = header.write_u32::<LittleEndian>(SAMPLE_RATE_HZ);
    let _ = header.write_u32::<LittleEndian>(byte_rate);
    let _ = header.write_u16::<LittleEndian>(block_align);
    let _ = header.write_u16::<LittleEndian>(BITS_PER_SAMPLE);
    header.extend_from_slice(b"data");
    let _ = header.write_u32::<LittleEndian>(0);
    header
}

/// A text message received from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMessage {
    pub path: String,
    pub body: String,
}

impl ServiceMessage {
    pub fn parse(raw: &str) -> Option<Self> {
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
        let path = head.split("\r\n").find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("path")
                .then(|| value.trim().to_string())
        })?;

        Some(Self {
            path,
            body: body.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Hypothesis {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Phrase {
    recognition_status: String,
    #[serde(default)]
    display_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhraseOutcome {
    Recognized(String),
    /// Silence, babble, or end of a dictation; nothing to report.
    Nothing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Hypothesis(String),
    Phrase(PhraseOutcome),
    TurnEnd,
    Other(String),
}

impl ServiceEvent {
    pub fn interpret(message: &ServiceMessage) -> Result<Self, serde_json::Error> {
        let event = match message.path.to_ascii_lowercase().as_str() {
            "speech.hypothesis" | "speech.fragment" => {
                let hypothesis: Hypothesis = serde_json::from_str(&message.body)?;
                ServiceEvent::Hypothesis(hypothesis.text)
            }
            "speech.phrase" => {
                let phrase: Phrase = serde_json::from_str(&message.body)?;
                let outcome = match phrase.recognition_status.as_str() {
                    "Success" => PhraseOutcome::Recognized(phrase.display_text),
                    "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" | "EndOfDictation" => {
                        PhraseOutcome::Nothing
                    }
                    _ => PhraseOutcome::Failed(phrase.recognition_status),
                };
                ServiceEvent::Phrase(outcome)
            }
            "turn.end" => ServiceEvent::TurnEnd,
            _ => ServiceEvent::Other(message.path.clone()),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_message_prefixes_header_length() {
        let message = audio_message("ABC", b"\x01\x02");
        let header_len = u16::from_be_bytes([message[0], message[1]]) as usize;
        let header = std::str::from_utf8(&message[2..2 + header_len]).unwrap();

        assert!(header.starts_with("Path: audio\r\nX-RequestId: ABC\r\n"));
        assert!(header.ends_with("Content-Type: audio/x-wav\r\n"));
        assert_eq!(&message[2 + header_len..], b"\x01\x02");
    }

    #[test]
    fn wav_header_describes_16k_mono_pcm() {
        let header = wav_header();
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([header[24], header[25], header[26], header[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([header[28], header[29], header[30], header[31]]), 32_000);
        assert_eq!(u16::from_le_bytes([header[34], header[35]]), 16);
    }

    #[test]
    fn parses_path_case_insensitively() {
        let raw = "X-RequestId: 1\r\npath: speech.hypothesis\r\nContent-Type: application/json\r\n\r\n{\"Text\":\"hello\"}";
        let message = ServiceMessage::parse(raw).unwrap();
        assert_eq!(message.path, "speech.hypothesis");
        assert_eq!(
            ServiceEvent::interpret(&message).unwrap(),
            ServiceEvent::Hypothesis("hello".to_string())
        );
    }

    #[test]
    fn phrase_statuses_map_to_outcomes() {
        let phrase = |status: &str| ServiceMessage {
            path: "speech.phrase".to_string(),
            body: format!(r#"{{"RecognitionStatus":"{}","DisplayText":"Hi there."}}"#, status),
        };

        assert_eq!(
            ServiceEvent::interpret(&phrase("Success")).unwrap(),
            ServiceEvent::Phrase(PhraseOutcome::Recognized("Hi there.".to_string()))
        );
        assert_eq!(
            ServiceEvent::interpret(&phrase("InitialSilenceTimeout")).unwrap(),
            ServiceEvent::Phrase(PhraseOutcome::Nothing)
        );
        assert_eq!(
            ServiceEvent::interpret(&phrase("BadRequest")).unwrap(),
            ServiceEvent::Phrase(PhraseOutcome::Failed("BadRequest".to_string()))
        );
    }

    #[test]
    fn message_without_path_is_rejected() {
        assert!(ServiceMessage::parse("X-RequestId: 1\r\n\r\n{}").is_none());
    }
}
