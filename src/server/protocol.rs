//! JSON message protocol between browser clients and the relay.
//!
//! Every frame is a WebSocket text frame holding one JSON object with a
//! `type` discriminator.

use crate::defaults;
use crate::engine::EngineOptions;
use crate::error::{RelayError, Result};
use crate::pipeline::types::StemResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types a client may send.
const CLIENT_TYPES: &[&str] = &["configure", "audio_data"];

/// Messages sent by clients to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Select and configure the separation engine
    Configure {
        #[serde(default)]
        config: EngineOptions,
    },
    /// A chunk of interleaved audio
    AudioData {
        #[serde(default)]
        data: Vec<f32>,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
        #[serde(default)]
        timestamp: f64,
    },
}

fn default_sample_rate() -> u32 {
    defaults::SAMPLE_RATE
}

fn default_channels() -> u16 {
    defaults::CHANNELS
}

impl ClientMessage {
    /// Serialize message to JSON string.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a client frame.
    ///
    /// Unlike a plain `serde_json::from_str`, this distinguishes unparseable
    /// text from a well-formed object with an unknown `type`, producing the
    /// error strings clients display.
    ///
    /// # Errors
    /// Returns `MalformedInput` with `Invalid JSON message`,
    /// `Unknown message type: <type>` or a field-level description.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|_| RelayError::MalformedInput {
            message: "Invalid JSON message".to_string(),
        })?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        if !CLIENT_TYPES.contains(&kind.as_str()) {
            return Err(RelayError::MalformedInput {
                message: format!("Unknown message type: {}", kind),
            });
        }

        serde_json::from_value(value).map_err(|e| RelayError::MalformedInput {
            message: format!("Invalid {} message: {}", kind, e),
        })
    }
}

/// Messages sent by the relay to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Engine configured
    Status {
        status: String,
        model: String,
        /// Buses the engine returns before post-processing
        stems: Vec<String>,
    },
    /// Something went wrong; the connection stays open
    Error { error: String },
    /// One mono stem of one processed window
    SeparatedAudio {
        stem: String,
        data: Vec<f32>,
        timestamp: f64,
    },
}

impl ServerMessage {
    /// Status reply for a successful `configure`.
    pub fn configured(model: &str, stems: Vec<String>) -> Self {
        ServerMessage::Status {
            status: format!("Model {} loaded/configured successfully", model),
            model: model.to_string(),
            stems,
        }
    }

    /// Error reply carrying the error's display text.
    pub fn error(error: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            error: error.to_string(),
        }
    }

    /// Serialize message to JSON string.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize message from JSON string.
    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<StemResult> for ServerMessage {
    fn from(stem: StemResult) -> Self {
        ServerMessage::SeparatedAudio {
            stem: stem.name,
            data: stem.samples,
            timestamp: stem.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_error(text: &str) -> String {
        match ClientMessage::from_json(text) {
            Err(RelayError::MalformedInput { message }) => message,
            other => panic!("Expected MalformedInput, got {:?}", other),
        }
    }

    // Client message tests

    #[test]
    fn test_audio_data_defaults() {
        let msg = ClientMessage::from_json(r#"{"type":"audio_data","data":[0.5,-0.5]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::AudioData {
                data: vec![0.5, -0.5],
                sample_rate: 44100,
                channels: 2,
                timestamp: 0.0,
            }
        );
    }

    #[test]
    fn test_audio_data_explicit_fields() {
        let msg = ClientMessage::from_json(
            r#"{"type":"audio_data","data":[1,0],"sample_rate":48000,"channels":1,"timestamp":12.5}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::AudioData {
                data,
                sample_rate,
                channels,
                timestamp,
            } => {
                assert_eq!(data, vec![1.0, 0.0]);
                assert_eq!(sample_rate, 48000);
                assert_eq!(channels, 1);
                assert_eq!(timestamp, 12.5);
            }
            other => panic!("Expected AudioData, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_data_without_data_decodes_empty() {
        let msg = ClientMessage::from_json(r#"{"type":"audio_data"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::AudioData { data, .. } if data.is_empty()));
    }

    #[test]
    fn test_configure_camel_case_options() {
        let msg = ClientMessage::from_json(
            r#"{"type":"configure","config":{"model":"band-split","realTime":false,"aggressiveness":0.7}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Configure { config } => {
                assert_eq!(config.model.as_deref(), Some("band-split"));
                assert!(!config.real_time);
                assert!((config.aggressiveness - 0.7).abs() < 1e-6);
            }
            other => panic!("Expected Configure, got {:?}", other),
        }
    }

    #[test]
    fn test_configure_without_config_uses_defaults() {
        let msg = ClientMessage::from_json(r#"{"type":"configure"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Configure {
                config: EngineOptions::default()
            }
        );
    }

    #[test]
    fn test_invalid_json_message() {
        assert_eq!(decode_error("not json at all"), "Invalid JSON message");
        assert_eq!(decode_error(r#"{"type":"configure""#), "Invalid JSON message");
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(
            decode_error(r#"{"type":"start_recording"}"#),
            "Unknown message type: start_recording"
        );
        assert_eq!(decode_error(r#"{"data":[1]}"#), "Unknown message type: null");
        assert_eq!(decode_error(r#"{"type":7}"#), "Unknown message type: 7");
    }

    #[test]
    fn test_known_type_with_bad_fields() {
        let message = decode_error(r#"{"type":"audio_data","data":"loud"}"#);
        assert!(message.starts_with("Invalid audio_data message"), "{}", message);
    }

    #[test]
    fn test_client_message_json_roundtrip() {
        let msg = ClientMessage::Configure {
            config: EngineOptions::for_model("htdemucs"),
        };
        let json = msg.to_json().expect("should serialize");
        assert!(json.contains("\"type\":\"configure\""));
        assert!(json.contains("\"realTime\":true"));
        assert_eq!(ClientMessage::from_json(&json).unwrap(), msg);
    }

    // Server message tests

    #[test]
    fn test_separated_audio_json_format() {
        let msg = ServerMessage::from(StemResult::new("vocals", vec![0.0, 1.0], 3.0));
        let json = msg.to_json().expect("should serialize");
        assert_eq!(
            json,
            r#"{"type":"separated_audio","stem":"vocals","data":[0.0,1.0],"timestamp":3.0}"#
        );
    }

    #[test]
    fn test_error_json_format() {
        let json = ServerMessage::error(RelayError::NoEngineConfigured)
            .to_json()
            .expect("should serialize");
        assert_eq!(json, r#"{"type":"error","error":"No engine configured"}"#);
    }

    #[test]
    fn test_status_json_roundtrip() {
        let msg = ServerMessage::configured("band-split", vec!["low".to_string()]);
        let json = msg.to_json().expect("should serialize");
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"model\":\"band-split\""));
        assert!(json.contains("loaded/configured successfully"));
        assert_eq!(ServerMessage::from_json(&json).unwrap(), msg);
    }
}
