//! Message envelopes exchanged over the duplex channel.
//!
//! Every message is a JSON object whose `type` field selects the payload
//! schema. Decoding is forward compatible: an unrecognised `type` becomes
//! [`ServerMessage::Unknown`] instead of an error, so older UIs keep working
//! against newer engines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use loopbridge_types::{DeclarationSet, TrackId, TrackScope};

/// Version sent in `Hello`; the host rejects other versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Logical channel used when the caller has no reason to pick another.
pub const DEFAULT_CHANNEL: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Messages sent from the UI to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Sent once, right after the handshake completes.
    AppStarted,
    SetParameter {
        #[serde(default)]
        track: TrackScope,
        name: String,
        value: f32,
    },
    SetStep {
        track: TrackId,
        step: usize,
        active: bool,
    },
    /// UI-side log line forwarded to the engine's log.
    Log { level: LogLevel, message: String },
}

impl ClientMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::AppStarted => "AppStarted",
            ClientMessage::SetParameter { .. } => "SetParameter",
            ClientMessage::SetStep { .. } => "SetStep",
            ClientMessage::Log { .. } => "Log",
        }
    }
}

/// Messages sent from the engine to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Full replacement of the parameter declarations.
    PublishParameters { parameters: DeclarationSet },
    ParameterChanged {
        #[serde(default)]
        track: TrackScope,
        name: String,
        value: f32,
    },
    /// `null` position means the transport is stopped.
    #[serde(rename_all = "camelCase")]
    PlaybackPosition { position_beats: Option<f64> },
    #[serde(rename_all = "camelCase")]
    SequenceChanged {
        track: TrackId,
        active_steps: Vec<usize>,
    },
    EngineError { message: String },
    /// A `type` this build does not know. Never encoded.
    #[serde(skip)]
    Unknown { kind: String },
}

impl ServerMessage {
    /// Every `type` tag this build can decode.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "PublishParameters",
        "ParameterChanged",
        "PlaybackPosition",
        "SequenceChanged",
        "EngineError",
    ];

    pub fn type_name(&self) -> &str {
        match self {
            ServerMessage::PublishParameters { .. } => "PublishParameters",
            ServerMessage::ParameterChanged { .. } => "ParameterChanged",
            ServerMessage::PlaybackPosition { .. } => "PlaybackPosition",
            ServerMessage::SequenceChanged { .. } => "SequenceChanged",
            ServerMessage::EngineError { .. } => "EngineError",
            ServerMessage::Unknown { kind } => kind,
        }
    }
}

/// Per-message wrapper carried inside a `Message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub id: u64,
    pub channel: String,
    pub message: M,
}

/// Connection-level frames. Application messages travel as `Message`
/// with an undecoded body so one bad message never tears down the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Hello {
        protocol_version: u32,
        client_name: String,
        channels: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Welcome { session_id: u64, channels: Vec<String> },
    Rejected { reason: String },
    Message(Envelope<Value>),
    Goodbye,
}

impl Frame {
    pub fn message<M: Serialize>(id: u64, channel: &str, message: &M) -> Result<Self, EncodeError> {
        let message = serde_json::to_value(message).map_err(|e| EncodeError(e.to_string()))?;
        Ok(Frame::Message(Envelope {
            id,
            channel: channel.to_string(),
            message,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not a JSON object with a string `type` field.
    #[error("not a message envelope: {0}")]
    NotAnEnvelope(String),
    /// A known `type` whose payload does not match its schema.
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(pub String);

pub fn encode(message: &ClientMessage) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<ServerMessage, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::NotAnEnvelope(e.to_string()))?;
    decode_value(value)
}

/// Decode an envelope body that has already been parsed out of a frame.
pub fn decode_value(value: Value) -> Result<ServerMessage, DecodeError> {
    let kind = envelope_type(&value)?;
    if !ServerMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(ServerMessage::Unknown { kind });
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

/// Engine-side encode. Fails for [`ServerMessage::Unknown`].
pub fn encode_server(message: &ServerMessage) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
}

/// Engine-side decode. Unknown client types are malformed: the engine does
/// not guess at UI intent.
pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::NotAnEnvelope(e.to_string()))?;
    decode_client_value(value)
}

pub fn decode_client_value(value: Value) -> Result<ClientMessage, DecodeError> {
    let kind = envelope_type(&value)?;
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

fn envelope_type(value: &Value) -> Result<String, DecodeError> {
    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::NotAnEnvelope("expected a JSON object".into()))?;
    object
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::NotAnEnvelope("missing string field `type`".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopbridge_types::ParameterDeclaration;

    #[test]
    fn app_started_wire_format() {
        let bytes = encode(&ClientMessage::AppStarted).unwrap();
        assert_eq!(bytes, br#"{"type":"AppStarted"}"#);
    }

    #[test]
    fn set_parameter_wire_format() {
        let msg = ClientMessage::SetParameter {
            track: TrackScope::Track(TrackId::new(3).unwrap()),
            name: "volume".into(),
            value: 1.0,
        };
        let value: Value = serde_json::from_slice(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "SetParameter");
        assert_eq!(value["track"], 3);
        assert_eq!(value["name"], "volume");
        assert_eq!(value["value"], 1.0);
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let msg = decode(br#"{"type":"SpectrumFrame","bins":[1,2,3]}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown { kind: "SpectrumFrame".into() });
    }

    #[test]
    fn known_type_missing_field_is_malformed() {
        let err = decode(br#"{"type":"PublishParameters"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { ref kind, .. } if kind == "PublishParameters"));

        let err = decode(br#"{"type":"ParameterChanged","value":0.5}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn wrong_field_type_is_malformed() {
        let err = decode(br#"{"type":"EngineError","message":42}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn not_an_envelope() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::NotAnEnvelope(_))));
        assert!(matches!(decode(b"[1,2]"), Err(DecodeError::NotAnEnvelope(_))));
        assert!(matches!(decode(br#"{"kind":"x"}"#), Err(DecodeError::NotAnEnvelope(_))));
        assert!(matches!(decode(br#"{"type":7}"#), Err(DecodeError::NotAnEnvelope(_))));
    }

    #[test]
    fn publish_parameters_keeps_order() {
        let json = br#"{"type":"PublishParameters","parameters":[
            {"name":"volume","default":0.8},
            {"name":"speed","track":2,"min":-2,"max":2,"default":1}
        ]}"#;
        match decode(json).unwrap() {
            ServerMessage::PublishParameters { parameters } => {
                let names: Vec<&str> = parameters.iter().map(|d| d.name.as_str()).collect();
                assert_eq!(names, vec!["volume", "speed"]);
            }
            other => panic!("expected PublishParameters, got {:?}", other),
        }
    }

    #[test]
    fn playback_position_null_means_stopped() {
        let msg = decode(br#"{"type":"PlaybackPosition","positionBeats":null}"#).unwrap();
        assert_eq!(msg, ServerMessage::PlaybackPosition { position_beats: None });
        let msg = decode(br#"{"type":"PlaybackPosition","positionBeats":4.25}"#).unwrap();
        assert_eq!(msg, ServerMessage::PlaybackPosition { position_beats: Some(4.25) });
    }

    #[test]
    fn known_types_match_variants() {
        let samples = vec![
            ServerMessage::PublishParameters {
                parameters: vec![ParameterDeclaration::continuous(TrackScope::Master, "volume", 0.0, 1.0, 0.5)].into(),
            },
            ServerMessage::ParameterChanged { track: TrackScope::Master, name: "volume".into(), value: 0.2 },
            ServerMessage::PlaybackPosition { position_beats: Some(1.0) },
            ServerMessage::SequenceChanged { track: TrackId::new(1).unwrap(), active_steps: vec![0, 4] },
            ServerMessage::EngineError { message: "xrun".into() },
        ];
        assert_eq!(samples.len(), ServerMessage::KNOWN_TYPES.len());
        for msg in samples {
            let bytes = encode_server(&msg).unwrap();
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            assert!(ServerMessage::KNOWN_TYPES.contains(&value["type"].as_str().unwrap()));
            assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_variant_is_never_encoded() {
        assert!(encode_server(&ServerMessage::Unknown { kind: "X".into() }).is_err());
    }

    #[test]
    fn host_rejects_unknown_client_type() {
        let err = decode_client(br#"{"type":"Teleport"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { ref kind, .. } if kind == "Teleport"));
        assert_eq!(decode_client(br#"{"type":"AppStarted"}"#).unwrap(), ClientMessage::AppStarted);
    }

    #[test]
    fn frame_tags() {
        let frame = Frame::message(7, DEFAULT_CHANNEL, &ClientMessage::AppStarted).unwrap();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["frame"], "Message");
        assert_eq!(value["id"], 7);
        assert_eq!(value["channel"], "default");
        assert_eq!(value["message"]["type"], "AppStarted");
    }
}
