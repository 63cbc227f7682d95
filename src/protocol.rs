//! # Realtime Wire Protocol
//!
//! JSON messages exchanged with the realtime agent (directly or through the relay).
//! Every message carries a `type` discriminator.
//!
//! ## Client → Agent:
//! - `session.update`: audio formats, turn detection, transcription, tools
//! - `input_audio_buffer.append`: one base64 PCM16 block
//! - `input_audio_buffer.clear`: discard buffered input after a barge-in
//! - `conversation.item.create`: acknowledge a tool call
//! - `response.create`: ask the agent to continue
//!
//! ## Agent → Client:
//! Parsed into [`InboundMessage`]. Anything not listed there is `Other` and ignored.

use crate::config::{AppConfig, TurnDetectionConfig};
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Name of the tool the agent calls with assessment patches.
pub const ASSESSMENT_TOOL: &str = "updateAssessmentState";

/// `call_id` prefix of assessment calls injected by the relay's sidecar.
pub const SIDECAR_CALL_PREFIX: &str = "sidecar_";

/// Messages the agent sends that the client acts on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// A fragment of synthesized speech
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// Complete arguments of a tool call
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        #[serde(default)]
        name: String,
        arguments: String,
        #[serde(default)]
        call_id: String,
    },

    /// Server VAD heard the user start talking
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// Remote failure, either `{error: {message}}` or the relay's flat `{message}`
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorBody>,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscript {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AgentTranscript {
        #[serde(default)]
        transcript: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl InboundMessage {
    /// Human-readable text of an `error` message.
    pub fn error_text(&self) -> Option<String> {
        match self {
            InboundMessage::Error { error, message } => Some(
                error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .filter(|m| !m.is_empty())
                    .or_else(|| message.clone())
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            _ => None,
        }
    }
}

/// Parse one text frame from the agent.
pub fn parse_inbound(text: &str) -> AppResult<InboundMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,

    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl OutboundMessage {
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::SessionUpdate { .. } => "session.update",
            OutboundMessage::AudioAppend { .. } => "input_audio_buffer.append",
            OutboundMessage::AudioClear => "input_audio_buffer.clear",
            OutboundMessage::ItemCreate { .. } => "conversation.item.create",
            OutboundMessage::ResponseCreate => "response.create",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
    pub tools: Vec<Value>,
    pub tool_choice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl From<&TurnDetectionConfig> for TurnDetection {
    fn from(config: &TurnDetectionConfig) -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: config.threshold,
            prefix_padding_ms: config.prefix_padding_ms,
            silence_duration_ms: config.silence_duration_ms,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            modalities: vec!["audio".to_string(), "text".to_string()],
            instructions: config.client.instructions.clone(),
            voice: config.client.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionConfig {
                model: config.upstream.transcription_model.clone(),
            },
            turn_detection: TurnDetection::from(&config.turn_detection),
            tools: vec![assessment_tool_schema()],
            tool_choice: "auto".to_string(),
        }
    }
}

/// JSON schema of the assessment tool offered to the agent.
pub fn assessment_tool_schema() -> Value {
    let dimension_state = json!({
        "type": "object",
        "properties": {
            "score": { "type": "number" },
            "confidence": { "type": "string", "enum": ["LOW", "MEDIUM", "HIGH"] },
            "evidenceCount": { "type": "integer" },
            "trend": { "type": "string", "enum": ["up", "down", "stable"] }
        }
    });
    let dimension_codes = json!(["DT", "TR", "CO", "CA", "EP"]);

    json!({
        "type": "function",
        "name": ASSESSMENT_TOOL,
        "description": "Report the current assessment after each user turn.",
        "parameters": {
            "type": "object",
            "properties": {
                "dimensions": {
                    "type": "object",
                    "properties": {
                        "DT": dimension_state,
                        "TR": dimension_state,
                        "CO": dimension_state,
                        "CA": dimension_state,
                        "EP": dimension_state
                    }
                },
                "newEvidence": {
                    "type": "object",
                    "properties": {
                        "dimension": { "type": "string", "enum": dimension_codes },
                        "type": { "type": "string", "enum": ["positive", "negative", "contextual"] },
                        "summary": { "type": "string" },
                        "timestamp": { "type": "string" }
                    },
                    "required": ["dimension", "type", "summary"]
                },
                "contradiction": {
                    "type": "object",
                    "properties": {
                        "dimension": { "type": "string", "enum": dimension_codes },
                        "earlyStatement": { "type": "string" },
                        "lateStatement": { "type": "string" },
                        "resolution": { "type": "string" }
                    }
                },
                "phase": {
                    "type": "string",
                    "enum": ["OPENING", "CORE", "GAP_FILLING", "VALIDATION", "CLOSING"]
                },
                "isComplete": { "type": "boolean" },
                "summary": { "type": "string" },
                "strengths": { "type": "array", "items": { "type": "string" } },
                "developmentPriorities": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["phase"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_delta() {
        let msg = parse_inbound(r#"{"type":"response.audio.delta","delta":"AAAA","item_id":"x"}"#).unwrap();
        assert_eq!(msg, InboundMessage::AudioDelta { delta: "AAAA".to_string() });
    }

    #[test]
    fn test_parse_function_call() {
        let msg = parse_inbound(
            r#"{"type":"response.function_call_arguments.done","name":"updateAssessmentState","arguments":"{\"phase\":\"CORE\"}","call_id":"c1"}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::FunctionCallDone { name, arguments, call_id } => {
                assert_eq!(name, ASSESSMENT_TOOL);
                assert_eq!(arguments, r#"{"phase":"CORE"}"#);
                assert_eq!(call_id, "c1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_both_error_shapes() {
        let nested = parse_inbound(r#"{"type":"error","error":{"message":"bad key"}}"#).unwrap();
        assert_eq!(nested.error_text().as_deref(), Some("bad key"));
        let flat = parse_inbound(r#"{"type":"error","message":"upstream down"}"#).unwrap();
        assert_eq!(flat.error_text().as_deref(), Some("upstream down"));
    }

    #[test]
    fn test_unknown_types_are_other() {
        let msg = parse_inbound(r#"{"type":"response.done","response":{}}"#).unwrap();
        assert_eq!(msg, InboundMessage::Other);
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        let append = OutboundMessage::AudioAppend { audio: "AAAA".to_string() };
        assert_eq!(
            append.to_json().unwrap(),
            r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#
        );
        assert_eq!(OutboundMessage::AudioClear.to_json().unwrap(), r#"{"type":"input_audio_buffer.clear"}"#);

        let ack = OutboundMessage::ItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: "c1".to_string(),
                output: "{}".to_string(),
            },
        };
        let value: Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "c1");
    }

    #[test]
    fn test_session_update_carries_tool_and_formats() {
        let update = OutboundMessage::SessionUpdate {
            session: SessionConfig::from_config(&AppConfig::default()),
        };
        let value: Value = serde_json::from_str(&update.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(value["session"]["tools"][0]["name"], ASSESSMENT_TOOL);
    }
}
