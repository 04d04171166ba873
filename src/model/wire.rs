//! Wire frames for the duplex speech-model session.
//!
//! The protocol is JSON over a WebSocket. Client frames are objects with a
//! single top-level key; server frames may carry several optional sections
//! at once (audio parts plus a resumption update, for example), so the
//! server side is one struct of options rather than an enum.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ==================== Client → server ====================

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Setup { setup: SessionSetup },
    RealtimeInput { realtime_input: RealtimeInput },
    ClientContent { client_content: ClientContent },
    ToolResponse { tool_response: ToolResponseFrame },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: ContentBlock,
    pub tools: Vec<ToolGroup>,
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
    pub realtime_input_config: RealtimeInputConfig,
    pub session_resumption: SessionResumptionConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolGroup {
    pub function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    pub voice_name: String,
}

/// Voice-activity-detection tuning. Low sensitivities plus a longer silence
/// window keep echo from ending turns prematurely.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInputConfig {
    pub start_of_speech_sensitivity: String,
    pub end_of_speech_sensitivity: String,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for RealtimeInputConfig {
    fn default() -> Self {
        Self {
            start_of_speech_sensitivity: "low".to_string(),
            end_of_speech_sensitivity: "low".to_string(),
            prefix_padding_ms: 100,
            silence_duration_ms: 500,
        }
    }
}

/// Empty handle requests resumption tokens for future reconnects; a present
/// handle re-attaches to the prior conversation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioBlob {
    pub mime_type: String,
    pub data: String,
}

impl AudioBlob {
    pub fn pcm16(pcm: &[u8], rate: u32) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={rate}"),
            data: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientContent {
    pub turns: Vec<ContentBlock>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

impl ContentBlock {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![TextPart { text: text.to_string() }],
        }
    }

    pub fn system(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![TextPart { text: text.to_string() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResponseFrame {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

// ==================== Server → client ====================

/// One server push. Any combination of sections may be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallFrame>,
    #[serde(default)]
    pub session_resumption_update: Option<ResumptionUpdate>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ModelPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

impl InlineData {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn decode(&self) -> Option<Vec<u8>> {
        base64::engine::general_purpose::STANDARD.decode(&self.data).ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallFrame {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumptionUpdate {
    #[serde(default)]
    pub new_handle: Option<String>,
    #[serde(default)]
    pub resumable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_have_single_top_key() {
        let audio = ClientMessage::RealtimeInput {
            realtime_input: RealtimeInput {
                audio: Some(AudioBlob::pcm16(&[0, 0, 1, 0], 16_000)),
                audio_stream_end: None,
            },
        };
        let value: Value = serde_json::to_value(&audio).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["realtime_input"]);
        assert_eq!(
            value["realtime_input"]["audio"]["mime_type"],
            "audio/pcm;rate=16000"
        );
    }

    #[test]
    fn test_server_message_multiple_sections() {
        let raw = serde_json::json!({
            "server_content": {
                "model_turn": {
                    "parts": [
                        {"inline_data": {"mime_type": "audio/pcm;rate=24000", "data": "AAA="}},
                        {"text": "hello"}
                    ]
                },
                "turn_complete": true
            },
            "session_resumption_update": {"new_handle": "h-42", "resumable": true}
        });

        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        let content = msg.server_content.unwrap();
        assert!(content.turn_complete);
        let parts = content.model_turn.unwrap().parts;
        assert!(parts[0].inline_data.as_ref().unwrap().is_audio());
        assert!(parts[0].inline_data.as_ref().unwrap().decode().is_some());
        assert_eq!(parts[1].text.as_deref(), Some("hello"));
        assert_eq!(
            msg.session_resumption_update.unwrap().new_handle.as_deref(),
            Some("h-42")
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = serde_json::json!({"usage_metadata": {"tokens": 12}});
        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.server_content.is_none());
        assert!(msg.tool_call.is_none());
    }
}
