//! Duplex channel framing
//!
//! Outbound frames go to the relay as `{type: ...}` JSON objects, except
//! captured audio, which normally travels as raw binary frames. Inbound frames
//! wrap the remote model's server events in `{type: "message", data: ...}`.

use crate::codec;
use crate::error::Result;
use serde::{Deserialize, Serialize, Serializer};

pub const FEEDBACK_TOOL: &str = "report_feedback";

/// Sample rate assumed for inbound audio whose MIME type has no `rate=`.
pub const DEFAULT_RESPONSE_RATE: u32 = 24_000;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Tagged PCM16 payload, base64-encoded when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
}

impl MediaChunk {
    /// Mono little-endian PCM16 at `rate`.
    pub fn pcm16(data: Vec<u8>, rate: u32) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", rate),
            data,
        }
    }
}

fn serialize_base64<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&codec::encode(data))
}

/// Message sent from the client to the relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Session parameters, sent once before anything else
    Config { config: SessionSetup },
    /// Captured audio
    Audio { media: MediaChunk },
    /// Synthetic user utterance
    Text { text: String },
    /// Acknowledgment of tool calls
    ToolResponse { response: ToolResponse },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Audio { .. } => "audio",
            Self::Text { .. } => "text",
            Self::ToolResponse { .. } => "tool_response",
        }
    }
}

/// Session parameters carried by the `config` frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    /// Chosen by the relay; kept for logging only
    #[serde(skip)]
    pub model: String,
    pub response_modalities: Vec<String>,
    pub speech_config: serde_json::Value,
    pub system_instruction: String,
    pub tools: Vec<Tool>,
    pub input_audio_transcription: serde_json::Value,
    pub output_audio_transcription: serde_json::Value,
}

impl SessionSetup {
    /// Audio-only session with both transcriptions and the feedback tool.
    pub fn audio(model: &str, voice: &str, system_instruction: String) -> Self {
        Self {
            model: model.to_string(),
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            }),
            system_instruction,
            tools: vec![Tool {
                function_declarations: vec![feedback_tool_declaration()],
            }],
            input_audio_transcription: serde_json::json!({}),
            output_audio_transcription: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Declaration of `report_feedback`: `japanese` and `advice` are required,
/// `correction` is optional.
pub fn feedback_tool_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: FEEDBACK_TOOL.to_string(),
        description: "Show pronunciation, grammar or vocabulary feedback on the user's feedback card. \
                      Call this whenever the user makes a mistake."
            .to_string(),
        parameters: serde_json::json!({
            "type": "OBJECT",
            "properties": {
                "japanese": {
                    "type": "STRING",
                    "description": "The Japanese word or phrase with the mistake, or its corrected form."
                },
                "advice": {
                    "type": "STRING",
                    "description": "Short advice in Chinese on the grammar rule, particle or pronunciation."
                },
                "correction": {
                    "type": "STRING",
                    "description": "The fully corrected Japanese sentence or phrase."
                }
            },
            "required": ["japanese", "advice"]
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: FunctionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResult {
    pub result: String,
}

impl ToolResponse {
    /// One `{result: "ok"}` per call, in call order.
    pub fn ok_for(calls: &[FunctionCall]) -> Self {
        Self {
            function_responses: calls
                .iter()
                .map(|c| FunctionResponse {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    response: FunctionResult { result: "ok".to_string() },
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Frame received from the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelEvent {
    Open,
    Message { data: ServerEvent },
    Close,
    Error {
        #[serde(default)]
        error: String,
    },
}

impl ChannelEvent {
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Event emitted by the remote model. Any combination of fields may be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerEvent {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCall>,
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub turn_complete: bool,
    pub generation_complete: bool,
    pub interrupted: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

impl InlineData {
    /// Sample rate declared in the MIME type, or the response default.
    pub fn sample_rate(&self) -> u32 {
        self.mime_type
            .as_deref()
            .and_then(rate_from_mime)
            .unwrap_or(DEFAULT_RESPONSE_RATE)
    }
}

/// Parse `rate=NNNN` out of a MIME-like descriptor such as
/// `audio/pcm;rate=24000`.
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCall {
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunctionCall {
    pub id: Option<String>,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolCallCancellation {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// Latest correction surfaced by the `report_feedback` tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackEvent {
    pub japanese: String,
    pub advice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
}

impl FeedbackEvent {
    /// Lenient decode of tool arguments; missing fields come out empty.
    pub fn from_args(args: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(args.clone())?)
    }

    pub fn is_complete(&self) -> bool {
        !self.japanese.is_empty() && !self.advice.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_frame_serialization() {
        let frame = ClientFrame::Config {
            config: SessionSetup::audio("models/test", "Kore", "be nice".to_string()),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();

        assert_eq!(json["type"], "config");
        let config = &json["config"];
        assert!(config.get("model").is_none());
        assert_eq!(config["responseModalities"][0], "AUDIO");
        assert_eq!(config["systemInstruction"], "be nice");
        assert_eq!(
            config["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert!(config["inputAudioTranscription"].is_object());
        assert!(config["outputAudioTranscription"].is_object());

        let decl = &config["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "report_feedback");
        assert_eq!(decl["parameters"]["required"], serde_json::json!(["japanese", "advice"]));
        assert!(decl["parameters"]["properties"]["correction"].is_object());
    }

    #[test]
    fn test_audio_text_and_tool_frames() {
        let frame = ClientFrame::Audio {
            media: MediaChunk::pcm16(vec![1, 2, 3], 16_000),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["media"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["media"]["data"], "AQID");

        let json = serde_json::to_value(ClientFrame::Text { text: "もう一度".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "もう一度"}));

        let calls = vec![
            FunctionCall { id: Some("a".into()), name: FEEDBACK_TOOL.into(), args: serde_json::Value::Null },
            FunctionCall { id: None, name: FEEDBACK_TOOL.into(), args: serde_json::Value::Null },
        ];
        let frame = ClientFrame::ToolResponse { response: ToolResponse::ok_for(&calls) };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "tool_response");
        let responses = json["response"]["functionResponses"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], "a");
        assert_eq!(responses[0]["response"]["result"], "ok");
        assert!(responses[1].get("id").is_none());
    }

    #[test]
    fn test_channel_event_variants() {
        assert!(matches!(ChannelEvent::from_text(r#"{"type":"open"}"#).unwrap(), ChannelEvent::Open));
        assert!(matches!(ChannelEvent::from_text(r#"{"type":"close"}"#).unwrap(), ChannelEvent::Close));
        match ChannelEvent::from_text(r#"{"type":"error","error":"quota"}"#).unwrap() {
            ChannelEvent::Error { error } => assert_eq!(error, "quota"),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(ChannelEvent::from_text(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_server_event_deserialization() {
        let text = serde_json::json!({
            "type": "message",
            "data": {
                "serverContent": {
                    "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}]},
                    "outputTranscription": {"text": "はい"},
                    "inputTranscription": {"text": "えっと"},
                    "turnComplete": true
                },
                "toolCall": {"functionCalls": [
                    {"id": "c1", "name": "report_feedback", "args": {"japanese": "はし", "advice": "...", "correction": "橋"}}
                ]}
            }
        })
        .to_string();

        let data = match ChannelEvent::from_text(&text).unwrap() {
            ChannelEvent::Message { data } => data,
            other => panic!("Unexpected event: {:?}", other),
        };
        let content = data.server_content.unwrap();
        assert!(content.turn_complete);
        assert!(!content.interrupted);
        assert_eq!(content.output_transcription.unwrap().text.as_deref(), Some("はい"));
        let parts = content.model_turn.unwrap().parts;
        assert_eq!(parts[0].inline_data.as_ref().unwrap().sample_rate(), 24_000);

        let calls = data.tool_call.unwrap().function_calls;
        let feedback = FeedbackEvent::from_args(&calls[0].args).unwrap();
        assert_eq!(
            feedback,
            FeedbackEvent {
                japanese: "はし".into(),
                advice: "...".into(),
                correction: Some("橋".into()),
            }
        );
    }

    #[test]
    fn test_empty_message_tolerated() {
        let data: ServerEvent = serde_json::from_str("{}").unwrap();
        assert!(data.server_content.is_none());
        let data: ServerEvent = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(data.setup_complete.is_some());
    }

    #[test]
    fn test_rate_from_mime() {
        assert_eq!(rate_from_mime("audio/pcm;rate=16000"), Some(16_000));
        assert_eq!(rate_from_mime("audio/pcm; rate=24000"), Some(24_000));
        assert_eq!(rate_from_mime("audio/pcm"), None);
        let inline = InlineData { mime_type: None, data: String::new() };
        assert_eq!(inline.sample_rate(), DEFAULT_RESPONSE_RATE);
    }

    #[test]
    fn test_feedback_lenient_args() {
        let feedback = FeedbackEvent::from_args(&serde_json::json!({"japanese": "です"})).unwrap();
        assert_eq!(feedback.advice, "");
        assert!(feedback.correction.is_none());
        assert!(!feedback.is_complete());
        assert!(FeedbackEvent::from_args(&serde_json::json!("text")).is_err());
    }
}
