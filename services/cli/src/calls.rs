//! Call creation over the Ultravox REST API.
//!
//! A call must exist before a realtime session can join it. [`UltravoxClient`]
//! creates one configured for a server WebSocket medium with text output and
//! returns the join URL the session connects to.

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use ultravox_realtime::ToolDescriptor;

use crate::config::Config;

pub const DEFAULT_BASE_URL: &str = "https://api.ultravox.ai/api";

const API_KEY_HEADER: &str = "X-API-Key";
const TEXT_OUTPUT_MEDIUM: &str = "MESSAGE_MEDIUM_TEXT";
const SAMPLE_RATE_HZ: u32 = 48_000;
const CLIENT_BUFFER_SIZE_MS: u32 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Ultravox API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Invalid response from API: {0}")]
    InvalidResponse(String),
}

/// The body of `POST /calls`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub system_prompt: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selected_tools: Vec<SelectedTool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub initial_messages: Vec<Value>,
    pub initial_output_medium: String,
    pub medium: CallMedium,
}

impl CreateCallRequest {
    pub fn new(system_prompt: impl Into<String>, temperature: f64) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            temperature,
            voice: None,
            selected_tools: Vec::new(),
            initial_messages: Vec::new(),
            initial_output_medium: TEXT_OUTPUT_MEDIUM.to_string(),
            medium: CallMedium::default(),
        }
    }

    /// Builds the request for the configured call, offering `tools` to the agent.
    pub fn from_config(config: &Config, tools: &[ToolDescriptor]) -> Self {
        Self {
            voice: config.voice.clone(),
            selected_tools: tools.iter().map(SelectedTool::client).collect(),
            initial_messages: config.initial_messages.clone(),
            ..Self::new(config.system_prompt.clone(), config.temperature)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMedium {
    pub server_web_socket: ServerWebSocketMedium,
}

impl Default for CallMedium {
    fn default() -> Self {
        Self {
            server_web_socket: ServerWebSocketMedium {
                input_sample_rate: SAMPLE_RATE_HZ,
                output_sample_rate: SAMPLE_RATE_HZ,
                client_buffer_size_ms: CLIENT_BUFFER_SIZE_MS,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerWebSocketMedium {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub client_buffer_size_ms: u32,
}

/// A tool offered to the agent for the duration of one call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedTool {
    pub temporary_tool: TemporaryTool,
}

impl SelectedTool {
    /// A tool implemented by this client and invoked over the realtime connection.
    pub fn client(tool: &ToolDescriptor) -> Self {
        Self {
            temporary_tool: TemporaryTool {
                model_tool_name: tool.name.clone(),
                description: tool.description.clone(),
                client: ClientImplementation {},
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryTool {
    pub model_tool_name: String,
    pub description: String,
    pub client: ClientImplementation,
}

/// Marks a tool as client-implemented. Serializes as `{}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientImplementation {}

/// The part of the created call this client needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedCall {
    pub join_url: String,
    #[serde(default)]
    pub call_id: Option<String>,
}

impl CreatedCall {
    fn from_response(body: Value) -> Result<Self, CallError> {
        if body.get("joinUrl").and_then(Value::as_str).is_none() {
            return Err(CallError::InvalidResponse("missing joinUrl".to_string()));
        }
        serde_json::from_value(body).map_err(|e| CallError::InvalidResponse(e.to_string()))
    }
}

/// Client for the Ultravox REST API.
pub struct UltravoxClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
}

impl UltravoxClient {
    pub fn new(api_key: SecretString, base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Creates a call and returns its join URL.
    pub async fn create_call(&self, request: &CreateCallRequest) -> Result<CreatedCall, CallError> {
        let url = self.endpoint("calls");
        debug!(%url, "Creating call");

        let request_error = |source| CallError::Request {
            url: url.clone(),
            source,
        };
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Status { status, body });
        }

        let body: Value = response.json().await.map_err(request_error)?;
        let call = CreatedCall::from_response(body)?;
        info!(call_id = ?call.call_id, "Call created");
        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    /// Answers one HTTP request with `status` and `body`, handing the raw request back.
    async fn respond_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });
        (format!("http://{}/api", addr), rx)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        body.len() >= content_length
    }

    fn client(base_url: &str) -> UltravoxClient {
        UltravoxClient::new(SecretString::from("test-key"), base_url)
    }

    #[test]
    fn test_request_body_defaults() {
        let body = serde_json::to_value(CreateCallRequest::new("Be helpful.", 0.8)).unwrap();
        assert_eq!(
            body,
            json!({
                "systemPrompt": "Be helpful.",
                "temperature": 0.8,
                "initialOutputMedium": "MESSAGE_MEDIUM_TEXT",
                "medium": {
                    "serverWebSocket": {
                        "inputSampleRate": 48000,
                        "outputSampleRate": 48000,
                        "clientBufferSizeMs": 30000
                    }
                }
            })
        );
    }

    #[test]
    fn test_request_body_with_tools_voice_and_messages() {
        let tool = ToolDescriptor {
            name: "getSecretMenu".to_string(),
            description: "Looks up today's secret menu items.".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        };
        let request = CreateCallRequest {
            voice: Some("Mark".to_string()),
            selected_tools: vec![SelectedTool::client(&tool)],
            initial_messages: vec![json!({"role": "MESSAGE_ROLE_USER", "text": "Hi"})],
            ..CreateCallRequest::new("Be helpful.", 0.5)
        };

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["voice"], "Mark");
        assert_eq!(
            body["selectedTools"],
            json!([{
                "temporaryTool": {
                    "modelToolName": "getSecretMenu",
                    "description": "Looks up today's secret menu items.",
                    "client": {}
                }
            }])
        );
        assert_eq!(body["initialMessages"][0]["text"], "Hi");
    }

    #[test]
    fn test_created_call_requires_join_url() {
        let call = CreatedCall::from_response(json!({
            "callId": "abc",
            "joinUrl": "wss://voice.ultravox.ai/calls/abc"
        }))
        .unwrap();
        assert_eq!(call.join_url, "wss://voice.ultravox.ai/calls/abc");
        assert_eq!(call.call_id.as_deref(), Some("abc"));

        let err = CreatedCall::from_response(json!({"callId": "abc"})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid response from API: missing joinUrl");
    }

    #[test]
    fn test_endpoint_joins_paths() {
        assert_eq!(
            client("https://api.ultravox.ai/api/").endpoint("/calls"),
            "https://api.ultravox.ai/api/calls"
        );
        assert_eq!(client(DEFAULT_BASE_URL).base_url(), DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn test_create_call_posts_body_with_api_key() {
        let (base_url, request) = respond_once(
            "201 Created",
            r#"{"callId":"abc","joinUrl":"wss://voice.example.com/calls/abc"}"#,
        )
        .await;

        let call = client(&base_url)
            .create_call(&CreateCallRequest::new("Be helpful.", 0.8))
            .await
            .unwrap();
        assert_eq!(call.join_url, "wss://voice.example.com/calls/abc");

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /api/calls HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("x-api-key: test-key"));
        assert!(request.contains(r#""systemPrompt":"Be helpful.""#));
    }

    #[tokio::test]
    async fn test_create_call_rejects_error_status() {
        let (base_url, _request) =
            respond_once("401 Unauthorized", r#"{"detail":"Invalid API key"}"#).await;

        let err = client(&base_url)
            .create_call(&CreateCallRequest::new("Be helpful.", 0.8))
            .await
            .unwrap_err();
        match err {
            CallError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert!(body.contains("Invalid API key"));
            }
            other => panic!("Expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_call_rejects_missing_join_url() {
        let (base_url, _request) = respond_once("200 OK", r#"{"callId":"abc"}"#).await;

        let err = client(&base_url)
            .create_call(&CreateCallRequest::new("Be helpful.", 0.8))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidResponse(_)));
    }
}
