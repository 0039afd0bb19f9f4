//! Translation between the Anthropic Messages API wire shape and the
//! gateway's native [`Request`]/[`Outcome`] types.
//!
//! Grounded on `omni-agent`'s `gateway::http` module: a pure request/response
//! struct pair plus a synchronous validate-and-translate function kept
//! separate from the handler, so the translation itself stays unit-testable
//! without a router. Unlike `omni-agent`'s `MessageRequest` (one flat
//! `message: String` field), the Messages API nests user content as either a
//! bare string or an array of typed content blocks — spec.md §4's vendor
//! module is responsible for flattening that into the single `prompt` string
//! the scheduler expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Outcome, Priority, Request};

/// `POST /v1/messages` request body, modeled after the Anthropic Messages
/// API. Only the fields the gateway can act on are represented; anything
/// else in the body is ignored rather than rejected.
#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<SystemField>,
    pub messages: Vec<VendorMessage>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// `system` may be a plain string or an array of text blocks, same
/// tolerance as `content` below.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SystemField {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
pub struct VendorMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Translate a vendor-shaped request into the gateway's native [`Request`].
///
/// The prompt is taken from the last `role: "user"` message (vendor clients
/// always send the running transcript; only the newest turn matters to a
/// single-shot gateway). Earlier turns are dropped — this gateway has no
/// notion of a multi-turn conversation, matching spec.md's Non-goals.
pub fn translate_request(body: MessagesRequest) -> Result<Request, String> {
    let prompt = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| flatten_content(&m.content))
        .ok_or_else(|| "messages must contain at least one user turn".to_string())?;

    if prompt.trim().is_empty() {
        return Err("user message must be non-empty".to_string());
    }

    let system_prompt = body.system.map(|s| match s {
        SystemField::Text(t) => t,
        SystemField::Blocks(blocks) => flatten_blocks(&blocks),
    });

    Ok(Request {
        prompt,
        model: body.model,
        system_prompt,
        max_turns: None,
        timeout_ms: None,
        priority: Priority::Normal,
    })
}

fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => flatten_blocks(blocks),
    }
}

fn flatten_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter(|b| b.block_type == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `POST /v1/messages` success body, modeled after the Anthropic Messages
/// API response shape.
#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub role: &'static str,
    pub model: Option<String>,
    pub content: Vec<ResponseBlock>,
    pub stop_reason: &'static str,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ResponseBlock {
    #[serde(rename = "type")]
    pub block_type: &'static str,
    pub text: String,
}

#[derive(Debug, Serialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Vendor-shaped error body.
#[derive(Debug, Serialize)]
pub struct MessagesError {
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub error: VendorErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct VendorErrorDetail {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: String,
}

/// Translate a resolved [`Outcome`] into the vendor success/error shape.
pub fn translate_outcome(outcome: Outcome) -> Result<MessagesResponse, MessagesError> {
    if let Some(message) = outcome.body.error {
        return Err(MessagesError {
            response_type: "error",
            error: VendorErrorDetail {
                error_type: vendor_error_type(outcome.status),
                message,
            },
        });
    }

    Ok(MessagesResponse {
        response_type: "message",
        role: "assistant",
        model: outcome.body.model,
        content: vec![ResponseBlock {
            block_type: "text",
            text: outcome.body.text,
        }],
        stop_reason: "end_turn",
        usage: Usage {
            input_tokens: outcome.body.input_tokens.unwrap_or(0),
            output_tokens: outcome.body.output_tokens.unwrap_or(0),
        },
    })
}

/// Map a gateway HTTP status to the Messages API's error-type vocabulary
/// (spec.md §7's status table, re-expressed in vendor terms).
fn vendor_error_type(status: u16) -> &'static str {
    match status {
        408 | 504 => "timeout_error",
        422 => "invalid_request_error",
        503 => "overloaded_error",
        502 => "api_error",
        _ => "api_error",
    }
}
