//! Core data model shared by the scheduler, executor, and parser.
//!
//! These types cross every module boundary in the gateway, so they live in
//! one place rather than being scattered per-module as the teacher does with
//! its smaller, more local structs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-facing input to the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Non-empty prompt text.
    pub prompt: String,
    /// Short model tag (`opus`/`sonnet`/`haiku`), or empty for CLI default.
    #[serde(default)]
    pub model: Option<String>,
    /// Optional system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Maximum agentic turns. Falls back to `defaultMaxTurns` when absent.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Per-request execution deadline in milliseconds. Falls back to
    /// `defaultTimeoutMs` when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Admission priority. Defaults to `Normal`.
    #[serde(default)]
    pub priority: Priority,
}

/// Queue priority. Numeric rank is `1/2/3`, lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// Numeric rank used for queue ordering — lower sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Raw result of one child-process invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Meaningless when `killed` is true.
    pub exit_code: i32,
    pub killed: bool,
}

/// Normalised output of the parser, derived from `ExecutionResult::stdout`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub text: String,
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub max_turns_exhausted: bool,
}

/// Response returned to the caller.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Response {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(parsed: ParsedOutput) -> Self {
        Self {
            text: parsed.text,
            model: parsed.model,
            input_tokens: parsed.input_tokens,
            output_tokens: parsed.output_tokens,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            model: None,
            input_tokens: None,
            output_tokens: None,
            error: Some(message.into()),
        }
    }
}

/// Error kinds the scheduler can resolve a request with. Each maps to a
/// recommended HTTP status the boundary applies (spec.md §7).
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// `{n}/{max}` requests already queued.
    QueueFull { depth: usize, max: usize },
    /// Waited longer than `queueTimeoutMs` without being dispatched.
    QueueTimeout { waited_ms: u64 },
    /// The child process was killed after exceeding its deadline.
    ExecutionTimeout { timeout_ms: u64 },
    /// The child exited non-zero.
    ProcessFailure { detail: String },
    /// The downstream CLI reported it exhausted its turn budget.
    MaxTurnsExhausted { max_turns: u32 },
    /// Anything else: spawn failure, panics caught at the dispatch site, etc.
    Internal { detail: String },
}

impl GatewayError {
    /// Recommended HTTP status for the boundary (spec.md §7).
    pub fn status_code(&self) -> u16 {
        match self {
            Self::QueueFull { .. } => 503,
            Self::QueueTimeout { .. } => 408,
            Self::ExecutionTimeout { .. } => 504,
            Self::ProcessFailure { .. } => 502,
            Self::MaxTurnsExhausted { .. } => 422,
            Self::Internal { .. } => 500,
        }
    }

    /// Stable machine-readable identifier for the kind, used in responses
    /// and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue-full",
            Self::QueueTimeout { .. } => "queue-timeout",
            Self::ExecutionTimeout { .. } => "execution-timeout",
            Self::ProcessFailure { .. } => "process-failure",
            Self::MaxTurnsExhausted { .. } => "max-turns-exhausted",
            Self::Internal { .. } => "internal-error",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { depth, max } => write!(f, "Queue full ({depth}/{max})"),
            Self::QueueTimeout { waited_ms } => {
                write!(f, "Queued for too long (>{waited_ms}ms)")
            }
            Self::ExecutionTimeout { timeout_ms } => {
                write!(f, "Request timed out after {}s", timeout_ms / 1000)
            }
            Self::ProcessFailure { detail } => write!(f, "{detail}"),
            Self::MaxTurnsExhausted { max_turns } => write!(
                f,
                "Reached max turns ({max_turns}). Increase maxTurns for complex requests."
            ),
            Self::Internal { detail } => write!(f, "{detail}"),
        }
    }
}

/// Outcome of a fully-resolved request — carries both the error-kind
/// metadata and the response body together, which is what the scheduler's
/// resolver actually delivers.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: u16,
    pub body: Response,
}

impl Outcome {
    pub fn ok(response: Response) -> Self {
        Self {
            status: 200,
            body: response,
        }
    }

    pub fn err(error: GatewayError) -> Self {
        Self {
            status: error.status_code(),
            body: Response::error(error.to_string()),
        }
    }
}
