use serde::{Deserialize, Serialize};

/// Status of a tool call observed on a session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Why a prompt turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfTurn,
    Cancelled,
    Error,
    Timeout,
}

/// One entry of a plan update streamed by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    #[serde(default)]
    pub completed: bool,
}

/// Typed event on a session's render stream.
///
/// Per session, emission order is preserved and `PromptComplete` is
/// delivered at most once per prompt, after every chunk and tool event of
/// that turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderEvent {
    MessageStart,
    MessageChunk { text: String },
    MessageEnd { full: String },
    ThinkingStart,
    ThinkingChunk { text: String },
    ThinkingEnd,
    ToolCallStart {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    ToolCallParameterUpdate { id: String, partial: String },
    ToolCallUpdate { id: String, status: ToolCallStatus },
    ToolCallEnd {
        id: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    PlanUpdate { entries: Vec<PlanEntry> },
    Info { message: String },
    Error { message: String },
    PromptComplete { stop_reason: StopReason },
    Connected,
    Disconnected,
}

/// A unit of streamed provider output.
///
/// Providers without native streaming still deliver exactly one `Completed`
/// chunk carrying the full response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Delta(String),
    Completed(String),
}

impl StreamChunk {
    pub fn text(&self) -> &str {
        match self {
            StreamChunk::Delta(text) | StreamChunk::Completed(text) => text,
        }
    }
}
