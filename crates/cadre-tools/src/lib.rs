use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use cadre_types::CompletionReport;

/// Schema of one named capability exposed to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema-shaped description of the arguments object.
    pub parameters: Value,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

/// A named capability an agent backend may invoke.
///
/// The coordinator never inspects tool control flow; only the observable
/// outcome (a recorded report, an error event) crosses back.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, args: Value) -> anyhow::Result<ToolResult>;
}

/// Registry of tools, shared with provider backends.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> =
            self.tools.read().await.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Invoke by name. Unknown tools produce an error result, not a panic;
    /// the caller decides whether that aborts its turn.
    pub async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            tracing::warn!("unknown tool invoked: {}", name);
            return Ok(ToolResult {
                output: format!("Unknown tool: {name}"),
                metadata: json!({ "error": "unknown_tool" }),
            });
        };
        tool.invoke(args).await
    }
}

type ReportSink = Arc<dyn Fn(CompletionReport) + Send + Sync>;

/// The structured path for worker results: a worker that supports tool
/// calling reports completion here instead of relying on text parsing.
pub struct CompletionReportTool {
    sink: ReportSink,
}

impl CompletionReportTool {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(CompletionReport) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }
}

#[async_trait]
impl Tool for CompletionReportTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "report_completion".to_string(),
            description: "Submit the structured completion report for the current task"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "task_id": { "type": "string" },
                    "summary": { "type": "string" },
                    "files_modified": { "type": "array", "items": { "type": "string" } },
                    "success": { "type": "boolean" }
                },
                "required": ["agent_id", "task_id", "summary", "success"]
            }),
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolResult> {
        let report: CompletionReport = serde_json::from_value(args)?;
        let task_id = report.task_id.clone();
        (self.sink)(report);
        Ok(ToolResult {
            output: format!("completion report recorded for task {task_id}"),
            metadata: json!({ "task_id": task_id }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn registry_invokes_registered_tool() {
        let recorded: Arc<Mutex<Vec<CompletionReport>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();

        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(CompletionReportTool::new(move |report| {
                sink.lock().unwrap().push(report);
            })))
            .await;

        let result = registry
            .invoke(
                "report_completion",
                json!({
                    "agent_id": "a1",
                    "task_id": "t1",
                    "summary": "implemented the thing",
                    "files_modified": ["src/lib.rs"],
                    "success": true
                }),
            )
            .await
            .unwrap();

        assert!(result.output.contains("t1"));
        let reports = recorded.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result_not_a_panic() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("does_not_exist", json!({})).await.unwrap();
        assert!(result.output.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn malformed_report_arguments_fail_invocation() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(CompletionReportTool::new(|_| {})))
            .await;

        let result = registry
            .invoke("report_completion", json!({ "summary": "missing ids" }))
            .await;
        assert!(result.is_err());
    }
}
