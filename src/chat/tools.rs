//! Tool surface advertised to the model, and dispatch of its invocations.
//!
//! Tool calls decode into one [`ToolInvocation`] variant each; the
//! orchestrator matches on the variant rather than branching on name strings
//! at call sites. `run_sql` is the only tool with server-side work;
//! `create_chart` is a passthrough whose payload goes straight to the client.

use crate::llm::ToolDefinition;
use schemars::JsonSchema;
use serde::Deserialize;

pub const RUN_SQL: &str = "run_sql";
pub const CREATE_CHART: &str = "create_chart";

/// Default page size for tool-initiated queries. Pagination is mandatory on
/// every execution, so the tool schema defaults it rather than allowing an
/// unbounded fetch.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Arguments for the `run_sql` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunSqlArgs {
    /// The SQL query to execute against the conversation's datasets.
    pub query: String,
    /// Zero-based result page.
    #[serde(default)]
    pub page: u32,
    /// Rows per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Arguments for the `create_chart` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateChartArgs {
    /// Index of the SQL execution this chart visualizes.
    pub execution_index: usize,
    /// Chart type (bar, line, pie, scatter, ...).
    pub chart_type: String,
    pub title: Option<String>,
    /// Axis/series mapping and rendering options, relayed untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A decoded tool invocation.
#[derive(Debug, Clone)]
pub enum ToolInvocation {
    RunSql(RunSqlArgs),
    CreateChart(CreateChartArgs),
}

impl ToolInvocation {
    /// Decode a model tool call. The error string goes back to the model as
    /// the tool result so it can correct itself.
    pub fn parse(name: &str, arguments: &serde_json::Value) -> Result<Self, String> {
        match name {
            RUN_SQL => serde_json::from_value(arguments.clone())
                .map(ToolInvocation::RunSql)
                .map_err(|err| format!("invalid {RUN_SQL} arguments: {err}")),
            CREATE_CHART => serde_json::from_value(arguments.clone())
                .map(ToolInvocation::CreateChart)
                .map_err(|err| format!("invalid {CREATE_CHART} arguments: {err}")),
            other => Err(format!("unknown tool '{other}'")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolInvocation::RunSql(_) => RUN_SQL,
            ToolInvocation::CreateChart(_) => CREATE_CHART,
        }
    }
}

/// The tool definitions sent with every completion request.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: RUN_SQL.into(),
            description: "Execute a read-only SQL query against the conversation's datasets. \
                          Results are paginated; request further pages as needed."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The SQL query to execute"
                    },
                    "page": {
                        "type": "integer",
                        "minimum": 0,
                        "default": 0,
                        "description": "Zero-based result page"
                    },
                    "page_size": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 1000,
                        "default": DEFAULT_PAGE_SIZE,
                        "description": "Rows per page"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: CREATE_CHART.into(),
            description: "Attach a chart to a prior SQL execution. The chart is rendered \
                          client-side from the execution's result rows; no data is re-queried."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "execution_index": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Index of the SQL execution to visualize"
                    },
                    "chart_type": {
                        "type": "string",
                        "enum": ["bar", "line", "pie", "scatter", "area"],
                        "description": "Chart type"
                    },
                    "title": {
                        "type": "string",
                        "description": "Chart title"
                    },
                    "config": {
                        "type": "object",
                        "description": "Axis and series mapping, passed through to the client"
                    }
                },
                "required": ["execution_index", "chart_type"]
            }),
        },
    ]
}
