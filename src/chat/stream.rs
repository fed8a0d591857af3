//! Per-conversation streaming state for one assistant turn.
//!
//! One `StreamState` exists per actively streaming conversation, owned by the
//! orchestrator and created when the first event of a new turn arrives. It is
//! cleared on completion, error, or channel close, with partial content
//! flushed first so no turn is ever left silently incomplete.

use crate::events::{ChartSpecPayload, SqlExecution};
use crate::{ConversationId, MessageId};
use std::collections::HashMap;

/// Accumulated state of one streaming turn.
#[derive(Debug)]
pub struct StreamState {
    pub conversation_id: ConversationId,
    /// Message id the stream finalizes into.
    pub streaming_message_id: MessageId,
    /// Visible answer tokens in arrival order.
    pub accumulated_tokens: String,
    /// Whether the model is currently in its reasoning phase.
    pub is_reasoning: bool,
    /// Reasoning tokens, kept separate from the answer.
    pub accumulated_reasoning: String,
    /// Name of the tool currently executing, if any.
    pub pending_tool_call: Option<String>,
    /// Chart specs that arrived before their execution records resolved,
    /// keyed by execution index. Consumed exactly once at finalization.
    pub pending_chart_specs: HashMap<usize, ChartSpecPayload>,
    /// Resolved SQL executions, in execution order.
    pub executions: Vec<SqlExecution>,
}

impl StreamState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            streaming_message_id: uuid::Uuid::new_v4(),
            accumulated_tokens: String::new(),
            is_reasoning: false,
            accumulated_reasoning: String::new(),
            pending_tool_call: None,
            pending_chart_specs: HashMap::new(),
            executions: Vec::new(),
        }
    }

    /// Index the next SQL execution will occupy.
    pub fn next_execution_index(&self) -> usize {
        self.executions.len()
    }
}

/// Splice pending chart specs into their target executions.
///
/// Pure merge step: each spec lands on the execution at its index; specs with
/// no matching execution are dropped. Each pending entry is consumed exactly
/// once; the map is taken by value.
pub fn merge_chart_specs(
    mut executions: Vec<SqlExecution>,
    pending: HashMap<usize, ChartSpecPayload>,
) -> Vec<SqlExecution> {
    let execution_count = executions.len();
    for (index, spec) in pending {
        match executions.get_mut(index) {
            Some(execution) => execution.chart_spec = Some(spec),
            None => {
                tracing::debug!(
                    index,
                    execution_count,
                    "dropping chart spec with no matching execution"
                );
            }
        }
    }
    executions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::protocol::ExecutionResult;

    fn execution(index: usize) -> SqlExecution {
        SqlExecution {
            index,
            query_text: format!("SELECT {index}"),
            result: ExecutionResult::default(),
            chart_spec: None,
        }
    }

    fn spec(chart_type: &str) -> ChartSpecPayload {
        ChartSpecPayload {
            chart_type: chart_type.into(),
            title: None,
            config: serde_json::Value::Null,
        }
    }

    #[test]
    fn in_range_spec_is_spliced_into_its_execution() {
        let executions = vec![execution(0), execution(1)];
        let pending = HashMap::from([(1, spec("bar"))]);

        let merged = merge_chart_specs(executions, pending);
        assert!(merged[0].chart_spec.is_none());
        assert_eq!(merged[1].chart_spec.as_ref().unwrap().chart_type, "bar");
    }

    #[test]
    fn out_of_range_spec_is_silently_dropped() {
        let executions = vec![execution(0), execution(1)];
        let pending = HashMap::from([(5, spec("line"))]);

        let merged = merge_chart_specs(executions, pending);
        assert!(merged.iter().all(|e| e.chart_spec.is_none()));
    }

    #[test]
    fn merge_with_no_pending_is_identity() {
        let executions = vec![execution(0)];
        let merged = merge_chart_specs(executions.clone(), HashMap::new());
        assert_eq!(merged, executions);
    }

    #[test]
    fn each_spec_lands_exactly_once() {
        let executions = vec![execution(0), execution(1), execution(2)];
        let pending = HashMap::from([(0, spec("pie")), (2, spec("scatter"))]);

        let merged = merge_chart_specs(executions, pending);
        let placed: Vec<_> = merged
            .iter()
            .filter_map(|e| e.chart_spec.as_ref().map(|s| s.chart_type.as_str()))
            .collect();
        assert_eq!(placed, vec!["pie", "scatter"]);
        assert!(merged[1].chart_spec.is_none());
    }

    #[test]
    fn new_state_starts_clean() {
        let state = StreamState::new("conv-1".into());
        assert!(state.accumulated_tokens.is_empty());
        assert!(!state.is_reasoning);
        assert!(state.pending_chart_specs.is_empty());
        assert_eq!(state.next_execution_index(), 0);
    }
}
