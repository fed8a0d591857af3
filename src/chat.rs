//! Chat orchestration: the LLM tool-calling loop and per-conversation
//! streaming state.

pub mod orchestrator;
pub mod store;
pub mod stream;
pub mod tools;

pub use orchestrator::{ChatOrchestrator, QueryExecutor, TurnAdmission, TurnRequest};
pub use store::MessageStore;
pub use stream::StreamState;
