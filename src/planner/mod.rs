//! The AI planner: an independent worker that inspects recent executions
//! and writes time-bounded schedule hints through an endpoint-scoped tool
//! surface.

pub mod llm;
pub mod prompt;
pub mod tools;
pub mod worker;

pub use llm::{ChatClient, ChatMessage, ChatRequest, LlmConfig, MockChatClient, OpenAiChatClient};
pub use tools::{SubmitAnalysis, ToolOutcome, ToolRegistry};
pub use worker::{analysis_is_due, PlannerSettings, PlannerWorker};
