pub mod react;
pub mod tools;

pub use react::{AgentEvent, AgentOutcome, ReactAgent, ToolTrace};
pub use tools::{Tool, ToolContext, ToolRegistry, ToolResult, data_query_tools};
