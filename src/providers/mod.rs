mod base;
mod openai;

pub use base::{
    ChatMessage, ChatModel, ChatRequest, ModelResponse, ParsedCall, StreamDelta, ToolCall,
    ToolSpec,
};
pub use openai::OpenAiCompatModel;

#[cfg(test)]
pub use base::ScriptedModel;
