pub mod adapter;
pub mod cli_json;
pub mod http;
pub mod sdk_stream;
pub mod stream;

pub use adapter::{
    AgentAdapter, AgentError, AgentInput, AgentReply, InputPart, SendOptions, TurnEmitter,
};
pub use cli_json::{CliJsonAdapter, CliJsonConfig};
pub use http::{GeminiConfig, GeminiHttpAdapter};
pub use sdk_stream::{ClaudeConfig, ClaudeSdkAdapter};
pub use stream::StreamParser;
