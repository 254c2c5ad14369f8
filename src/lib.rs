mod error;

pub mod gateway;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{Result, VuzoError};
pub use providers::{
    ADAPTER_ORDER, AdapterRegistry, Anthropic, Completion, Credential, FrameStream, Google,
    OpenAiCompatible, ProviderAdapter, ProviderEndpoints, ProviderKind, StreamFrame,
};
pub use types::{
    ChatCompletionRequest, ChatMessage, MessageContent, Role, StopSequences, UsageResult,
};
pub use utils::env::{Env, parse_dotenv};
