//! 模型层：客户端抽象、重试装饰器、文本协议与实现（OpenAI 兼容 / Scripted / Mock）

pub mod mock;
pub mod openai;
pub mod protocol;
pub mod retry;
pub mod traits;

pub use mock::{MockModel, RecordedRequest, ScriptedModel};
pub use openai::OpenAiModel;
pub use protocol::{parse_model_output, render_catalogue};
pub use retry::{RetryConfig, RetryingModel};
pub use traits::{LlmError, ModelClient, ModelReply, ModelRequest, ReplyContent};
