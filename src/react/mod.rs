//! 推理-行动循环：Loop Controller 与过程事件

pub mod events;
pub mod loop_;

pub use events::LoopEvent;
pub use loop_::{CheckpointPolicy, LoopConfig, LoopController, DEFAULT_INSTRUCTION};
