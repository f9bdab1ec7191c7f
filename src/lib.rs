//! Hive - Rust 智能体编排运行时
//!
//! 模块划分：
//! - **checkpoint**: 按 run-id 的版本化快照（内存 / 文件 / SQLite）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行状态、预算、错误分类与恢复、优雅关闭
//! - **delegation**: 子智能体定义与隔离的子运行
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）、重试
//! - **memory**: 对话状态与上下文压缩
//! - **observability**: tracing 日志初始化
//! - **queue**: 任务队列（原子认领）与 worker 池
//! - **react**: 推理-行动主循环
//! - **runtime**: 组装好的运行时门面
//! - **safety**: 风险分级、确认与输入净化
//! - **tools**: 工具注册表、参数校验、执行器与内置运维工具
//! - **workflow**: 依赖图计划执行与 Saga 补偿

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod core;
pub mod delegation;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod queue;
pub mod react;
pub mod runtime;
pub mod safety;
pub mod tools;
pub mod workflow;

pub use crate::core::{AgentError, Budgets, RunResult, RunStatus};
pub use runtime::{Runtime, RuntimeBuilder};
