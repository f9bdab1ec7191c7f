//! 工作流：依赖计划执行与 Saga 补偿

pub mod builder;
pub mod engine;
pub mod graph;
pub mod saga;
pub mod types;

pub use builder::PlanBuilder;
pub use engine::{JsonPlanStore, PlanExecutor, PlanStore, StepExecutor};
pub use graph::PlanGraph;
pub use saga::{CompensationFailure, Saga, SagaOutcome, SagaStep};
pub use types::*;
