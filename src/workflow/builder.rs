//! 计划构建器
//!
//! 提供流畅的API来构建计划

use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 计划构建器
pub struct PlanBuilder {
    id: PlanId,
    task: String,
    steps: Vec<PlanStep>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4().simple()),
            task: task.into(),
            steps: Vec::new(),
        }
    }

    /// 指定计划 ID（用于持久化后按 ID 恢复）
    pub fn id(mut self, id: impl Into<PlanId>) -> Self {
        self.id = id.into();
        self
    }

    /// 添加无依赖的步骤
    pub fn step(mut self, id: impl Into<StepId>, description: impl Into<String>) -> Self {
        self.steps.push(PlanStep::new(id, description));
        self
    }

    /// 添加依赖若干前置步骤的步骤
    pub fn step_after(
        mut self,
        id: impl Into<StepId>,
        description: impl Into<String>,
        deps: &[&str],
    ) -> Self {
        let mut step = PlanStep::new(id, description);
        step.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self.steps.push(step);
        self
    }

    /// 设置顺序依赖
    pub fn sequential(mut self, from: impl Into<StepId>, to: &str) -> Self {
        let from = from.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == to) {
            if !step.dependencies.contains(&from) {
                step.dependencies.push(from);
            }
        }
        self
    }

    /// 构建计划：拒绝空计划、重复 ID、未知依赖与环
    pub fn build(self) -> Result<Plan, WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(
                "plan has no steps".to_string(),
            ));
        }
        let now = chrono::Utc::now().timestamp_millis();
        let plan = Plan {
            id: self.id,
            task: self.task,
            steps: self.steps,
            created_at: now,
            updated_at: now,
        };
        PlanGraph::new(&plan)?.topological_order()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("restore service")
            .id("p1")
            .step("check", "check disk")
            .step("clean", "clean logs")
            .sequential("check", "clean")
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.id, "p1");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.step("clean").unwrap().dependencies, vec!["check"]);
    }

    #[test]
    fn test_build_rejects_bad_plans() {
        assert!(PlanBuilder::new("empty").build().is_err());
        let cyclic = PlanBuilder::new("loop")
            .step_after("a", "A", &["b"])
            .step_after("b", "B", &["a"])
            .build();
        assert!(matches!(cyclic, Err(WorkflowError::CyclicDependency)));
        let dup = PlanBuilder::new("dup").step("a", "A").step("a", "A2").build();
        assert!(matches!(dup, Err(WorkflowError::DuplicateStep(_))));
    }
}
