//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::types::*;

/// 计划依赖图
pub struct PlanGraph {
    /// 步骤声明顺序
    order: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl PlanGraph {
    /// 创建依赖图；依赖未知步骤时报错
    pub fn new(plan: &Plan) -> Result<Self, WorkflowError> {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        let mut order = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            if in_degree.insert(step.id.clone(), 0).is_some() {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
            adjacency.insert(step.id.clone(), Vec::new());
            order.push(step.id.clone());
        }

        for step in &plan.steps {
            for dep in &step.dependencies {
                let Some(dependents) = adjacency.get_mut(dep) else {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents.push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self {
            order,
            adjacency,
            in_degree,
        })
    }

    /// Kahn 拓扑排序；存在环时报错
    pub fn topological_order(&self) -> Result<Vec<StepId>, WorkflowError> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() != self.order.len() {
            return Err(WorkflowError::CyclicDependency);
        }
        Ok(sorted)
    }

    /// 可执行的步骤：仍为 pending 且所有依赖已完成（按声明顺序）
    pub fn ready_steps(&self, plan: &Plan) -> Vec<StepId> {
        plan.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| {
                s.dependencies
                    .iter()
                    .all(|d| plan.step(d).is_some_and(|dep| dep.status == StepStatus::Completed))
            })
            .map(|s| s.id.clone())
            .collect()
    }

    /// 直接或间接依赖某步骤的全部步骤
    pub fn dependents_of(&self, id: &str) -> Vec<StepId> {
        let mut seen: HashSet<StepId> = HashSet::new();
        let mut stack: Vec<&StepId> = self.adjacency.get(id).into_iter().flatten().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.adjacency.get(next).into_iter().flatten());
            }
        }
        self.order.iter().filter(|s| seen.contains(*s)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(steps: Vec<(&str, &[&str])>) -> Plan {
        Plan {
            id: "p".into(),
            task: "t".into(),
            steps: steps
                .into_iter()
                .map(|(id, deps)| {
                    let mut s = PlanStep::new(id, format!("step {id}"));
                    s.dependencies = deps.iter().map(|d| d.to_string()).collect();
                    s
                })
                .collect(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_graph_construction_sequential() {
        let p = plan(vec![("a", &[]), ("b", &["a"])]);
        let graph = PlanGraph::new(&p).unwrap();
        assert_eq!(graph.in_degree.get("a"), Some(&0));
        assert_eq!(graph.in_degree.get("b"), Some(&1));
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_ready_steps_follow_completed_dependencies() {
        let mut p = plan(vec![("a", &[]), ("b", &[]), ("c", &["a", "b"])]);
        let graph = PlanGraph::new(&p).unwrap();
        assert_eq!(graph.ready_steps(&p), vec!["a", "b"]);
        p.steps[0].status = StepStatus::Completed;
        assert_eq!(graph.ready_steps(&p), vec!["b"]);
        p.steps[1].status = StepStatus::Completed;
        assert_eq!(graph.ready_steps(&p), vec!["c"]);
    }

    #[test]
    fn test_cycle_and_unknown_dependency() {
        let p = plan(vec![("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        assert!(matches!(
            PlanGraph::new(&p).unwrap().topological_order(),
            Err(WorkflowError::CyclicDependency)
        ));
        let p = plan(vec![("a", &["ghost"])]);
        assert!(matches!(
            PlanGraph::new(&p),
            Err(WorkflowError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let p = plan(vec![("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let graph = PlanGraph::new(&p).unwrap();
        assert_eq!(graph.dependents_of("a"), vec!["b", "c"]);
        assert!(graph.dependents_of("d").is_empty());
    }
}
