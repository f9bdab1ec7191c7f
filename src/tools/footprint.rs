//! 资源足迹（read-set / write-set）与批次分波
//!
//! 两个动作相互依赖当且仅当一方写入的资源被另一方读或写。分波时依赖动作保持请求顺序，
//! 独立动作落在同一波内并发执行。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFootprint {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

impl ResourceFootprint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read(mut self, resource: impl Into<String>) -> Self {
        self.reads.insert(resource.into());
        self
    }

    pub fn write(mut self, resource: impl Into<String>) -> Self {
        self.writes.insert(resource.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    pub fn conflicts_with(&self, other: &ResourceFootprint) -> bool {
        let touches = |writes: &BTreeSet<String>, fp: &ResourceFootprint| {
            writes
                .iter()
                .any(|r| fp.reads.contains(r) || fp.writes.contains(r))
        };
        touches(&self.writes, other) || touches(&other.writes, self)
    }
}

/// 按请求顺序分波：每个动作排在所有与之冲突的前序动作之后一波
pub fn plan_waves(footprints: &[ResourceFootprint]) -> Vec<Vec<usize>> {
    let mut wave_of: Vec<usize> = Vec::with_capacity(footprints.len());
    for (i, fp) in footprints.iter().enumerate() {
        let wave = (0..i)
            .filter(|&j| footprints[j].conflicts_with(fp))
            .map(|j| wave_of[j] + 1)
            .max()
            .unwrap_or(0);
        wave_of.push(wave);
    }
    let count = wave_of.iter().max().map_or(0, |m| m + 1);
    let mut waves = vec![Vec::new(); count];
    for (i, w) in wave_of.into_iter().enumerate() {
        waves[w].push(i);
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_do_not_conflict() {
        let a = ResourceFootprint::none().read("db:prod");
        let b = ResourceFootprint::none().read("db:prod");
        assert!(!a.conflicts_with(&b));
        let c = ResourceFootprint::none().write("db:prod");
        assert!(a.conflicts_with(&c));
        assert!(c.conflicts_with(&a));
    }

    #[test]
    fn test_waves_keep_dependent_order() {
        let fps = vec![
            ResourceFootprint::none().read("disk"),
            ResourceFootprint::none().read("net:db"),
            ResourceFootprint::none().write("disk"),
            ResourceFootprint::none(),
            ResourceFootprint::none().read("disk"),
        ];
        assert_eq!(plan_waves(&fps), vec![vec![0, 1, 3], vec![2], vec![4]]);
    }

    #[test]
    fn test_empty_batch() {
        assert!(plan_waves(&[]).is_empty());
    }
}
