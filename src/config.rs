//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。
//! 组件不直接读取 config crate，而是由 AppConfig 转换出各自的配置结构。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::Budgets;
use crate::delegation::SubAgentSpec;
use crate::llm::RetryConfig;
use crate::queue::WorkerConfig;
use crate::react::{CheckpointPolicy, LoopConfig, DEFAULT_INSTRUCTION};
use crate::safety::SafetyPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub run: RunSection,
    pub safety: SafetyPolicy,
    pub tools: ToolsSection,
    pub workers: WorkerConfig,
    pub checkpoint: CheckpointSection,
    /// 可委派的子智能体
    pub agents: Vec<SubAgentSpec>,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 检查点与计划状态存放目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 覆盖默认的系统指令
    pub instruction: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            data_dir: default_data_dir(),
            instruction: None,
        }
    }
}

fn default_app_name() -> String {
    "hive".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// [llm] 段：后端选择与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock / openai
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            retry: RetryConfig::default(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [run] 段：预算、卡死检测、检查点策略
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 0 表示不限
    #[serde(default = "default_max_wall_clock_secs")]
    pub max_wall_clock_secs: u64,
    pub max_cost_units: Option<u64>,
    #[serde(default = "default_true")]
    pub final_answer_on_budget: bool,
    #[serde(default = "default_stuck_window")]
    pub stuck_window: usize,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    pub compaction_token_threshold: Option<usize>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_wall_clock_secs: default_max_wall_clock_secs(),
            max_cost_units: None,
            final_answer_on_budget: true,
            stuck_window: default_stuck_window(),
            checkpoint_policy: CheckpointPolicy::default(),
            compaction_token_threshold: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_wall_clock_secs() -> u64 {
    300
}

fn default_stuck_window() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// [tools] 段：工具超时与批内并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_parallel() -> usize {
    4
}

/// 检查点后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    Memory,
    #[default]
    File,
    Sqlite,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// 运行结束后保留的快照数
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            keep_last: default_keep_last(),
        }
    }
}

fn default_keep_last() -> usize {
    5
}

impl AppConfig {
    pub fn budgets(&self) -> Budgets {
        let mut budgets = Budgets::default().with_max_iterations(self.run.max_iterations);
        budgets = if self.run.max_wall_clock_secs == 0 {
            budgets.unbounded_wall_clock()
        } else {
            budgets.with_wall_clock(Duration::from_secs(self.run.max_wall_clock_secs))
        };
        if let Some(units) = self.run.max_cost_units {
            budgets = budgets.with_max_cost_units(units);
        }
        budgets
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            instruction: self
                .app
                .instruction
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string()),
            stuck_window: self.run.stuck_window,
            final_answer_on_budget: self.run.final_answer_on_budget,
            checkpoint_policy: self.run.checkpoint_policy,
            keep_checkpoints: self.checkpoint.keep_last,
            compaction_token_threshold: self.run.compaction_token_threshold,
            retry: self.llm.retry.clone(),
            tool_timeout_secs: self.tools.tool_timeout_secs,
            max_parallel: self.tools.max_parallel,
        }
    }

    pub fn safety_policy(&self) -> SafetyPolicy {
        self.safety.clone()
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.llm.retry.clone()
    }

    pub fn worker_config(&self) -> WorkerConfig {
        self.workers.clone()
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.app.data_dir.join("checkpoints")
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::RiskTier;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.run.max_iterations, 20);
        assert_eq!(cfg.run.stuck_window, 3);
        assert_eq!(cfg.llm.retry.max_attempts, 3);
        assert_eq!(cfg.workers.count, 2);
        assert_eq!(cfg.checkpoint.backend, CheckpointBackend::File);
        let budgets = cfg.budgets();
        assert_eq!(budgets.max_wall_clock_ms, Some(300_000));
        assert_eq!(cfg.loop_config().keep_checkpoints, 5);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[run]
max_iterations = 7
max_wall_clock_secs = 0
checkpoint_policy = "every_outcome"

[safety]
confirmation_tokens = ["ok"]

[safety.risk_overrides]
check_disk = "high"

[[agents]]
name = "diagnostician"
description = "checks disks"
instruction = "You diagnose."
tools = ["check_disk"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.run.max_iterations, 7);
        assert_eq!(cfg.run.checkpoint_policy, CheckpointPolicy::EveryOutcome);
        assert_eq!(cfg.budgets().max_wall_clock_ms, None);
        assert_eq!(cfg.safety.confirmation_tokens[0], "ok");
        assert_eq!(cfg.safety.risk_overrides.get("check_disk"), Some(&RiskTier::High));
        assert_eq!(cfg.agents[0].name, "diagnostician");
        assert_eq!(cfg.agents[0].tools[0], "check_disk");
    }
}
