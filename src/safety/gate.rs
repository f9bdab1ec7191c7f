//! 安全闸门：风险分级、确认检查、必填参数检查
//!
//! 风险等级 = max(工具声明, 名称/描述关键字)；按名称的覆盖配置优先。
//! 高风险动作需要在对应确认请求之后出现的肯定性 UserText，且一次确认只放行一次执行。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::{ActionCall, ConversationState, Entry, OutcomeErrorKind};
use crate::safety::sanitize::{Sanitized, Sanitizer};
use crate::tools::{missing_fields, Tool};

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// 闸门判定
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    RequireConfirmation(String),
    RequireClarification(Vec<String>),
}

/// 安全策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// 视为确认的回复（去首尾空白、小写后精确匹配）
    pub confirmation_tokens: Vec<String>,
    /// 按动作名称强制指定风险等级
    pub risk_overrides: HashMap<String, RiskTier>,
    pub high_risk_keywords: Vec<String>,
    pub medium_risk_keywords: Vec<String>,
    /// 中风险动作是否也需要确认
    pub confirm_medium_risk: bool,
    /// 缺参时挂起等待补充；false 时作为校验错误反馈给模型
    pub suspend_on_clarification: bool,
    /// 额外的注入检测正则
    pub injection_patterns: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            confirmation_tokens: ["yes", "y", "confirm", "approve"]
                .into_iter()
                .map(String::from)
                .collect(),
            risk_overrides: HashMap::new(),
            high_risk_keywords: ["delete", "drop", "destroy", "truncate", "wipe", "rollback"]
                .into_iter()
                .map(String::from)
                .collect(),
            medium_risk_keywords: ["restart", "send", "email", "deploy", "write"]
                .into_iter()
                .map(String::from)
                .collect(),
            confirm_medium_risk: false,
            suspend_on_clarification: true,
            injection_patterns: Vec::new(),
        }
    }
}

/// 安全闸门
#[derive(Debug, Clone)]
pub struct SafetyGate {
    policy: SafetyPolicy,
    sanitizer: Sanitizer,
}

impl SafetyGate {
    pub fn new(policy: SafetyPolicy) -> Result<Self, AgentError> {
        let sanitizer = Sanitizer::new(&policy.injection_patterns)
            .map_err(|e| AgentError::Config(format!("invalid injection pattern: {e}")))?;
        Ok(Self { policy, sanitizer })
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// 风险分级（确定性）
    pub fn risk_tier(&self, tool: &dyn Tool) -> RiskTier {
        if let Some(tier) = self.policy.risk_overrides.get(tool.name()) {
            return *tier;
        }
        let words: Vec<String> = tool
            .name()
            .split(|c: char| !c.is_alphanumeric())
            .chain(tool.description().split(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let hit = |keywords: &[String]| keywords.iter().any(|k| words.iter().any(|w| w == k));
        let by_keyword = if hit(&self.policy.high_risk_keywords) {
            RiskTier::High
        } else if hit(&self.policy.medium_risk_keywords) {
            RiskTier::Medium
        } else {
            RiskTier::Low
        };
        tool.risk_tier().max(by_keyword)
    }

    pub fn requires_confirmation(&self, tier: RiskTier) -> bool {
        match tier {
            RiskTier::High => true,
            RiskTier::Medium => self.policy.confirm_medium_risk,
            RiskTier::Low => false,
        }
    }

    /// 对单个动作做判定
    pub fn classify(&self, tool: &dyn Tool, call: &ActionCall, state: &ConversationState) -> Verdict {
        let missing = missing_fields(&tool.parameters_schema(), &call.args);
        if !missing.is_empty() {
            return Verdict::RequireClarification(missing);
        }
        let tier = self.risk_tier(tool);
        if self.requires_confirmation(tier) && !self.is_confirmed(call, state) {
            return Verdict::RequireConfirmation(format!(
                "{} is a {tier}-risk action ({}) with args {}",
                call.name,
                tool.description(),
                crate::memory::canonical_args(&call.args)
            ));
        }
        Verdict::Allow
    }

    pub fn is_confirmation(&self, reply: &str) -> bool {
        let reply = reply.trim().to_lowercase();
        self.policy
            .confirmation_tokens
            .iter()
            .any(|t| t.trim().to_lowercase() == reply)
    }

    /// 同签名动作的最近一次确认请求之后，有肯定性的 UserText，且该确认尚未被一次执行消耗
    pub fn is_confirmed(&self, call: &ActionCall, state: &ConversationState) -> bool {
        let signature = call.signature();
        let same_signature = |call_id: &str| {
            state
                .call(call_id)
                .is_some_and(|c| c.signature() == signature)
        };
        let entries = state.entries();
        let Some(requested_at) = entries.iter().rposition(|e| match e {
            Entry::ActionOutcome(o) => {
                o.error_kind() == Some(OutcomeErrorKind::ConfirmationRequired) && same_signature(&o.call_id)
            }
            _ => false,
        }) else {
            return false;
        };

        let later = &entries[requested_at + 1..];
        let consumed = later.iter().any(|e| match e {
            Entry::ActionOutcome(o) => {
                let executed = o.is_success() || o.error_kind().is_some_and(OutcomeErrorKind::was_executed);
                executed && same_signature(&o.call_id)
            }
            _ => false,
        });
        if consumed {
            return false;
        }
        later.iter().any(|e| match e {
            Entry::UserText { text } => self.is_confirmation(text),
            _ => false,
        })
    }

    /// 净化用户输入；命中时记录告警
    pub fn sanitize(&self, text: &str) -> String {
        let Sanitized { text, redactions } = self.sanitizer.sanitize(text);
        if redactions > 0 {
            tracing::warn!(redactions, "instruction override attempt neutralized in user input");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ActionOutcome;
    use crate::tools::{builtin_registry, ServiceState};
    use serde_json::json;

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyPolicy::default()).unwrap()
    }

    fn blocked_state(call: &ActionCall) -> ConversationState {
        let mut state = ConversationState::new("sys");
        state.append(Entry::user("delete database prod")).unwrap();
        state.append(Entry::ActionRequest { calls: vec![call.clone()] }).unwrap();
        state
            .append(Entry::ActionOutcome(ActionOutcome::error(
                &call.call_id,
                OutcomeErrorKind::ConfirmationRequired,
                "high risk",
            )))
            .unwrap();
        state
    }

    #[test]
    fn test_risk_tiers() {
        let registry = builtin_registry(ServiceState::new());
        let g = gate();
        let tier = |name: &str| g.risk_tier(registry.resolve(name).unwrap().as_ref());
        assert_eq!(tier("delete_database"), RiskTier::High);
        assert_eq!(tier("rollback_deploy"), RiskTier::High);
        assert_eq!(tier("send_email"), RiskTier::Medium);
        assert_eq!(tier("check_disk"), RiskTier::Low);
        assert_eq!(tier("clean_logs"), RiskTier::Low);
    }

    #[test]
    fn test_override_wins() {
        let mut policy = SafetyPolicy::default();
        policy.risk_overrides.insert("check_disk".into(), RiskTier::High);
        let g = SafetyGate::new(policy).unwrap();
        let registry = builtin_registry(ServiceState::new());
        assert_eq!(
            g.risk_tier(registry.resolve("check_disk").unwrap().as_ref()),
            RiskTier::High
        );
    }

    #[test]
    fn test_clarification_before_confirmation() {
        let registry = builtin_registry(ServiceState::new());
        let tool = registry.resolve("delete_database").unwrap();
        let call = ActionCall::new("c1", "delete_database", json!({}));
        let state = ConversationState::new("sys");
        assert_eq!(
            gate().classify(tool.as_ref(), &call, &state),
            Verdict::RequireClarification(vec!["db".into()])
        );
    }

    #[test]
    fn test_confirmation_must_follow_request() {
        let g = gate();
        let registry = builtin_registry(ServiceState::new());
        let tool = registry.resolve("delete_database").unwrap();
        let call = ActionCall::new("c1", "delete_database", json!({"db": "prod"}));

        // 请求之前说过的 yes 不算
        let mut state = ConversationState::new("sys");
        state.append(Entry::user("yes")).unwrap();
        assert!(matches!(
            g.classify(tool.as_ref(), &call, &state),
            Verdict::RequireConfirmation(_)
        ));

        let mut state = blocked_state(&call);
        assert!(!g.is_confirmed(&call, &state));
        state.append(Entry::user("  YES ")).unwrap();
        let replay = call.replayed(state.len());
        assert!(g.is_confirmed(&replay, &state));
        assert_eq!(g.classify(tool.as_ref(), &replay, &state), Verdict::Allow);

        // 确认不能带到其他参数的高风险动作
        let other = ActionCall::new("c9", "delete_database", json!({"db": "staging"}));
        assert!(!g.is_confirmed(&other, &state));

        // 执行一次后确认被消耗
        state.append(Entry::ActionRequest { calls: vec![replay.clone()] }).unwrap();
        state
            .append(Entry::ActionOutcome(ActionOutcome::success(&replay.call_id, json!("deleted"))))
            .unwrap();
        assert!(!g.is_confirmed(&call.replayed(state.len()), &state));
    }

    #[test]
    fn test_non_affirmative_reply() {
        let g = gate();
        let call = ActionCall::new("c1", "delete_database", json!({"db": "prod"}));
        let mut state = blocked_state(&call);
        state.append(Entry::user("yes, but only staging")).unwrap();
        assert!(!g.is_confirmed(&call, &state));
        assert!(g.is_confirmation("Approve"));
    }
}
