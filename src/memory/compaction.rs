//! 对话压缩（Context Compaction）
//!
//! 对话条数与 token 会随迭代无限增长；Loop Controller 在两次迭代之间检查估算 token 数，
//! 超过阈值时调用 Compactor。压缩策略本身可替换（如 LLM 摘要），默认实现只做截断：
//! 保留 Instruction、首条用户任务以及能放入预算的最近记录，且不拆散请求与其结果。

use async_trait::async_trait;

use crate::memory::{ConversationError, ConversationState, Entry};

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    pub fn estimate_entry(entry: &Entry) -> usize {
        // 每条记录附带角色/结构开销
        TokenEstimator::estimate(&entry.render_text()) + 4
    }

    pub fn estimate_conversation(state: &ConversationState) -> usize {
        state.entries().iter().map(Self::estimate_entry).sum()
    }
}

/// 压缩协作者：返回 None 表示无需改动
#[async_trait]
pub trait Compactor: Send + Sync {
    async fn compact(&self, state: &ConversationState) -> Result<Option<Vec<Entry>>, ConversationError>;
}

/// 截断式压缩
#[derive(Debug, Clone)]
pub struct TruncatingCompactor {
    /// 压缩后的目标 token 预算
    target_tokens: usize,
}

impl TruncatingCompactor {
    pub fn new(target_tokens: usize) -> Self {
        Self { target_tokens }
    }

    /// 可作为保留后缀起点的位置：不能落在 ActionOutcome 上（否则会与请求分离）
    fn is_boundary(entries: &[Entry], idx: usize) -> bool {
        !matches!(entries.get(idx), Some(Entry::ActionOutcome(_)))
    }
}

#[async_trait]
impl Compactor for TruncatingCompactor {
    async fn compact(&self, state: &ConversationState) -> Result<Option<Vec<Entry>>, ConversationError> {
        let entries = state.entries();
        if TokenEstimator::estimate_conversation(state) <= self.target_tokens {
            return Ok(None);
        }

        // 头部：Instruction + 第一条 UserText（任务本身）
        let mut head_len = 1;
        if matches!(entries.get(1), Some(Entry::UserText { .. })) {
            head_len = 2;
        }
        let head_tokens: usize = entries[..head_len].iter().map(TokenEstimator::estimate_entry).sum();
        let budget = self.target_tokens.saturating_sub(head_tokens);

        // 从尾部向前累加，记录最后一个落在边界上且不超预算的起点
        let mut used = 0;
        let mut start = entries.len();
        let mut idx = entries.len();
        while idx > head_len {
            idx -= 1;
            used += TokenEstimator::estimate_entry(&entries[idx]);
            if used > budget {
                break;
            }
            if Self::is_boundary(entries, idx) {
                start = idx;
            }
        }
        // 至少保留最后一个完整批次
        if start == entries.len() {
            start = (head_len..entries.len())
                .rev()
                .find(|&i| Self::is_boundary(entries, i))
                .unwrap_or(head_len);
        }
        if start <= head_len {
            return Ok(None);
        }

        let mut kept: Vec<Entry> = entries[..head_len].to_vec();
        kept.extend_from_slice(&entries[start..]);
        // 校验：截断结果必须仍满足配对不变量
        ConversationState::try_from(kept.clone())?;
        tracing::info!(
            dropped = start - head_len,
            kept = kept.len(),
            "conversation compacted"
        );
        Ok(Some(kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ActionCall, ActionOutcome};
    use serde_json::json;

    fn long_state(batches: usize) -> ConversationState {
        let mut state = ConversationState::new("You are an autonomous DevOps agent.");
        state.append(Entry::user("disk is full")).unwrap();
        for i in 0..batches {
            let id = format!("c{i}");
            state
                .append(Entry::ActionRequest {
                    calls: vec![ActionCall::new(&id, "check_disk", json!({"verbose": true}))],
                })
                .unwrap();
            state
                .append(Entry::ActionOutcome(ActionOutcome::success(
                    &id,
                    json!("Disk Usage: 95% (CRITICAL). Large folder: /var/log"),
                )))
                .unwrap();
        }
        state
    }

    #[test]
    fn test_estimate_mixed_text() {
        assert_eq!(TokenEstimator::estimate("abcdefgh"), 2);
        assert_eq!(TokenEstimator::estimate("中文"), 2);
        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    #[tokio::test]
    async fn test_small_conversation_untouched() {
        let state = long_state(1);
        let compactor = TruncatingCompactor::new(10_000);
        assert!(compactor.compact(&state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncation_keeps_head_and_whole_batches() {
        let state = long_state(40);
        let compactor = TruncatingCompactor::new(120);
        let kept = compactor.compact(&state).await.unwrap().expect("should compact");
        assert!(kept.len() < state.len());
        assert!(matches!(kept[0], Entry::Instruction { .. }));
        assert!(matches!(kept[1], Entry::UserText { .. }));
        assert!(matches!(kept[2], Entry::ActionRequest { .. }));
        let rebuilt = ConversationState::try_from(kept).unwrap();
        assert!(!rebuilt.has_pending_calls());
    }
}
