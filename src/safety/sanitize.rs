//! 用户输入净化：检测指令覆盖类注入并替换为可见的标记
//!
//! 命中内容不会被静默丢弃，模型能看到有人尝试篡改指令。

use regex::Regex;

pub const REDACTION_MARKER: &str = "[REDACTED: instruction override attempt]";

const DEFAULT_PATTERNS: &[&str] = &[
    r"(?i)ignore\s+(all\s+)?(of\s+)?(the\s+|your\s+)?(previous|prior|above|earlier)\s+(instructions|prompts?|rules|messages)",
    r"(?i)disregard\s+(all\s+)?(the\s+|your\s+)?(previous|prior|above|system)?\s*(instructions|rules|guidelines|prompt)",
    r"(?i)forget\s+(all\s+)?(your|the|previous)\s+(instructions|rules|guidelines)",
    r"(?i)you\s+are\s+now\s+(in\s+)?(developer|dan|god|jailbreak)\s*mode",
    r"(?i)(reveal|print|show|repeat)\s+(me\s+)?(your|the)\s+(system\s+prompt|instructions)",
    r"(?i)</?\s*(system|instruction)s?\s*>",
    r"(?im)^\s*system\s*:",
];

/// 净化结果
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub text: String,
    pub redactions: usize,
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<Regex>,
}

impl Sanitizer {
    /// 默认规则 + 额外规则
    pub fn new(extra_patterns: &[String]) -> Result<Self, regex::Error> {
        let mut patterns = Vec::with_capacity(DEFAULT_PATTERNS.len() + extra_patterns.len());
        for p in DEFAULT_PATTERNS.iter().copied().chain(extra_patterns.iter().map(String::as_str)) {
            patterns.push(Regex::new(p)?);
        }
        Ok(Self { patterns })
    }

    pub fn sanitize(&self, text: &str) -> Sanitized {
        let mut out = text.to_string();
        let mut redactions = 0;
        for re in &self.patterns {
            let hits = re.find_iter(&out).count();
            if hits > 0 {
                redactions += hits;
                out = re.replace_all(&out, REDACTION_MARKER).into_owned();
            }
        }
        Sanitized { text: out, redactions }
    }
}
