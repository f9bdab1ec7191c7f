//! 安全层：风险分级与确认闸门、用户输入净化

pub mod gate;
pub mod sanitize;

pub use gate::{RiskTier, SafetyGate, SafetyPolicy, Verdict};
pub use sanitize::{Sanitized, Sanitizer, REDACTION_MARKER};
