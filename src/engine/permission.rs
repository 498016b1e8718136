//! 权限答复解析：中英文关键词

/// 用户对权限请求的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
    /// 批准本次，并在本对话后续自动批准
    AllowAll,
}

const ALLOW_ALL: &[&str] = &[
    "allow all",
    "allowall",
    "approve all",
    "全部允许",
    "允许所有",
    "始终允许",
];
const ALLOW: &[&str] = &["allow", "yes", "y", "ok", "approve", "允许", "同意", "可以", "好"];
const DENY: &[&str] = &["deny", "no", "n", "reject", "拒绝", "不允许", "不行", "否"];

/// 提示用户可用的关键词
pub const DECISION_HINT: &str = "Reply `allow` / `deny` / `allow all` (允许 / 拒绝 / 全部允许).";

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || "。！？，、～".contains(c))
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 无法识别时返回 None
pub fn parse_decision(text: &str) -> Option<PermissionDecision> {
    let normalized = normalize(text);
    if ALLOW_ALL.contains(&normalized.as_str()) {
        Some(PermissionDecision::AllowAll)
    } else if ALLOW.contains(&normalized.as_str()) {
        Some(PermissionDecision::Allow)
    } else if DENY.contains(&normalized.as_str()) {
        Some(PermissionDecision::Deny)
    } else {
        None
    }
}
