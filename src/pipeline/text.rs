//! Text folding and reply clean-up.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::ReplyTemplates;

/// Longest reply sent to a customer, in characters.
const MAX_REPLY_CHARS: usize = 130;

/// Fold text for comparison: lowercase, drop whitespace and punctuation.
///
/// CJK characters count as alphanumeric and are kept.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// True when the normalized `text` contains any normalized phrase.
pub fn contains_any(text: &str, phrases: &[String]) -> bool {
    let folded = normalize(text);
    phrases.iter().any(|p| {
        let p = normalize(p);
        !p.is_empty() && folded.contains(&p)
    })
}

fn trailing_timestamp() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\d{1,2}:\d{2}\S*$").expect("static regex"))
}

/// Clean a generated reply before it is sent.
///
/// Strips a trailing chat timestamp, collapses whitespace, replaces replies
/// that mention off-platform contact channels, caps the length and makes
/// sure the reply ends like a sentence.
pub fn normalize_reply(text: &str, blocked: &[String], templates: &ReplyTemplates) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return templates.general_empty.clone();
    }

    let stripped = trailing_timestamp().replace(trimmed, "");
    let mut value = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if value.is_empty() {
        return templates.general_empty.clone();
    }

    let lowered = value.to_lowercase();
    if blocked
        .iter()
        .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
    {
        value = templates.compliance.clone();
    }

    if value.chars().count() > MAX_REPLY_CHARS {
        let cut: String = value.chars().take(MAX_REPLY_CHARS).collect();
        value = format!("{}...", cut.trim_end());
    }

    if !value.ends_with(['。', '！', '？', '.', '!', '?', '🌹', '😊', '💗', '～']) {
        value.push('。');
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked() -> Vec<String> {
        vec!["微信".into(), "电话".into(), "qq".into()]
    }

    #[test]
    fn normalize_folds_case_space_and_punctuation() {
        assert_eq!(normalize("  Hello, World! "), "helloworld");
        assert_eq!(normalize("多久 发货？"), "多久发货");
    }

    #[test]
    fn contains_any_uses_folded_text() {
        let phrases = vec!["在哪".to_string()];
        assert!(contains_any("地址 在 哪里?", &phrases));
        assert!(!contains_any("价格多少", &phrases));
        assert!(!contains_any("anything", &["  ".to_string()]));
    }

    #[test]
    fn reply_strips_timestamp_and_terminates() {
        let templates = ReplyTemplates::default();
        let out = normalize_reply("我们支持七天无理由  退换 12:30", &blocked(), &templates);
        assert_eq!(out, "我们支持七天无理由 退换。");
    }

    #[test]
    fn reply_blocks_contact_channels() {
        let templates = ReplyTemplates::default();
        let out = normalize_reply("加我QQ 12345 详聊", &blocked(), &templates);
        assert_eq!(out, templates.compliance);
    }

    #[test]
    fn reply_caps_length() {
        let templates = ReplyTemplates::default();
        let long = "好".repeat(300);
        let out = normalize_reply(&long, &blocked(), &templates);
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= MAX_REPLY_CHARS + 3);
    }

    #[test]
    fn empty_reply_uses_template() {
        let templates = ReplyTemplates::default();
        assert_eq!(normalize_reply("   ", &blocked(), &templates), templates.general_empty);
    }
}
