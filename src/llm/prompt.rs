//! System prompt composition for the generative fallback.

use crate::config::PromptDocs;

const PERSONA: &str = "你是私域客服助手。\n\
你只负责补充规则外的一般问答，不做任何地址/媒体/流程决策。\n\
语气要自然、亲切、专业，面向中老年假发咨询场景。\n\
回复要求：1-2句中文，简洁，不要编造价格活动，不要输出联系方式信息。";

/// Closing instruction, placed after any knowledge reference.
pub const PLAIN_TEXT_ONLY: &str = "仅输出最终客服话术纯文本，不要输出JSON、代码块或解释。";

/// Persona plus the brand prompt and playbook documents. Empty documents
/// are left out.
pub fn compose_system_prompt(docs: &PromptDocs) -> String {
    let mut prompt = PERSONA.to_string();
    for (title, body) in [
        ("品牌系统提示词参考", docs.system.as_str()),
        ("客服话术参考", docs.playbook.as_str()),
    ] {
        if !body.is_empty() {
            prompt.push_str(&format!("\n\n【{title}】\n{body}"));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_follow_persona() {
        let prompt = compose_system_prompt(&PromptDocs {
            system: "品牌：示例".into(),
            playbook: "先问需求".into(),
        });
        assert!(prompt.starts_with(PERSONA));
        let brand = prompt.find("【品牌系统提示词参考】\n品牌：示例").unwrap();
        let playbook = prompt.find("【客服话术参考】\n先问需求").unwrap();
        assert!(brand < playbook);
    }

    #[test]
    fn empty_documents_are_skipped() {
        let prompt = compose_system_prompt(&PromptDocs::default());
        assert_eq!(prompt, PERSONA);
        assert!(!prompt.contains("【"));
    }
}
