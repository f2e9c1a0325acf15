//! Prompt assembly and keyword-heuristic question classification.

use serde::{Deserialize, Serialize};

use super::state::RetrievedDoc;

/// Fallback once the iteration budget runs out without a usable answer.
pub const MAX_ITERATIONS_FALLBACK: &str = "经过多次尝试，无法基于提供的信息生成满意的答案。";

/// Substitute when the provider streams back nothing at all.
pub const EMPTY_ANSWER_FALLBACK: &str = "抱歉，无法生成有效答案。请检查 LLM API 连接和文档质量。";

pub const RAG_SYSTEM_PROMPT: &str = "你是一个专业、严谨的知识库问答助手。\
只基于提供的参考文档回答问题：直接、清晰地回答核心问题，用文档中的具体证据支持观点，\
不要添加文档中没有的信息。如果文档信息不足以回答，请明确说明原因。保持专业但友好的语气。";

const NO_CONTEXT_PREAMBLE: &str = "【说明】\n当前知识库中未找到与您的问题相关的文档。\
可能是知识库内容不完整，或问题表述与文档用词差异较大。\
系统将基于通用知识进行回答，但准确性可能有限。";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Factual,
    Explanatory,
    Procedural,
    Comparative,
    Creative,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Factual => "factual",
            QuestionType::Explanatory => "explanatory",
            QuestionType::Procedural => "procedural",
            QuestionType::Comparative => "comparative",
            QuestionType::Creative => "creative",
        }
    }
}

pub fn classify_question(question: &str) -> QuestionType {
    let lowered = question.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| lowered.contains(w));

    if contains_any(&["怎样", "怎么", "如何", "步骤", "how to", "how do"]) {
        QuestionType::Procedural
    } else if contains_any(&["对比", "差异", "vs", "versus", "区别", "相比"]) {
        QuestionType::Comparative
    } else if contains_any(&["建议", "推荐", "想法", "想象", "创意", "suggest", "recommend"]) {
        QuestionType::Creative
    } else if contains_any(&["为什么", "原因", "因为", "why", "reason"]) {
        QuestionType::Explanatory
    } else {
        QuestionType::Factual
    }
}

/// Retrieval context in the `1. … / 2. … / …` shape the generation prompt
/// expects; a fixed preamble when there is nothing to cite.
pub fn format_context(documents: &[RetrievedDoc]) -> String {
    if documents.is_empty() {
        return NO_CONTEXT_PREAMBLE.to_owned();
    }

    documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let filename = doc
                .metadata
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            format!("{}. 来源: {}\n{}", i + 1, filename, doc.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System + user prompt pair for the generation call.
pub fn build_prompts(question: &str, documents: &[RetrievedDoc]) -> (String, String) {
    let context = format_context(documents);
    let user = format!(
        "【参考文档】\n{}\n\n【用户问题】\n{}\n\n请直接给出答案：",
        context, question
    );
    (RAG_SYSTEM_PROMPT.to_owned(), user)
}
