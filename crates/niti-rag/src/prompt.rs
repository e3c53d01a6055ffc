//! Prompt assembly for grounded generation.
//!
//! The system prompt pins the model to the numbered passages and to the
//! citation labels printed above each passage. Canned texts for the
//! refusal, clarification, and repair paths also live here so every
//! user-facing message comes from one place.

use crate::config::{GenerationConfig, MemoryConfig};
use crate::llm::{ChatMessage, GenerationParams};
use crate::text::truncate_chars;
use crate::types::{ConversationTurn, RetrievalContext, TurnRole};

// ============================================================================
// Prompts
// ============================================================================

pub const GROUNDED_ANSWER_PROMPT: &str = r#"You are a university policy assistant. You MUST answer using ONLY the numbered policy passages provided below. You have NO other knowledge.

GROUNDING RULES (non-negotiable):
1. ONLY the numbered passages exist. Your training data and general knowledge DO NOT EXIST for this answer.
2. Before writing ANY fact, find the exact words in a passage that support it. If no passage supports a fact, do not write that fact.
3. NEVER infer, assume, or extrapolate beyond what a passage states explicitly.
4. If the passages do not contain the answer, reply with exactly this sentence and nothing else: "The indexed policies do not cover this."

CITATION RULES:
5. Every sentence that states a fact MUST end with a citation in the exact form [Policy Name, Clause X, Section Y].
6. Copy the citation label VERBATIM from the header line printed above the passage you used. Do not invent, merge, or reformat labels.
7. A sentence may carry more than one citation when it draws on more than one passage.
8. If you cannot cite a sentence, remove that sentence.

STYLE RULES:
9. Be concise and direct. Plain prose, no headings.
10. Quote clause wording where the exact wording matters."#;

/// Sent as a follow-up instruction when the first answer failed citation
/// validation.
pub const STRICT_CITATION_REPROMPT: &str = r#"Your previous answer was rejected: at least one factual sentence carried no citation.

Rewrite the answer now, following these rules EXACTLY:
1. Every factual sentence ends with a citation in the form [Policy Name, Clause X, Section Y], copied verbatim from a passage header above.
2. Remove any sentence you cannot support with a passage.
3. Do not add new facts."#;

// ============================================================================
// Canned responses
// ============================================================================

/// Returned when the retrieval gate rejects the query.
pub const REFUSAL_TEMPLATE: &str = "I could not find a policy passage relevant enough to \
     answer that. The indexed policies may not cover this topic; try rephrasing, or ask \
     about a specific policy area.";

/// Returned for broad queries the resolver cannot anchor to any topic.
pub const CLARIFICATION_TEMPLATE: &str = "Could you narrow that down? Naming a policy \
     area, for example assessment, appeals, or academic integrity, helps me find the \
     right clauses.";

/// Returned for empty or whitespace-only input.
pub const PROMPT_FOR_INPUT_TEMPLATE: &str = "Please enter a question about the indexed \
     policies.";

/// The one uncited sentence the model is allowed to produce (rule 4 above).
/// The citation validator exempts it.
pub const UNCOVERED_NOTICE: &str = "The indexed policies do not cover this.";

/// Appended when the repair round still produced uncited factual sentences.
pub const UNVERIFIED_NOTICE: &str = "Note: some statements above could not be matched \
     to an indexed policy clause and should be checked against the source documents.";

/// Per-turn cap when condensing history into the prompt.
const HISTORY_TURN_CHARS: usize = 400;

// ============================================================================
// Builder
// ============================================================================

/// A ready-to-send request: ordered chat messages plus sampling parameters.
#[derive(Debug, Clone)]
pub struct PromptPayload {
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

/// Assembles grounded prompts from a retrieval context and recent history.
pub struct PromptBuilder {
    generation: GenerationConfig,
    prompt_window: usize,
}

impl PromptBuilder {
    pub fn new(generation: GenerationConfig, memory: &MemoryConfig) -> Self {
        Self {
            generation,
            prompt_window: memory.prompt_window,
        }
    }

    /// Build the initial grounded prompt for a gated query.
    pub fn build(&self, ctx: &RetrievalContext, history: &[ConversationTurn]) -> PromptPayload {
        PromptPayload {
            messages: vec![
                ChatMessage::system(GROUNDED_ANSWER_PROMPT),
                ChatMessage::user(self.grounded_request(ctx, history)),
            ],
            params: self.params(),
        }
    }

    /// Build the single repair round after a citation validation failure.
    /// The rejected answer stays in the transcript so the model can see
    /// what it has to fix.
    pub fn build_reprompt(
        &self,
        ctx: &RetrievalContext,
        history: &[ConversationTurn],
        rejected_answer: &str,
    ) -> PromptPayload {
        PromptPayload {
            messages: vec![
                ChatMessage::system(GROUNDED_ANSWER_PROMPT),
                ChatMessage::user(self.grounded_request(ctx, history)),
                ChatMessage::assistant(rejected_answer),
                ChatMessage::user(STRICT_CITATION_REPROMPT),
            ],
            params: self.params(),
        }
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            max_tokens: self.generation.max_tokens,
        }
    }

    fn grounded_request(&self, ctx: &RetrievalContext, history: &[ConversationTurn]) -> String {
        let passage_block: String = ctx
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("Passage {} {}:\n{}", i + 1, p.citation_label(), p.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let history_block = condense_history(history, self.prompt_window);
        let history_section = if history_block.is_empty() {
            String::new()
        } else {
            format!("Recent conversation:\n{}\n\n", history_block)
        };

        format!(
            "===== POLICY PASSAGES (your ONLY source of facts) =====\n\
             {passages}\n\
             ===== END OF POLICY PASSAGES =====\n\n\
             {history}\
             Question: \"{question}\"\n\n\
             REMINDER: Answer using ONLY the passages above. Every factual sentence ends \
             with a citation copied verbatim from a passage header.",
            passages = passage_block,
            history = history_section,
            question = ctx.resolved_query_text,
        )
    }
}

/// Flatten the most recent turns into "User:"/"Assistant:" lines, each
/// capped so one long answer cannot crowd out the passages.
fn condense_history(history: &[ConversationTurn], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .map(|turn| {
            let role = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            format!("{}: {}", role, truncate_chars(turn.text.trim(), HISTORY_TURN_CHARS))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;
    use crate::types::Passage;
    use std::collections::HashSet;

    fn passage(id: &str, title: &str, section_index: usize, clause: &str, text: &str) -> Passage {
        Passage {
            passage_id: id.to_string(),
            document_id: crate::text::slugify(title),
            document_title: title.to_string(),
            section_index,
            section_title: "Rules".to_string(),
            clause_label: clause.to_string(),
            text: text.to_string(),
        }
    }

    fn ctx_with(passages: Vec<Passage>, query: &str) -> RetrievalContext {
        RetrievalContext {
            resolved_query_text: query.to_string(),
            top_k_results: Vec::new(),
            above_threshold: true,
            top_score: Some(0.8),
            passages,
        }
    }

    fn builder() -> PromptBuilder {
        PromptBuilder::new(GenerationConfig::default(), &MemoryConfig::default())
    }

    #[test]
    fn test_build_numbers_passages_with_citation_headers() {
        let ctx = ctx_with(
            vec![
                passage(
                    "assessment-policy:2:3.1",
                    "Assessment Policy",
                    2,
                    "3.1",
                    "Extensions of up to seven days may be granted.",
                ),
                passage(
                    "assessment-policy:2:3.2",
                    "Assessment Policy",
                    2,
                    "3.2",
                    "Requests must be lodged before the due date.",
                ),
            ],
            "How long can an extension be?",
        );

        let payload = builder().build(&ctx, &[]);
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].role, ChatRole::System);
        assert!(payload.messages[0].content.contains("CITATION RULES"));

        let request = &payload.messages[1].content;
        assert!(request.contains("Passage 1 [Assessment Policy, Clause 3.1, Section 2]:"));
        assert!(request.contains("Passage 2 [Assessment Policy, Clause 3.2, Section 2]:"));
        assert!(request.contains("Question: \"How long can an extension be?\""));
    }

    #[test]
    fn test_history_window_keeps_only_recent_turns() {
        let ctx = ctx_with(Vec::new(), "follow up");
        let mut history = Vec::new();
        for i in 1..=8 {
            history.push(ConversationTurn::user(format!("question {}", i)));
            history.push(ConversationTurn::assistant(
                format!("answer {}", i),
                HashSet::new(),
            ));
        }

        let builder = PromptBuilder::new(
            GenerationConfig::default(),
            &MemoryConfig {
                max_turns: 10,
                prompt_window: 2,
            },
        );
        let request = &builder.build(&ctx, &history).messages[1].content;
        assert!(request.contains("User: question 8"));
        assert!(request.contains("Assistant: answer 8"));
        assert!(!request.contains("question 7"));
        assert!(!request.contains("question 1"));
    }

    #[test]
    fn test_empty_history_omits_conversation_section() {
        let ctx = ctx_with(Vec::new(), "anything");
        let request = &builder().build(&ctx, &[]).messages[1].content;
        assert!(!request.contains("Recent conversation:"));
    }

    #[test]
    fn test_long_turns_are_capped() {
        let ctx = ctx_with(Vec::new(), "short");
        let history = vec![ConversationTurn::user("x".repeat(2000))];
        let request = &builder().build(&ctx, &history).messages[1].content;
        let line = request
            .lines()
            .find(|l| l.starts_with("User: "))
            .expect("history line present");
        assert!(line.len() <= "User: ".len() + HISTORY_TURN_CHARS);
    }

    #[test]
    fn test_reprompt_carries_rejected_answer_and_stricter_rules() {
        let ctx = ctx_with(Vec::new(), "query");
        let payload = builder().build_reprompt(&ctx, &[], "Uncited claim.");
        assert_eq!(payload.messages.len(), 4);
        assert_eq!(payload.messages[2].role, ChatRole::Assistant);
        assert_eq!(payload.messages[2].content, "Uncited claim.");
        assert_eq!(payload.messages[3].role, ChatRole::User);
        assert!(payload.messages[3].content.contains("rejected"));
    }

    #[test]
    fn test_params_follow_generation_config() {
        let params = builder().params();
        assert!((params.temperature - 0.2).abs() < f32::EPSILON);
        assert!((params.top_p - 0.9).abs() < f32::EPSILON);
        assert_eq!(params.max_tokens, 4096);
    }
}
