//! Policy question answering engine.
//!
//! Wires the full pipeline: resolve the query, retrieve behind the
//! relevance gate, build the grounded prompt, generate, validate
//! citations, remember the exchange. Refusals and clarifications are
//! answers, not errors; errors mean the engine or the generation
//! service is unusable, and nothing is recorded for them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::embeddings::HashedEmbedder;
use crate::error::EngineError;
use crate::index::EmbeddingIndex;
use crate::ingest::{self, load_documents_from_dir};
use crate::llm::{LLMClient, LLMProvider};
use crate::memory::ConversationMemory;
use crate::prompt::{
    PromptBuilder, CLARIFICATION_TEMPLATE, PROMPT_FOR_INPUT_TEMPLATE, REFUSAL_TEMPLATE,
};
use crate::resolver::{QueryResolver, ResolutionOutcome};
use crate::retrieval::RetrievalGate;
use crate::types::{
    AnswerKind, AnswerMetadata, ConversationTurn, EngineAnswer, IngestReport, PolicyDocument,
    RetrievalContext,
};
use crate::validator;

type SessionMemory = Arc<Mutex<ConversationMemory>>;

pub struct PolicyEngine {
    config: EngineConfig,
    index: EmbeddingIndex,
    resolver: QueryResolver,
    gate: RetrievalGate,
    prompts: PromptBuilder,
    llm: LLMClient,
    sessions: DashMap<Uuid, SessionMemory>,
    documents_indexed: AtomicUsize,
}

impl PolicyEngine {
    pub fn new(config: EngineConfig, provider: Box<dyn LLMProvider>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid engine configuration")?;

        let embedder = Arc::new(HashedEmbedder::new(
            config.embedding.dimension,
            config.embedding.cache_size,
        ));
        let index = EmbeddingIndex::new(embedder);
        let gate = RetrievalGate::new(config.retrieval.clone());
        let prompts = PromptBuilder::new(config.generation.clone(), &config.memory);
        let llm = LLMClient::new(
            provider,
            Duration::from_secs(config.generation.request_timeout_secs),
        );

        Ok(Self {
            config,
            index,
            resolver: QueryResolver::new(),
            gate,
            prompts,
            llm,
            sessions: DashMap::new(),
            documents_indexed: AtomicUsize::new(0),
        })
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// Flatten the documents into passages and swap in a fresh index
    /// generation. In-flight queries keep reading the old generation.
    pub fn reindex(&self, documents: &[PolicyDocument]) -> Result<IngestReport> {
        let (passages, report) = ingest::ingest(documents, &self.config.ingest);
        self.index
            .build(passages)
            .context("Failed to build embedding index")?;
        self.documents_indexed
            .store(report.documents_indexed, Ordering::Relaxed);

        tracing::info!(
            documents = report.documents_indexed,
            passages = report.passages,
            skipped = report.documents_skipped.len(),
            "Reindex complete"
        );
        Ok(report)
    }

    /// Load every policy JSON file under `dir` and reindex from scratch.
    /// Unreadable or malformed files are reported, not fatal.
    pub fn load_and_reindex(&self, dir: &Path) -> Result<IngestReport> {
        let (documents, load_skipped) = load_documents_from_dir(dir)?;
        let mut report = self.reindex(&documents)?;
        report.documents_seen += load_skipped.len();
        report.documents_skipped.extend(load_skipped);
        Ok(report)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn create_session(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(id, self.fresh_memory());
        tracing::debug!(session = %id, "Session created");
        id
    }

    /// Drop a session and its history. Returns false for unknown ids.
    pub fn end_session(&self, session_id: &Uuid) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    fn fresh_memory(&self) -> SessionMemory {
        Arc::new(Mutex::new(ConversationMemory::new(
            self.config.memory.max_turns,
        )))
    }

    // ========================================================================
    // Asking
    // ========================================================================

    /// Answer one query within a session. Unknown session ids get a
    /// fresh memory. Failed exchanges (engine or service errors) leave
    /// the session history untouched.
    pub async fn ask(
        &self,
        session_id: Uuid,
        raw_query: &str,
    ) -> Result<EngineAnswer, EngineError> {
        let started = Instant::now();
        let generation = self.index.generation()?;

        let memory = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| self.fresh_memory())
            .clone();
        let history = memory.lock().snapshot();

        let resolution = self.resolver.resolve(raw_query, &history, &generation);
        match resolution.outcome {
            ResolutionOutcome::OutOfScope => {
                tracing::debug!(session = %session_id, "Out of scope input, prompting for a question");
                let answer = EngineAnswer {
                    kind: AnswerKind::OutOfScope,
                    text: PROMPT_FOR_INPUT_TEMPLATE.to_string(),
                    citations: Vec::new(),
                    metadata: self.metadata(started, None, None, false, Vec::new()),
                };
                record_exchange(&memory, raw_query, &answer.text, HashSet::new());
                return Ok(answer);
            }
            ResolutionOutcome::NeedsClarification => {
                let reason = EngineError::AmbiguousQuery {
                    query: raw_query.to_string(),
                };
                tracing::info!(session = %session_id, error = %reason, "Asking the user to narrow the query");
                let answer = EngineAnswer {
                    kind: AnswerKind::Clarification,
                    text: CLARIFICATION_TEMPLATE.to_string(),
                    citations: Vec::new(),
                    metadata: self.metadata(started, None, None, false, Vec::new()),
                };
                record_exchange(&memory, raw_query, &answer.text, HashSet::new());
                return Ok(answer);
            }
            ResolutionOutcome::Answerable => {}
        }

        let ctx = self
            .gate
            .retrieve(&self.index, &generation, &resolution.resolved_query_text)?;
        if !ctx.above_threshold {
            let reason = EngineError::NoRelevantPassages {
                top_score: ctx.top_score.unwrap_or(0.0),
                min_similarity: self.config.retrieval.min_similarity,
            };
            tracing::info!(session = %session_id, error = %reason, "Refusing below-threshold query");
            let answer = EngineAnswer {
                kind: AnswerKind::Refusal,
                text: REFUSAL_TEMPLATE.to_string(),
                citations: Vec::new(),
                metadata: self.metadata(started, Some(&ctx), None, false, Vec::new()),
            };
            record_exchange(&memory, raw_query, &answer.text, HashSet::new());
            return Ok(answer);
        }

        // Grounded path: generate, validate, repair at most once.
        let payload = self.prompts.build(&ctx, &history);
        let first = self.llm.generate(&payload.messages, &payload.params).await?;
        let mut retried = first.retried;
        let mut model = first.response.model.clone();

        let validated = match validator::validate(&first.response.content, &ctx) {
            Ok(v) => v,
            Err(reason) if reason.is_recoverable() => {
                tracing::warn!(
                    session = %session_id,
                    error = %reason,
                    "Citation validation failed, re-prompting once"
                );
                let repair =
                    self.prompts
                        .build_reprompt(&ctx, &history, &first.response.content);
                let second = self.llm.generate(&repair.messages, &repair.params).await?;
                retried = retried || second.retried;
                if second.response.model.is_some() {
                    model = second.response.model.clone();
                }
                match validator::validate(&second.response.content, &ctx) {
                    Ok(v) => v,
                    Err(still_failing) => {
                        tracing::warn!(
                            session = %session_id,
                            error = %still_failing,
                            "Repair round still unverified, keeping salvageable text"
                        );
                        validator::salvage(&second.response.content, &ctx)
                    }
                }
            }
            Err(err) => return Err(err),
        };

        let answer = EngineAnswer {
            kind: AnswerKind::Grounded,
            text: validated.text.clone(),
            citations: validated.citations.clone(),
            metadata: self.metadata(started, Some(&ctx), model, retried, validated.warnings.clone()),
        };
        record_exchange(
            &memory,
            raw_query,
            &answer.text,
            validated.cited_passage_ids(),
        );

        tracing::info!(
            session = %session_id,
            duration_ms = answer.metadata.duration_ms,
            citations = answer.citations.len(),
            top_score = ?ctx.top_score,
            "Answered grounded query"
        );
        Ok(answer)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn statistics(&self) -> std::collections::HashMap<String, String> {
        let mut stats = std::collections::HashMap::new();
        let passage_count = self
            .index
            .generation()
            .map(|g| g.len())
            .unwrap_or(0);

        stats.insert("passage_count".to_string(), passage_count.to_string());
        stats.insert(
            "index_version".to_string(),
            self.index
                .version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unbuilt".to_string()),
        );
        stats.insert(
            "documents_indexed".to_string(),
            self.documents_indexed.load(Ordering::Relaxed).to_string(),
        );
        stats.insert(
            "sessions_active".to_string(),
            self.sessions.len().to_string(),
        );
        stats.insert(
            "embedding_dimension".to_string(),
            self.config.embedding.dimension.to_string(),
        );
        stats.insert(
            "provider".to_string(),
            self.llm.provider_name().to_string(),
        );
        stats
    }

    fn metadata(
        &self,
        started: Instant,
        ctx: Option<&RetrievalContext>,
        model: Option<String>,
        retried: bool,
        warnings: Vec<String>,
    ) -> AnswerMetadata {
        AnswerMetadata {
            duration_ms: started.elapsed().as_millis() as u64,
            top_score: ctx.and_then(|c| c.top_score),
            passages_considered: ctx.map(|c| c.passages.len()).unwrap_or(0),
            model,
            retried,
            warnings,
        }
    }
}

/// Append the exchange to session memory. Empty user input is not
/// recorded; the assistant's canned reply still is.
fn record_exchange(
    memory: &Mutex<ConversationMemory>,
    user_text: &str,
    assistant_text: &str,
    cited: HashSet<String>,
) {
    let mut mem = memory.lock();
    if !user_text.trim().is_empty() {
        mem.record(ConversationTurn::user(user_text.trim()));
    }
    mem.record(ConversationTurn::assistant(assistant_text, cited));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ChatResponse, GenerationParams};
    use crate::prompt::UNVERIFIED_NOTICE;
    use crate::types::{Clause, Section};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Provider that replays a fixed list of responses and counts calls.
    struct ScriptedLLM {
        responses: Mutex<VecDeque<String>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedLLM {
        fn new(responses: &[&str]) -> (Box<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let provider = Box::new(Self {
                responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
                calls: calls.clone(),
            });
            (provider, calls)
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedLLM {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _params: &GenerationParams,
        ) -> anyhow::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .responses
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("scripted provider exhausted"))?;
            Ok(ChatResponse {
                content: next,
                model: Some("scripted".to_string()),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn corpus() -> Vec<PolicyDocument> {
        vec![
            PolicyDocument::new(
                "Assessment Policy",
                "https://policies.example.edu/assessment",
                vec![Section {
                    section_title: "Extensions and Special Consideration".to_string(),
                    clauses: vec![
                        Clause {
                            clause_label: "3.1".to_string(),
                            text: "Extensions of time to submit an assessment item may be \
                                   granted for up to seven calendar days."
                                .to_string(),
                        },
                        Clause {
                            clause_label: "3.2".to_string(),
                            text: "Requests for an extension must be lodged in writing before \
                                   the assessment item due date."
                                .to_string(),
                        },
                        Clause {
                            clause_label: "4".to_string(),
                            text: "An extension of time to submit does not change the marking \
                                   criteria for the assessment item."
                                .to_string(),
                        },
                    ],
                }],
            ),
            PolicyDocument::new(
                "Academic Integrity Policy",
                "https://policies.example.edu/integrity",
                vec![Section {
                    section_title: "Plagiarism".to_string(),
                    clauses: vec![Clause {
                        clause_label: "2.1".to_string(),
                        text: "Plagiarism is the presentation of the work of another person \
                               as though it is your own. Plagiarism includes copying or \
                               paraphrasing the work of others without acknowledgement, and \
                               plagiarism in any form counts as academic misconduct."
                            .to_string(),
                    }],
                }],
            ),
        ]
    }

    fn engine_with(responses: &[&str]) -> (PolicyEngine, Arc<AtomicUsize>) {
        let (provider, calls) = ScriptedLLM::new(responses);
        let engine = PolicyEngine::new(EngineConfig::default(), provider).expect("engine builds");
        engine.reindex(&corpus()).expect("reindex succeeds");
        (engine, calls)
    }

    #[tokio::test]
    async fn test_grounded_answer_carries_citations() {
        let (engine, calls) = engine_with(&[
            "Extensions of time may be granted for up to seven calendar days \
             [Assessment Policy, Clause 3.1, Section 1].",
        ]);
        let session = engine.create_session();

        let answer = engine
            .ask(session, "Can assessment extensions be granted?")
            .await
            .expect("answers");

        assert_eq!(answer.kind, AnswerKind::Grounded);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].passage_id, "assessment-policy:1:3.1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(answer.metadata.top_score.expect("score present") >= 0.35);
        assert!(answer.metadata.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_off_topic_query_is_refused_without_llm_call() {
        let (engine, calls) = engine_with(&[]);
        let session = engine.create_session();

        let answer = engine
            .ask(session, "What's the weather today?")
            .await
            .expect("refusal is an answer");

        assert_eq!(answer.kind, AnswerKind::Refusal);
        assert_eq!(answer.text, REFUSAL_TEMPLATE);
        assert!(answer.citations.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(answer.metadata.top_score.expect("score reported") < 0.35);
    }

    #[tokio::test]
    async fn test_empty_query_prompts_for_input() {
        let (engine, calls) = engine_with(&[]);
        let session = engine.create_session();

        let answer = engine.ask(session, "   ").await.expect("answers");
        assert_eq!(answer.kind, AnswerKind::OutOfScope);
        assert_eq!(answer.text, PROMPT_FOR_INPUT_TEMPLATE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(answer.metadata.top_score.is_none());
    }

    #[tokio::test]
    async fn test_follow_up_fuses_prior_turn_context() {
        let (engine, calls) = engine_with(&[
            "Extensions of time may be granted for up to seven calendar days \
             [Assessment Policy, Clause 3.1, Section 1].",
            "An extension does not change the marking criteria \
             [Assessment Policy, Clause 4, Section 1].",
        ]);
        let session = engine.create_session();

        let first = engine
            .ask(session, "Can assessment extensions be granted?")
            .await
            .expect("answers");
        assert_eq!(first.kind, AnswerKind::Grounded);

        // Alone this query scores near zero; it only clears the gate
        // because the prior turn is fused in.
        let second = engine
            .ask(session, "What about clause 4?")
            .await
            .expect("answers");
        assert_eq!(second.kind, AnswerKind::Grounded);
        assert_eq!(second.citations.len(), 1);
        assert_eq!(second.citations[0].passage_id, "assessment-policy:1:4");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_vague_query_gets_clarification_without_llm_call() {
        let (engine, calls) = engine_with(&[]);
        let session = engine.create_session();

        let answer = engine.ask(session, "Tell me more").await.expect("answers");
        assert_eq!(answer.kind, AnswerKind::Clarification);
        assert_eq!(answer.text, CLARIFICATION_TEMPLATE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_citation_triggers_one_reprompt() {
        let (engine, calls) = engine_with(&[
            "Extensions are normally granted for up to seven calendar days.",
            "Extensions of time may be granted for up to seven calendar days \
             [Assessment Policy, Clause 3.1, Section 1].",
        ]);
        let session = engine.create_session();

        let answer = engine
            .ask(session, "Can assessment extensions be granted?")
            .await
            .expect("answers after repair");

        assert_eq!(answer.kind, AnswerKind::Grounded);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(answer.metadata.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_unrepaired_answer_gets_unverified_notice() {
        let (engine, calls) = engine_with(&[
            "Extensions are normally granted for up to seven calendar days.",
            "Extensions are normally granted for up to seven calendar days.",
        ]);
        let session = engine.create_session();

        let answer = engine
            .ask(session, "Can assessment extensions be granted?")
            .await
            .expect("salvaged answer");

        assert_eq!(answer.kind, AnswerKind::Grounded);
        assert!(answer.text.ends_with(UNVERIFIED_NOTICE));
        assert!(answer.citations.is_empty());
        assert!(!answer.metadata.warnings.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ask_before_reindex_is_an_error() {
        let (provider, _calls) = ScriptedLLM::new(&[]);
        let engine = PolicyEngine::new(EngineConfig::default(), provider).expect("engine builds");
        let session = engine.create_session();

        let err = engine
            .ask(session, "Can assessment extensions be granted?")
            .await
            .expect_err("index not built");
        assert!(matches!(err, EngineError::IndexNotBuilt));
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_history_untouched() {
        // Provider is exhausted immediately: both attempts of the first
        // ask fail, surfacing a service error.
        let (engine, calls) = engine_with(&[]);
        let session = engine.create_session();

        let err = engine
            .ask(session, "Can assessment extensions be granted?")
            .await
            .expect_err("service error");
        assert!(matches!(err, EngineError::GenerationService(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // With no recorded turns there is nothing to fuse, so the bare
        // follow-up falls below the gate instead of inheriting context.
        let answer = engine
            .ask(session, "What about clause 4?")
            .await
            .expect("refusal");
        assert_eq!(answer.kind, AnswerKind::Refusal);
    }

    #[tokio::test]
    async fn test_sessions_can_be_ended() {
        let (engine, _calls) = engine_with(&[]);
        let session = engine.create_session();
        assert!(engine.end_session(&session));
        assert!(!engine.end_session(&session));
    }

    #[tokio::test]
    async fn test_statistics_report_index_state() {
        let (engine, _calls) = engine_with(&[]);
        let _session = engine.create_session();

        let stats = engine.statistics();
        assert_eq!(stats["passage_count"], "4");
        assert_eq!(stats["documents_indexed"], "2");
        assert_eq!(stats["index_version"], "1");
        assert_eq!(stats["sessions_active"], "1");
        assert_eq!(stats["embedding_dimension"], "384");
    }

    #[tokio::test]
    async fn test_load_and_reindex_skips_malformed_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let good = serde_json::json!({
            "title": "Assessment Policy",
            "source_url": "https://policies.example.edu/assessment",
            "sections": [{
                "section_title": "Extensions",
                "clauses": [{
                    "clause_label": "3.1",
                    "text": "Extensions of time to submit an assessment item may be granted \
                             for up to seven calendar days."
                }]
            }]
        });
        std::fs::write(
            dir.path().join("assessment.json"),
            serde_json::to_string_pretty(&good).expect("serializes"),
        )
        .expect("writes");
        std::fs::write(dir.path().join("broken.json"), "{ not json").expect("writes");

        let (provider, _calls) = ScriptedLLM::new(&[]);
        let engine = PolicyEngine::new(EngineConfig::default(), provider).expect("engine builds");
        let report = engine
            .load_and_reindex(dir.path())
            .expect("loads the good file");

        assert_eq!(report.documents_indexed, 1);
        assert_eq!(report.documents_skipped.len(), 1);
        assert!(report.documents_skipped[0].title.contains("broken.json"));
    }
}
