//! Citation validation for generated answers.
//!
//! Every factual sentence in a generated answer must end with a citation
//! matching a passage that was actually retrieved. Sentences citing
//! passages outside the retrieval context are stripped and flagged;
//! factual sentences with no citation at all fail validation so the
//! engine can run its single repair round.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::EngineError;
use crate::prompt::{UNCOVERED_NOTICE, UNVERIFIED_NOTICE};
use crate::text::split_sentences;
use crate::types::{CitationRef, RetrievalContext};

/// Matches `[Policy Name, Clause X, Section Y]`. The literal `Clause`
/// anchor lets policy names themselves contain commas.
static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]]+?),\s*Clause\s+([^,\[\]]+?),\s*Section\s+(\d+)\]")
        .expect("citation regex compiles")
});

/// A sentence with fewer words than this is treated as an interjection
/// rather than a factual claim.
const MIN_FACTUAL_WORDS: usize = 6;

/// One citation marker as written by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCitation {
    pub raw: String,
    pub document_title: String,
    pub clause_label: String,
    pub section_index: usize,
}

/// Pull every well-formed citation marker out of a block of text.
pub fn extract_citations(text: &str) -> Vec<ParsedCitation> {
    CITATION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let section_index = caps.get(3)?.as_str().parse::<usize>().ok()?;
            Some(ParsedCitation {
                raw: caps.get(0)?.as_str().to_string(),
                document_title: caps.get(1)?.as_str().trim().to_string(),
                clause_label: caps.get(2)?.as_str().trim().to_string(),
                section_index,
            })
        })
        .collect()
}

/// Outcome of a successful validation pass.
#[derive(Debug, Clone)]
pub struct ValidatedResponse {
    /// The answer text, with any unknown-citation sentences removed.
    pub text: String,
    /// Citations in first-appearance order, one entry per passage.
    pub citations: Vec<CitationRef>,
    /// Human-readable notes about anything that was stripped.
    pub warnings: Vec<String>,
}

impl ValidatedResponse {
    pub fn cited_passage_ids(&self) -> HashSet<String> {
        self.citations
            .iter()
            .map(|c| c.passage_id.clone())
            .collect()
    }
}

/// Check a generated answer against the passages it was grounded on.
///
/// Sentences citing a passage outside `ctx` are removed with a warning.
/// If a factual sentence carries no citation, or stripping removed the
/// whole answer, the result is an error and the caller decides whether
/// to re-prompt.
pub fn validate(answer: &str, ctx: &RetrievalContext) -> Result<ValidatedResponse, EngineError> {
    let mut kept: Vec<String> = Vec::new();
    let mut citations: Vec<CitationRef> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut first_unknown: Option<String> = None;
    let mut stripped_any = false;

    let sentences = split_sentences(answer);
    for sentence in &sentences {
        let parsed = extract_citations(sentence);
        let mut sentence_refs: Vec<CitationRef> = Vec::new();
        let mut unknown: Option<String> = None;

        for citation in &parsed {
            match resolve_citation(citation, ctx) {
                Some(cite_ref) => sentence_refs.push(cite_ref),
                None => {
                    unknown.get_or_insert_with(|| citation.raw.clone());
                }
            }
        }

        if let Some(raw) = unknown {
            tracing::warn!(citation = %raw, "Stripping sentence with unknown citation");
            warnings.push(format!(
                "Removed a statement citing {}, which does not match any retrieved passage.",
                raw
            ));
            first_unknown.get_or_insert(raw);
            stripped_any = true;
            continue;
        }

        if sentence_refs.is_empty() && looks_factual(sentence) {
            return Err(EngineError::MissingCitation {
                sentence: sentence.clone(),
            });
        }

        for cite_ref in sentence_refs {
            if seen_ids.insert(cite_ref.passage_id.clone()) {
                citations.push(cite_ref);
            }
        }
        kept.push(sentence.clone());
    }

    if kept.is_empty() {
        if let Some(citation) = first_unknown {
            return Err(EngineError::UnknownCitation { citation });
        }
        return Err(EngineError::MissingCitation {
            sentence: answer.trim().to_string(),
        });
    }

    let text = if stripped_any {
        kept.join(" ")
    } else {
        answer.trim().to_string()
    };

    Ok(ValidatedResponse {
        text,
        citations,
        warnings,
    })
}

/// Last-resort pass when the repair round still failed validation.
///
/// Unknown-citation sentences are stripped as usual, uncited factual
/// sentences are kept, and the unverified notice is appended so the
/// reader knows the citation contract was not fully met.
pub fn salvage(answer: &str, ctx: &RetrievalContext) -> ValidatedResponse {
    let mut kept: Vec<String> = Vec::new();
    let mut citations: Vec<CitationRef> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut warnings: Vec<String> = Vec::new();

    for sentence in split_sentences(answer) {
        let parsed = extract_citations(&sentence);
        let mut sentence_refs: Vec<CitationRef> = Vec::new();
        let mut unknown: Option<String> = None;
        for citation in &parsed {
            match resolve_citation(citation, ctx) {
                Some(cite_ref) => sentence_refs.push(cite_ref),
                None => {
                    unknown.get_or_insert_with(|| citation.raw.clone());
                }
            }
        }
        if let Some(raw) = unknown {
            warnings.push(format!(
                "Removed a statement citing {}, which does not match any retrieved passage.",
                raw
            ));
            continue;
        }
        for cite_ref in sentence_refs {
            if seen_ids.insert(cite_ref.passage_id.clone()) {
                citations.push(cite_ref);
            }
        }
        kept.push(sentence);
    }

    warnings.push("Answer retains statements without verifiable citations.".to_string());
    let mut text = kept.join(" ");
    if text.is_empty() {
        text = UNVERIFIED_NOTICE.to_string();
    } else {
        text.push_str("\n\n");
        text.push_str(UNVERIFIED_NOTICE);
    }

    ValidatedResponse {
        text,
        citations,
        warnings,
    }
}

/// Map a parsed citation onto the retrieval context, if it names a
/// passage that was actually supplied to the model.
fn resolve_citation(citation: &ParsedCitation, ctx: &RetrievalContext) -> Option<CitationRef> {
    ctx.passages
        .iter()
        .find(|p| {
            p.document_title == citation.document_title
                && p.clause_label == citation.clause_label
                && p.section_index == citation.section_index
        })
        .map(|p| CitationRef {
            passage_id: p.passage_id.clone(),
            document_title: p.document_title.clone(),
            section_index: p.section_index,
            section_title: p.section_title.clone(),
            clause_label: p.clause_label.clone(),
        })
}

/// Heuristic for sentences that assert something and therefore need a
/// citation. Questions, short interjections, and the two canned notices
/// are exempt.
fn looks_factual(sentence: &str) -> bool {
    let trimmed = sentence.trim();
    if trimmed.ends_with('?') {
        return false;
    }
    if trimmed == UNCOVERED_NOTICE || trimmed.starts_with("Note:") || trimmed == UNVERIFIED_NOTICE {
        return false;
    }
    trimmed.split_whitespace().count() >= MIN_FACTUAL_WORDS
}
