//! Passage Store: decodes policy documents (wire schema or the scraper's
//! on-disk format) and flattens them into uniquely identified passages.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::config::IngestConfig;
use crate::text::{estimate_tokens, slugify};
use crate::types::{Clause, IngestReport, Passage, PolicyDocument, Section, SkippedDocument};

// ============================================================================
// Input formats
// ============================================================================

/// A policy file is either the plain wire schema or the scraper's richer
/// on-disk layout. Tried in that order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Wire(WireDocument),
    Scraped(ScrapedDocument),
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    title: String,
    source_url: String,
    sections: Vec<WireSection>,
}

#[derive(Debug, Deserialize)]
struct WireSection {
    section_title: String,
    clauses: Vec<WireClause>,
}

#[derive(Debug, Deserialize)]
struct WireClause {
    clause_label: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ScrapedDocument {
    metadata: ScrapedMetadata,
    structure: Vec<ScrapedPart>,
}

#[derive(Debug, Deserialize)]
struct ScrapedMetadata {
    title: String,
    #[serde(default)]
    approval_date: Option<String>,
    #[serde(default)]
    review_date: Option<String>,
    #[serde(default)]
    source_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapedPart {
    #[serde(default)]
    part_title: String,
    sections: Vec<ScrapedSection>,
}

#[derive(Debug, Deserialize)]
struct ScrapedSection {
    section_title: String,
    clauses: Vec<ScrapedClause>,
}

#[derive(Debug, Deserialize)]
struct ScrapedClause {
    clause_number: String,
    text: String,
    #[serde(default)]
    subclauses: Vec<String>,
}

/// The scraper wraps everything in a single placeholder part.
const DEFAULT_PART_TITLE: &str = "Main Content";

fn normalize(file: PolicyFile) -> PolicyDocument {
    match file {
        PolicyFile::Wire(doc) => {
            let sections = doc
                .sections
                .into_iter()
                .map(|s| Section {
                    section_title: s.section_title,
                    clauses: s
                        .clauses
                        .into_iter()
                        .map(|c| Clause {
                            clause_label: c.clause_label,
                            text: c.text,
                        })
                        .collect(),
                })
                .collect();
            PolicyDocument::new(doc.title, doc.source_url, sections)
        }
        PolicyFile::Scraped(doc) => {
            let mut sections = Vec::new();
            for part in doc.structure {
                let part_title = part.part_title.trim().to_string();
                for section in part.sections {
                    let section_title =
                        if part_title.is_empty() || part_title == DEFAULT_PART_TITLE {
                            section.section_title
                        } else {
                            format!("{}: {}", part_title, section.section_title)
                        };
                    let clauses = section
                        .clauses
                        .into_iter()
                        .map(|c| {
                            let text = if c.subclauses.is_empty() {
                                c.text
                            } else {
                                format!("{} {}", c.text, c.subclauses.join(" "))
                            };
                            Clause {
                                clause_label: c.clause_number,
                                text,
                            }
                        })
                        .collect();
                    sections.push(Section {
                        section_title,
                        clauses,
                    });
                }
            }
            let source_url = doc.metadata.source_path.clone().unwrap_or_default();
            let mut normalized = PolicyDocument::new(doc.metadata.title, source_url, sections);
            normalized.approval_date = doc.metadata.approval_date;
            normalized.review_date = doc.metadata.review_date;
            normalized
        }
    }
}

/// Decode one policy document from JSON, accepting either input format.
pub fn parse_policy_file(content: &str) -> Result<PolicyDocument> {
    let file: PolicyFile =
        serde_json::from_str(content).context("document matches neither known policy format")?;
    Ok(normalize(file))
}

/// Load every `*.json` policy file under `dir` (sorted paths for
/// reproducibility). Malformed files are skipped with a warning.
pub fn load_documents_from_dir(dir: &Path) -> Result<(Vec<PolicyDocument>, Vec<SkippedDocument>)> {
    let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    if paths.is_empty() {
        anyhow::bail!("no policy JSON files found under {}", dir.display());
    }

    let mut documents = Vec::new();
    let mut skipped = Vec::new();
    for path in paths {
        let name = path.display().to_string();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Skipping unreadable policy file");
                skipped.push(SkippedDocument {
                    title: name,
                    reason: format!("unreadable: {}", e),
                });
                continue;
            }
        };
        match parse_policy_file(&content) {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Skipping malformed policy file");
                skipped.push(SkippedDocument {
                    title: name,
                    reason: format!("malformed: {}", e),
                });
            }
        }
    }
    tracing::info!(
        loaded = documents.len(),
        skipped = skipped.len(),
        dir = %dir.display(),
        "Loaded policy documents"
    );
    Ok((documents, skipped))
}

// ============================================================================
// Flattening documents into passages
// ============================================================================

/// Flatten a document batch into passages. Deterministic: output order
/// follows document -> section -> clause order. Bad documents are skipped
/// and recorded; a later document with the same id overwrites the earlier.
pub fn ingest(documents: &[PolicyDocument], config: &IngestConfig) -> (Vec<Passage>, IngestReport) {
    let mut report = IngestReport {
        documents_seen: documents.len(),
        ..Default::default()
    };

    // Deduplicate by document_id, last occurrence wins, original slot kept.
    let mut ordered: Vec<&PolicyDocument> = Vec::new();
    let mut slot_by_id: HashMap<String, usize> = HashMap::new();
    for doc in documents {
        let id = if doc.document_id.is_empty() {
            slugify(&doc.title)
        } else {
            doc.document_id.clone()
        };
        match slot_by_id.get(&id) {
            Some(&slot) => {
                tracing::warn!(document_id = %id, "Duplicate document id in batch, overwriting");
                ordered[slot] = doc;
            }
            None => {
                slot_by_id.insert(id, ordered.len());
                ordered.push(doc);
            }
        }
    }

    let mut passages = Vec::new();
    for doc in ordered {
        match flatten_document(doc, config, &mut report) {
            Ok(doc_passages) => {
                report.documents_indexed += 1;
                passages.extend(doc_passages);
            }
            Err(reason) => {
                tracing::warn!(title = %doc.title, reason = %reason, "Skipping document");
                report.documents_skipped.push(SkippedDocument {
                    title: doc.title.clone(),
                    reason,
                });
            }
        }
    }

    report.passages = passages.len();
    tracing::info!(
        documents = report.documents_indexed,
        skipped = report.documents_skipped.len(),
        passages = report.passages,
        merged = report.merged_clauses,
        "Ingest complete"
    );
    (passages, report)
}

fn flatten_document(
    doc: &PolicyDocument,
    config: &IngestConfig,
    report: &mut IngestReport,
) -> std::result::Result<Vec<Passage>, String> {
    if doc.title.trim().is_empty() {
        return Err("empty title".to_string());
    }
    if doc.sections.is_empty() {
        return Err("no sections".to_string());
    }
    if doc.sections.iter().all(|s| s.clauses.is_empty()) {
        return Err("no clauses in any section".to_string());
    }
    for (sidx, section) in doc.sections.iter().enumerate() {
        for clause in &section.clauses {
            if clause.text.trim().is_empty() {
                return Err(format!(
                    "clause {} in section {} has empty text",
                    clause.clause_label,
                    sidx + 1
                ));
            }
        }
    }

    let document_id = if doc.document_id.is_empty() {
        slugify(&doc.title)
    } else {
        doc.document_id.clone()
    };

    let mut passages = Vec::new();
    let mut seen_ids: HashMap<String, usize> = HashMap::new();
    for (sidx, section) in doc.sections.iter().enumerate() {
        let section_index = sidx + 1;
        for group in merge_short_clauses(&section.clauses, config.min_clause_tokens) {
            if group.len() > 1 {
                report.merged_clauses += group.len() - 1;
                tracing::debug!(
                    document_id = %document_id,
                    section = section_index,
                    clauses = group.len(),
                    "Merged short clauses into one passage"
                );
            }
            let clause_label = group_label(&group);
            let text = group
                .iter()
                .map(|c| c.text.trim())
                .collect::<Vec<_>>()
                .join(" ");

            let base_id = format!("{}:{}:{}", document_id, section_index, slugify(&clause_label));
            let passage_id = match seen_ids.get_mut(&base_id) {
                Some(n) => {
                    *n += 1;
                    format!("{}-{}", base_id, n)
                }
                None => {
                    seen_ids.insert(base_id.clone(), 1);
                    base_id
                }
            };

            passages.push(Passage {
                passage_id,
                document_id: document_id.clone(),
                document_title: doc.title.clone(),
                section_index,
                section_title: section.section_title.clone(),
                clause_label,
                text,
            });
        }
    }
    Ok(passages)
}

/// Group clauses so that any clause under the token minimum merges with the
/// following clause of the same section. A trailing short run merges backward
/// into the previous group; a section of only short clauses yields one group.
fn merge_short_clauses(clauses: &[Clause], min_tokens: usize) -> Vec<Vec<&Clause>> {
    let mut groups: Vec<Vec<&Clause>> = Vec::new();
    let mut pending: Vec<&Clause> = Vec::new();

    for clause in clauses {
        if estimate_tokens(clause.text.trim()) < min_tokens {
            pending.push(clause);
        } else {
            pending.push(clause);
            groups.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        match groups.last_mut() {
            Some(last) => last.extend(pending),
            None => groups.push(pending),
        }
    }
    groups
}

fn group_label(group: &[&Clause]) -> String {
    match group {
        [single] => single.clause_label.clone(),
        [first, .., last] => format!("{}-{}", first.clause_label, last.clause_label),
        [] => String::new(),
    }
}
