//! The reasoning capability: judging sufficiency and writing summaries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{Attempt, VerdictStatus};
use crate::error::Result;
use crate::text::{content_terms, synonyms_of};

/// Whether the evidence satisfies a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sufficiency {
    Sufficient,
    Insufficient,
}

/// Input for [`Reasoner::judge`].
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub criterion: String,
    pub description: String,
    /// The matched passage with its surrounding sentences.
    pub extracted_text: String,
    /// Reference-rule passages retrieved for the criterion.
    pub reference_texts: Vec<String>,
    pub attempt: Attempt,
}

/// Output of [`Reasoner::judge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub verdict: Sufficiency,
    pub rationale: String,
}

/// Input for [`Reasoner::summarize`].
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    pub criterion: String,
    pub category: String,
    pub description: String,
    pub status: VerdictStatus,
    pub reason: String,
    /// Matched passages, best attempt last.
    pub passages: Vec<String>,
    pub reference_texts: Vec<String>,
    /// Rules the references came from, deduplicated.
    pub rules: Vec<String>,
}

/// Judges compliance and writes prose summaries.
///
/// The coordinator calls [`judge`](Reasoner::judge) at most twice per
/// criterion and [`summarize`](Reasoner::summarize) at most once.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment>;

    async fn summarize(&self, request: &SummaryRequest) -> Result<String>;
}

/// Offline reasoner based on key-term overlap.
///
/// Key terms come from the criterion and its description. A term counts as
/// present when a passage term equals it or one of its synonyms, or when one
/// is a prefix of the other (`co2` matches `co2e`). Without reference rules
/// the passage is sufficient when the matched share of key terms reaches
/// `threshold`. With reference rules the passage must also share terms with
/// at least one of them, and either share may reach `threshold`: a passage
/// that restates the rule is enough even if it words the criterion
/// differently.
#[derive(Debug, Clone, Copy)]
pub struct KeywordReasoner {
    threshold: f32,
}

impl Default for KeywordReasoner {
    fn default() -> Self {
        Self { threshold: 0.3 }
    }
}

/// Boilerplate of normative text that says nothing about the topic.
const RULE_FILLER: &[&str] = &[
    "shall", "must", "should", "may", "required", "companies", "company", "organization",
    "organisation", "organizations", "organisations", "entity", "entities",
];

/// Matched and total term counts.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Coverage {
    matched: usize,
    total: usize,
}

impl Coverage {
    fn ratio(self) -> f32 {
        if self.total == 0 { 0.0 } else { self.matched as f32 / self.total as f32 }
    }
}

impl KeywordReasoner {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn key_terms(criterion: &str, description: &str) -> Vec<String> {
        let mut terms = content_terms(criterion);
        for term in content_terms(description) {
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        terms
    }

    fn matches(term: &str, passage_terms: &[String]) -> bool {
        passage_terms.iter().any(|p| {
            p == term
                || (term.len() >= 3 && p.starts_with(term))
                || (p.len() >= 3 && term.starts_with(p.as_str()))
        })
    }

    fn term_present(term: &str, passage_terms: &[String]) -> bool {
        Self::matches(term, passage_terms)
            || synonyms_of(term).iter().any(|s| Self::matches(s, passage_terms))
    }

    /// Best coverage of any single reference passage, or `None` when no
    /// reference has content terms.
    fn rule_coverage(reference_texts: &[String], passage_terms: &[String]) -> Option<Coverage> {
        reference_texts
            .iter()
            .map(|text| {
                let mut terms = content_terms(text);
                terms.retain(|t| !RULE_FILLER.contains(&t.as_str()));
                terms.sort();
                terms.dedup();
                let matched = terms.iter().filter(|t| Self::term_present(t, passage_terms)).count();
                Coverage { matched, total: terms.len() }
            })
            .filter(|c| c.total > 0)
            .max_by(|a, b| a.ratio().total_cmp(&b.ratio()))
    }
}

#[async_trait]
impl Reasoner for KeywordReasoner {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment> {
        let key_terms = Self::key_terms(&request.criterion, &request.description);
        let passage_terms = content_terms(&request.extracted_text);
        if key_terms.is_empty() || passage_terms.is_empty() {
            return Ok(Judgment {
                verdict: Sufficiency::Insufficient,
                rationale: "no comparable terms".to_string(),
            });
        }

        let matched: Vec<&str> = key_terms
            .iter()
            .filter(|t| Self::term_present(t, &passage_terms))
            .map(String::as_str)
            .collect();
        let criterion = Coverage { matched: matched.len(), total: key_terms.len() };
        let mut rationale =
            format!("passage covers {} of {} key terms", criterion.matched, criterion.total);
        if !matched.is_empty() {
            rationale.push_str(&format!(" ({})", matched.join(", ")));
        }

        let sufficient = match Self::rule_coverage(&request.reference_texts, &passage_terms) {
            None => criterion.ratio() >= self.threshold,
            Some(rule) => {
                rationale.push_str(&format!(
                    " and {} of {} reference terms",
                    rule.matched, rule.total
                ));
                criterion.matched > 0
                    && rule.matched > 0
                    && (criterion.ratio() >= self.threshold || rule.ratio() >= self.threshold)
            }
        };
        let verdict = if sufficient { Sufficiency::Sufficient } else { Sufficiency::Insufficient };
        Ok(Judgment { verdict, rationale })
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        let evidence = match request.passages.last() {
            Some(passage) => format!(
                "{} supporting passage(s); best match: \"{}\"",
                request.passages.len(),
                passage
            ),
            None => "no supporting passage found".to_string(),
        };
        let references = if request.rules.is_empty() {
            format!("{} reference passage(s) consulted", request.reference_texts.len())
        } else {
            format!(
                "{} reference passage(s) consulted from {}",
                request.reference_texts.len(),
                request.rules.join(", ")
            )
        };
        let status = match request.status {
            VerdictStatus::Validated => "disclosed",
            VerdictStatus::Retry | VerdictStatus::Flagged => "not demonstrated",
        };
        Ok(format!(
            "{} ({}): {status}. {evidence}. {references}. {}.",
            request.criterion, request.category, request.reason
        ))
    }
}
