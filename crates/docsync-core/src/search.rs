//! Hybrid retrieval with access filtering.
//!
//! The algorithm runs entirely through the [`Store`] trait. The caller is
//! responsible for embedding the query (or not) and building
//! [`RetrievalParams`] from its configuration.
//!
//! # Scoring
//!
//! 1. Fetch `candidate_k_lexical` lexical candidates and, when a query
//!    vector is available, `candidate_k_semantic` vector candidates. Both
//!    are already restricted to what the caller may see.
//! 2. Union by chunk id and re-check visibility on every candidate.
//! 3. Fuse:
//!    `score = w_semantic·cos⁺ + w_lexical·lex/lex_max + w_recency·0.5^(age/half_life) + w_core·[core]`
//!    where `cos⁺` is cosine clamped to `[0, 1]` and `lex_max` is the best
//!    lexical score among the candidates.
//! 4. Sort by score (desc), `last_reviewed_at` (desc, never-reviewed last),
//!    document id (asc), chunk index (asc).
//! 5. Truncate to `k`.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{is_visible, ChunkCandidate, Store};

/// The caller's access attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub audience: BTreeSet<String>,
}

impl AccessContext {
    pub fn new<I, S>(audience: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            audience: audience.into_iter().map(Into::into).collect(),
        }
    }

    /// Core documents are visible to everyone; other documents need at
    /// least one shared audience tag.
    pub fn permits(&self, core: bool, audience: &BTreeSet<String>) -> bool {
        core || !self.audience.is_disjoint(audience)
    }
}

/// Fusion weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalWeights {
    pub semantic: f64,
    pub lexical: f64,
    pub recency: f64,
    pub core: f64,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            lexical: 0.3,
            recency: 0.05,
            core: 0.05,
        }
    }
}

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub weights: RetrievalWeights,
    pub candidate_k_lexical: usize,
    pub candidate_k_semantic: usize,
    pub recency_half_life_days: f64,
    /// Upper bound applied to every request's `k`.
    pub max_k: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            weights: RetrievalWeights::default(),
            candidate_k_lexical: 50,
            candidate_k_semantic: 50,
            recency_half_life_days: 180.0,
            max_k: 50,
        }
    }
}

/// Inputs for one retrieval call.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    /// Query embedding; `None` restricts candidates to the lexical path.
    pub query_vec: Option<&'a [f32]>,
    pub access: &'a AccessContext,
    pub k: usize,
    pub params: &'a RetrievalParams,
    /// Reference time for the recency boost.
    pub now: DateTime<Utc>,
    pub explain: bool,
}

/// One ranked chunk with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub score: f64,
    pub title: String,
    /// Ancestor path plus title.
    pub breadcrumb: Vec<String>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

/// Per-component breakdown of a fused score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreExplanation {
    pub semantic: f64,
    pub lexical: f64,
    pub recency: f64,
    pub core: f64,
}

/// A candidate after fusion.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub candidate: ChunkCandidate,
    pub score: f64,
    pub components: ScoreExplanation,
}

/// Run a hybrid retrieval against a [`Store`].
///
/// Never fails for lack of embeddings: without a query vector the result
/// is ranked from lexical candidates alone.
pub async fn retrieve<S: Store + ?Sized>(
    store: &S,
    req: &RetrievalRequest<'_>,
) -> Result<Vec<ChunkResult>> {
    let k = req.k.min(req.params.max_k);
    if req.query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let lexical = store
        .keyword_search(req.query, req.access, req.params.candidate_k_lexical)
        .await?;

    let semantic = match req.query_vec {
        Some(qv) => {
            store
                .vector_search(qv, req.access, req.params.candidate_k_semantic)
                .await?
        }
        None => Vec::new(),
    };

    let mut fused = fuse(&lexical, &semantic, req.access, req.params, req.now);
    fused.truncate(k);

    Ok(fused
        .into_iter()
        .map(|sc| {
            let c = sc.candidate;
            let mut breadcrumb = c.document.path.clone();
            breadcrumb.push(c.document.title.clone());
            ChunkResult {
                chunk_id: c.chunk_id,
                document_id: c.document_id,
                chunk_index: c.chunk_index,
                score: sc.score,
                title: c.document.title,
                breadcrumb,
                last_reviewed_at: c.document.last_reviewed_at,
                text: c.text,
                explain: req.explain.then_some(sc.components),
            }
        })
        .collect())
}

/// Union, filter, score and sort candidate sets. Pure; no I/O.
pub fn fuse(
    lexical: &[ChunkCandidate],
    semantic: &[ChunkCandidate],
    access: &AccessContext,
    params: &RetrievalParams,
    now: DateTime<Utc>,
) -> Vec<ScoredChunk> {
    let lex_max = lexical
        .iter()
        .map(|c| c.raw_score)
        .fold(0.0f64, f64::max);

    let lex_scores: HashMap<&str, f64> = lexical
        .iter()
        .map(|c| {
            let norm = if lex_max > 0.0 {
                (c.raw_score / lex_max).clamp(0.0, 1.0)
            } else {
                0.0
            };
            (c.chunk_id.as_str(), norm)
        })
        .collect();
    let sem_scores: HashMap<&str, f64> = semantic
        .iter()
        .map(|c| (c.chunk_id.as_str(), c.raw_score.clamp(0.0, 1.0)))
        .collect();

    let mut union: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in lexical.iter().chain(semantic.iter()) {
        union.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let w = &params.weights;
    let mut scored: Vec<ScoredChunk> = union
        .into_values()
        .filter(|c| is_visible(&c.document, false, access))
        .map(|c| {
            let components = ScoreExplanation {
                semantic: sem_scores.get(c.chunk_id.as_str()).copied().unwrap_or(0.0),
                lexical: lex_scores.get(c.chunk_id.as_str()).copied().unwrap_or(0.0),
                recency: recency_boost(
                    c.document.last_reviewed_at,
                    now,
                    params.recency_half_life_days,
                ),
                core: if c.document.core { 1.0 } else { 0.0 },
            };
            let score = w.semantic * components.semantic
                + w.lexical * components.lexical
                + w.recency * components.recency
                + w.core * components.core;
            ScoredChunk {
                candidate: c.clone(),
                score,
                components,
            }
        })
        .collect();

    scored.sort_by(compare_ranked);
    scored
}

/// Ranking order: score desc, review date desc (never-reviewed last),
/// document id asc, chunk index asc.
fn compare_ranked(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| {
            match (
                a.candidate.document.last_reviewed_at,
                b.candidate.document.last_reviewed_at,
            ) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
        .then_with(|| a.candidate.document_id.cmp(&b.candidate.document_id))
        .then_with(|| a.candidate.chunk_index.cmp(&b.candidate.chunk_index))
}

/// Exponential decay by review age: `1.0` when reviewed now, `0.5` after one
/// half-life, `0.0` when never reviewed. Future review dates count as now.
pub fn recency_boost(
    last_reviewed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    let Some(reviewed) = last_reviewed_at else {
        return 0.0;
    };
    if half_life_days <= 0.0 {
        return 0.0;
    }
    let age_days = ((now - reviewed).num_seconds().max(0) as f64) / 86_400.0;
    0.5f64.powf(age_days / half_life_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentStatus;
    use crate::store::CandidateDocument;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn doc(core: bool, audience: &[&str]) -> CandidateDocument {
        CandidateDocument {
            title: "Doc".to_string(),
            path: vec!["Root".to_string()],
            core,
            audience: audience.iter().map(|s| s.to_string()).collect(),
            status: DocumentStatus::Indexed,
            last_reviewed_at: None,
        }
    }

    fn candidate(chunk_id: &str, doc_id: &str, score: f64, document: CandidateDocument) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            chunk_index: 0,
            raw_score: score,
            text: String::new(),
            document,
        }
    }

    #[test]
    fn test_access_context_permits() {
        let ctx = AccessContext::new(["partners"]);
        let partners: BTreeSet<String> = ["partners".to_string()].into();
        let staff: BTreeSet<String> = ["staff".to_string()].into();
        assert!(ctx.permits(false, &partners));
        assert!(!ctx.permits(false, &staff));
        assert!(ctx.permits(true, &staff));
        assert!(AccessContext::default().permits(true, &BTreeSet::new()));
    }

    #[test]
    fn test_enrollment_policy_ranking() {
        let core_doc = doc(true, &[]);
        let partner_doc = doc(false, &["partners"]);

        let lexical = vec![
            candidate("c-core", "core-doc", 0.50, core_doc.clone()),
            candidate("c-partner", "partner-doc", 0.90, partner_doc.clone()),
        ];
        let semantic = vec![
            candidate("c-core", "core-doc", 0.70, core_doc),
            candidate("c-partner", "partner-doc", 0.60, partner_doc),
        ];
        let access = AccessContext::new(["partners"]);

        let ranked = fuse(&lexical, &semantic, &access, &RetrievalParams::default(), now());
        assert_eq!(ranked.len(), 2);

        // core: 0.6·0.70 + 0.3·(0.50/0.90) + 0.05·1 = 0.6367
        // partner: 0.6·0.60 + 0.3·1.0 = 0.66
        assert_eq!(ranked[0].candidate.document_id, "partner-doc");
        assert!((ranked[0].score - 0.66).abs() < 1e-9);
        assert!((ranked[1].score - (0.42 + 0.3 * (0.5 / 0.9) + 0.05)).abs() < 1e-9);

        let again = fuse(&lexical, &semantic, &access, &RetrievalParams::default(), now());
        let order: Vec<&str> = again.iter().map(|s| s.candidate.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["c-partner", "c-core"]);
    }

    #[test]
    fn test_filter_drops_invisible_even_if_best() {
        let hidden = doc(false, &["staff"]);
        let visible = doc(false, &["partners"]);
        let semantic = vec![
            candidate("c-hidden", "hidden", 0.99, hidden),
            candidate("c-visible", "visible", 0.10, visible),
        ];
        let access = AccessContext::new(["partners"]);
        let ranked = fuse(&[], &semantic, &access, &RetrievalParams::default(), now());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].candidate.document_id, "visible");
    }

    #[test]
    fn test_filter_drops_errored_documents() {
        let mut errored = doc(true, &[]);
        errored.status = DocumentStatus::Error;
        let lexical = vec![candidate("c1", "d1", 3.0, errored)];
        let ranked = fuse(&lexical, &[], &AccessContext::default(), &RetrievalParams::default(), now());
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_negative_cosine_clamped() {
        let semantic = vec![candidate("c1", "d1", -0.8, doc(true, &[]))];
        let params = RetrievalParams {
            weights: RetrievalWeights {
                semantic: 1.0,
                lexical: 0.0,
                recency: 0.0,
                core: 0.0,
            },
            ..RetrievalParams::default()
        };
        let ranked = fuse(&[], &semantic, &AccessContext::default(), &params, now());
        assert_eq!(ranked[0].score, 0.0);
    }

    #[test]
    fn test_tie_break_prefers_recent_review_then_id() {
        let mut old = doc(true, &[]);
        old.last_reviewed_at = Some(now() - Duration::days(400));
        let mut recent = doc(true, &[]);
        recent.last_reviewed_at = Some(now() - Duration::days(1));
        let never = doc(true, &[]);

        let params = RetrievalParams {
            weights: RetrievalWeights {
                semantic: 0.0,
                lexical: 1.0,
                recency: 0.0,
                core: 0.0,
            },
            ..RetrievalParams::default()
        };
        let lexical = vec![
            candidate("c-never-b", "b", 1.0, never.clone()),
            candidate("c-old", "z", 1.0, old),
            candidate("c-never-a", "a", 1.0, never),
            candidate("c-recent", "y", 1.0, recent),
        ];
        let ranked = fuse(&lexical, &[], &AccessContext::default(), &params, now());
        let order: Vec<&str> = ranked.iter().map(|s| s.candidate.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["c-recent", "c-old", "c-never-a", "c-never-b"]);
    }

    #[test]
    fn test_recency_boost_half_life() {
        let half = recency_boost(Some(now() - Duration::days(180)), now(), 180.0);
        assert!((half - 0.5).abs() < 1e-9);
        assert_eq!(recency_boost(None, now(), 180.0), 0.0);
        assert!((recency_boost(Some(now() + Duration::days(3)), now(), 180.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_union_keeps_single_entry_per_chunk() {
        let d = doc(true, &[]);
        let lexical = vec![candidate("c1", "d1", 2.0, d.clone())];
        let semantic = vec![candidate("c1", "d1", 0.5, d)];
        let ranked = fuse(&lexical, &semantic, &AccessContext::default(), &RetrievalParams::default(), now());
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].components.lexical - 1.0).abs() < 1e-9);
        assert!((ranked[0].components.semantic - 0.5).abs() < 1e-9);
    }
}
