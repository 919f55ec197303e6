//! # Ranking Comparison Metrics
//!
//! Information-retrieval metrics used to compare the migration target's
//! ranking quality against the primary backend during shadow reads and
//! cutover evaluation:
//!
//! - **agreement@k**: order-independent overlap of the top-k result ids
//! - **nDCG@k**: rank-order similarity with the primary ranking as ground
//!   truth, graded relevance by inverse primary rank, log2 position discount
//!
//! Ids are deduplicated before scoring and every score is clamped to [0, 1].

use std::collections::HashMap;
use std::collections::HashSet;

fn unique_ids<'a>(ids: &'a [String]) -> Vec<&'a str> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Fraction of the primary's top-k ids also present in the candidate's top-k,
/// order-independent. Returns 0.0 when the primary list is empty.
pub fn agreement_at_k(primary_ids: &[String], candidate_ids: &[String], k: usize) -> f64 {
    let k = k.max(1);
    let truth: HashSet<&str> = unique_ids(primary_ids).into_iter().take(k).collect();
    if truth.is_empty() {
        return 0.0;
    }
    let hits = unique_ids(candidate_ids)
        .into_iter()
        .take(k)
        .filter(|id| truth.contains(id))
        .count();
    clamp_unit(hits as f64 / truth.len() as f64)
}

/// nDCG@k of the candidate ranking against the primary ranking.
///
/// The primary list defines graded relevance: the document at primary rank
/// `r` (0-based) has relevance `1/(r+1)`; documents absent from the primary
/// list have relevance 0. DCG applies the standard `log2(position + 2)`
/// discount over the candidate's top-k; IDCG places the highest grades first.
/// Returns 0.0 when either list is empty.
pub fn ndcg_at_k(primary_ids: &[String], candidate_ids: &[String], k: usize) -> f64 {
    let k = k.max(1);
    let primary = unique_ids(primary_ids);
    if primary.is_empty() {
        return 0.0;
    }
    let relevance: HashMap<&str, f64> = primary
        .iter()
        .enumerate()
        .map(|(rank, id)| (*id, 1.0 / (rank as f64 + 1.0)))
        .collect();

    let candidate = unique_ids(candidate_ids);
    if candidate.is_empty() {
        return 0.0;
    }

    let dcg: f64 = candidate
        .iter()
        .take(k)
        .enumerate()
        .map(|(position, id)| {
            let grade = relevance.get(id).copied().unwrap_or(0.0);
            grade / (position as f64 + 2.0).log2()
        })
        .sum();

    // Ideal ordering: highest grades first.
    let mut grades: Vec<f64> = relevance.values().copied().collect();
    grades.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let idcg: f64 = grades
        .iter()
        .take(k)
        .enumerate()
        .map(|(position, grade)| grade / (position as f64 + 2.0).log2())
        .sum();

    if idcg <= 0.0 {
        return 0.0;
    }
    clamp_unit(dcg / idcg)
}

/// Aggregate scores over a cutover truth set.
#[derive(Debug, Clone, PartialEq)]
pub struct CutoverScores {
    pub agreement_at_5: f64,
    pub ndcg_at_10: f64,
    pub total: usize,
}

/// One evaluated query: the primary's ids as truth plus the candidate ids.
#[derive(Debug, Clone)]
pub struct TruthEntry {
    pub query: String,
    pub truth_ids: Vec<String>,
    pub candidate_ids: Vec<String>,
}

/// Mean agreement@5 and nDCG@10 over a truth set. Entries with an empty
/// query are skipped; an empty set scores zero.
pub fn evaluate_truth_set(entries: &[TruthEntry]) -> CutoverScores {
    let mut agreement_sum = 0.0;
    let mut ndcg_sum = 0.0;
    let mut total = 0usize;
    for entry in entries {
        if entry.query.trim().is_empty() {
            continue;
        }
        agreement_sum += agreement_at_k(&entry.truth_ids, &entry.candidate_ids, 5);
        ndcg_sum += ndcg_at_k(&entry.truth_ids, &entry.candidate_ids, 10);
        total += 1;
    }
    if total == 0 {
        return CutoverScores {
            agreement_at_5: 0.0,
            ndcg_at_10: 0.0,
            total: 0,
        };
    }
    CutoverScores {
        agreement_at_5: agreement_sum / total as f64,
        ndcg_at_10: ndcg_sum / total as f64,
        total,
    }
}
