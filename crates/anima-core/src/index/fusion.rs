//! Reciprocal Rank Fusion with an overlap bonus.

use std::collections::HashMap;

/// RRF rank constant.
pub const RRF_K: f32 = 60.0;
/// Multiplier applied when a chunk appears in both sub-rankings.
pub const OVERLAP_BONUS: f32 = 1.2;

/// A chunk as seen by the fusion stage, stripped of per-ranking scores.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub source_filename: String,
}

#[derive(Debug, Clone)]
pub struct FusedHit {
    pub candidate: Candidate,
    pub score: f32,
    pub dense_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// Fuse two ordered result lists. For every chunk appearing in either,
/// `s(c) = 1/(60 + rank_d) + 1/(60 + rank_l)` with 1-based ranks and a
/// missing rank contributing zero; chunks present in both lists get a
/// `1.2x` bonus. Ties are broken by `document_id` lexicographic order,
/// then `ordinal` ascending, so results are deterministic.
pub fn reciprocal_rank_fusion(
    dense: Vec<Candidate>,
    lexical: Vec<Candidate>,
    k: usize,
) -> Vec<FusedHit> {
    struct Entry {
        candidate: Candidate,
        dense_rank: Option<usize>,
        lexical_rank: Option<usize>,
    }

    let mut entries: HashMap<String, Entry> = HashMap::new();

    for (i, candidate) in dense.into_iter().enumerate() {
        entries.insert(
            candidate.chunk_id.clone(),
            Entry {
                candidate,
                dense_rank: Some(i + 1),
                lexical_rank: None,
            },
        );
    }

    for (i, candidate) in lexical.into_iter().enumerate() {
        entries
            .entry(candidate.chunk_id.clone())
            .and_modify(|e| e.lexical_rank = Some(i + 1))
            .or_insert(Entry {
                candidate,
                dense_rank: None,
                lexical_rank: Some(i + 1),
            });
    }

    let mut fused: Vec<FusedHit> = entries
        .into_values()
        .map(|e| {
            let mut score = rrf_term(e.dense_rank) + rrf_term(e.lexical_rank);
            if e.dense_rank.is_some() && e.lexical_rank.is_some() {
                score *= OVERLAP_BONUS;
            }
            FusedHit {
                candidate: e.candidate,
                score,
                dense_rank: e.dense_rank,
                lexical_rank: e.lexical_rank,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.candidate.document_id.cmp(&b.candidate.document_id))
            .then_with(|| a.candidate.ordinal.cmp(&b.candidate.ordinal))
    });
    fused.truncate(k);
    fused
}

pub fn rrf_term(rank: Option<usize>) -> f32 {
    match rank {
        Some(r) => 1.0 / (RRF_K + r as f32),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(chunk_id: &str, document_id: &str, ordinal: u32) -> Candidate {
        Candidate {
            chunk_id: chunk_id.into(),
            document_id: document_id.into(),
            ordinal,
            text: format!("text of {}", chunk_id),
            source_filename: format!("{}.txt", document_id),
        }
    }

    #[test]
    fn overlap_strictly_beats_sum_of_terms() {
        let dense = vec![candidate("a:0", "a", 0), candidate("b:0", "b", 0)];
        let lexical = vec![candidate("a:0", "a", 0), candidate("c:0", "c", 0)];

        let fused = reciprocal_rank_fusion(dense, lexical, 10);
        let a = fused.iter().find(|h| h.candidate.chunk_id == "a:0").unwrap();

        let plain = rrf_term(a.dense_rank) + rrf_term(a.lexical_rank);
        assert!(a.score > plain);
        assert!((a.score - plain * OVERLAP_BONUS).abs() < 1e-9);
    }

    #[test]
    fn overlap_winner_ranks_first() {
        let dense = vec![candidate("b:0", "b", 0), candidate("a:0", "a", 0)];
        let lexical = vec![candidate("a:0", "a", 0)];

        let fused = reciprocal_rank_fusion(dense, lexical, 10);
        assert_eq!(fused[0].candidate.chunk_id, "a:0");
        assert_eq!(fused[0].dense_rank, Some(2));
        assert_eq!(fused[0].lexical_rank, Some(1));
        assert_eq!(fused[1].dense_rank, Some(1));
        assert_eq!(fused[1].lexical_rank, None);
    }

    #[test]
    fn ties_break_by_document_then_ordinal() {
        // Two single-list chunks at the same rank in different lists tie
        // on score; document_id then ordinal decides the order.
        let dense = vec![candidate("z:5", "z", 5)];
        let lexical = vec![candidate("a:3", "a", 3)];

        let fused = reciprocal_rank_fusion(dense, lexical, 10);
        assert_eq!(fused[0].candidate.chunk_id, "a:3");
        assert_eq!(fused[1].candidate.chunk_id, "z:5");

        let dense = vec![candidate("a:7", "a", 7)];
        let lexical = vec![candidate("a:3", "a", 3)];
        let fused = reciprocal_rank_fusion(dense, lexical, 10);
        assert_eq!(fused[0].candidate.chunk_id, "a:3");
    }

    #[test]
    fn fusion_is_deterministic_and_truncates() {
        let dense: Vec<_> = (0..10).map(|i| candidate(&format!("d:{}", i), "d", i)).collect();
        let lexical: Vec<_> = (0..10).map(|i| candidate(&format!("l:{}", i), "l", i)).collect();

        let run1 = reciprocal_rank_fusion(dense.clone(), lexical.clone(), 5);
        let run2 = reciprocal_rank_fusion(dense, lexical, 5);

        assert_eq!(run1.len(), 5);
        let ids1: Vec<_> = run1.iter().map(|h| h.candidate.chunk_id.clone()).collect();
        let ids2: Vec<_> = run2.iter().map(|h| h.candidate.chunk_id.clone()).collect();
        assert_eq!(ids1, ids2);
    }
}
