//! Relation maintenance
//!
//! Memories link to each other with typed, directed edges. Direction always
//! runs from the higher-retention endpoint to the lower one (within the
//! score proximity threshold), which keeps the relation graph acyclic.
//!
//! Three passes, run by the daily batch in this order:
//! 1. Integrity: drop edges whose target is missing or archived
//! 2. Direction: flip edges whose endpoints' scores inverted
//! 3. Auto-link: connect new or re-embedded records to similar actives

use std::collections::{HashMap, HashSet};

use crate::config::RelationsConfig;
use crate::embeddings::l2_normalize;
use crate::memory::{MemoryRecord, Relation, RelationType};

/// Drop edges whose target no longer exists or is archived. Operates on the
/// full record set (archived records keep no dangling edges either).
/// Returns the ids whose relation lists changed and the number of edges
/// dropped.
pub fn check_integrity(records: &mut [MemoryRecord]) -> (HashSet<String>, usize) {
    let live_targets: HashSet<String> = records
        .iter()
        .filter(|r| !r.is_archived())
        .map(|r| r.id.clone())
        .collect();

    let mut dirty = HashSet::new();
    let mut dropped = 0;

    for record in records.iter_mut() {
        let before = record.relations.len();
        record.relations.retain(|rel| live_targets.contains(&rel.id));
        if record.relations.len() != before {
            dropped += before - record.relations.len();
            dirty.insert(record.id.clone());
        }
    }

    (dirty, dropped)
}

/// Flip edges whose target now outranks the source by more than the score
/// proximity threshold. The type is preserved. A flip onto a target whose
/// relation list is full drops the edge.
///
/// Only active sources are re-evaluated; archived records' outgoing edges
/// stay frozen with the rest of their state.
pub fn reevaluate_directions(
    records: &mut [MemoryRecord],
    config: &RelationsConfig,
) -> (HashSet<String>, usize) {
    let index: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.clone(), i))
        .collect();

    // Collect inversions first; mutate after
    let mut flips: Vec<(usize, usize, Relation)> = Vec::new();
    for (source_idx, record) in records.iter().enumerate() {
        if record.is_archived() {
            continue;
        }
        for rel in &record.relations {
            let Some(&target_idx) = index.get(&rel.id) else {
                continue;
            };
            let target = &records[target_idx];
            if target.retention_score - record.retention_score
                > config.score_proximity_threshold
            {
                flips.push((source_idx, target_idx, rel.clone()));
            }
        }
    }

    let mut dirty = HashSet::new();
    let mut flipped = 0;

    for (source_idx, target_idx, rel) in flips {
        let source_id = records[source_idx].id.clone();
        records[source_idx].relations.retain(|r| r != &rel);
        dirty.insert(source_id.clone());
        flipped += 1;

        let target = &mut records[target_idx];
        if !target.has_relation_to(&source_id)
            && target.relations.len() < config.max_relations_per_memory
        {
            target.relations.push(Relation::new(source_id, rel.kind));
            dirty.insert(target.id.clone());
        }
    }

    (dirty, flipped)
}

/// Auto-link each record in `new_ids` against every active embedded record.
/// Pairs at or above the similarity threshold gain a `same_topic` edge from
/// the higher-score endpoint to the lower one. The fan-out cap is enforced
/// by evicting the edges with the lowest target scores.
pub fn auto_link(
    records: &mut [MemoryRecord],
    new_ids: &HashSet<String>,
    config: &RelationsConfig,
) -> (HashSet<String>, usize) {
    if !config.enable_auto_linking || new_ids.is_empty() {
        return (HashSet::new(), 0);
    }

    // L2-normalized rows make the pairwise cosine a plain dot product
    let candidates: Vec<(usize, Vec<f32>)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_archived())
        .filter_map(|(i, r)| {
            r.embedding.as_ref().map(|v| {
                let mut row = v.clone();
                l2_normalize(&mut row);
                (i, row)
            })
        })
        .collect();

    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for &(new_idx, ref new_row) in candidates
        .iter()
        .filter(|(i, _)| new_ids.contains(&records[*i].id))
    {
        for &(other_idx, ref other_row) in &candidates {
            if other_idx == new_idx || new_row.len() != other_row.len() {
                continue;
            }
            let similarity: f32 = new_row
                .iter()
                .zip(other_row.iter())
                .map(|(a, b)| a * b)
                .sum();
            if f64::from(similarity) >= config.auto_link_similarity_threshold {
                pairs.push((new_idx, other_idx));
            }
        }
    }

    let scores: HashMap<String, f64> = records
        .iter()
        .map(|r| (r.id.clone(), r.retention_score))
        .collect();

    let mut dirty = HashSet::new();
    let mut created = 0;

    for (a_idx, b_idx) in pairs {
        // Higher score points at lower score
        let (source_idx, target_idx) =
            if records[a_idx].retention_score >= records[b_idx].retention_score {
                (a_idx, b_idx)
            } else {
                (b_idx, a_idx)
            };

        let target_id = records[target_idx].id.clone();
        let source_id = records[source_idx].id.clone();
        if records[source_idx].has_relation_to(&target_id)
            || records[target_idx].has_relation_to(&source_id)
        {
            continue;
        }

        let source = &mut records[source_idx];
        source
            .relations
            .push(Relation::new(target_id, RelationType::SameTopic));
        while source.relations.len() > config.max_relations_per_memory {
            let lowest = source
                .relations
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let score_a = scores.get(&a.id).copied().unwrap_or(0.0);
                    let score_b = scores.get(&b.id).copied().unwrap_or(0.0);
                    score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            match lowest {
                Some(i) => {
                    source.relations.remove(i);
                }
                None => break,
            }
        }
        dirty.insert(source_id);
        created += 1;
    }

    (dirty, created)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::record_fixture;

    fn linked(id: &str, score: f64, relations: Vec<Relation>) -> MemoryRecord {
        let mut record = record_fixture(id);
        record.retention_score = score;
        record.relations = relations;
        record
    }

    #[test]
    fn test_integrity_drops_missing_and_archived_targets() {
        let mut archived = record_fixture("mem_20260101_003");
        archived.archived_at = Some(archived.created);
        archived.current_level = 4;

        let mut records = vec![
            linked(
                "mem_20260101_001",
                60.0,
                vec![
                    Relation::new("mem_20260101_002", RelationType::References),
                    Relation::new("mem_20260101_003", RelationType::Continues),
                    Relation::new("mem_19990101_001", RelationType::SameTopic),
                ],
            ),
            linked("mem_20260101_002", 50.0, vec![]),
            archived,
        ];

        let (dirty, dropped) = check_integrity(&mut records);
        assert_eq!(dropped, 2);
        assert!(dirty.contains("mem_20260101_001"));
        assert_eq!(records[0].relations.len(), 1);
        assert_eq!(records[0].relations[0].id, "mem_20260101_002");
    }

    #[test]
    fn test_direction_flip_preserves_type() {
        let config = Config::default().relations;
        // S6: A→B with scores (40, 55); B − A = 15 > 5 → flip to B→A
        let mut records = vec![
            linked(
                "mem_20260101_001",
                40.0,
                vec![Relation::new("mem_20260101_002", RelationType::DerivedFrom)],
            ),
            linked("mem_20260101_002", 55.0, vec![]),
        ];

        let (dirty, flipped) = reevaluate_directions(&mut records, &config);
        assert_eq!(flipped, 1);
        assert!(dirty.contains("mem_20260101_001"));
        assert!(dirty.contains("mem_20260101_002"));

        assert!(records[0].relations.is_empty());
        assert_eq!(
            records[1].relations,
            vec![Relation::new("mem_20260101_001", RelationType::DerivedFrom)]
        );
    }

    #[test]
    fn test_direction_within_threshold_untouched() {
        let config = Config::default().relations;
        // B − A = 4 <= 5: stays
        let mut records = vec![
            linked(
                "mem_20260101_001",
                51.0,
                vec![Relation::new("mem_20260101_002", RelationType::References)],
            ),
            linked("mem_20260101_002", 55.0, vec![]),
        ];

        let (_, flipped) = reevaluate_directions(&mut records, &config);
        assert_eq!(flipped, 0);
        assert_eq!(records[0].relations.len(), 1);
    }

    #[test]
    fn test_direction_flip_at_capacity_drops_edge() {
        let mut config = Config::default().relations;
        config.max_relations_per_memory = 1;

        let mut records = vec![
            linked(
                "mem_20260101_001",
                10.0,
                vec![Relation::new("mem_20260101_002", RelationType::References)],
            ),
            linked(
                "mem_20260101_002",
                55.0,
                vec![Relation::new("mem_20260101_003", RelationType::Continues)],
            ),
            linked("mem_20260101_003", 50.0, vec![]),
        ];

        let (_, flipped) = reevaluate_directions(&mut records, &config);
        assert_eq!(flipped, 1);
        assert!(records[0].relations.is_empty());
        // Target was full: the flipped edge is gone
        assert_eq!(records[1].relations.len(), 1);
        assert_eq!(records[1].relations[0].id, "mem_20260101_003");
    }

    #[test]
    fn test_auto_link_same_topic_from_higher_score() {
        let config = Config::default().relations;
        let mut a = linked("mem_20260101_001", 30.0, vec![]);
        a.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut b = linked("mem_20260101_002", 60.0, vec![]);
        b.embedding = Some(vec![1.0, 0.05, 0.0]);
        let mut records = vec![a, b];

        let new_ids: HashSet<String> = ["mem_20260101_001".to_string()].into();
        let (dirty, created) = auto_link(&mut records, &new_ids, &config);

        assert_eq!(created, 1);
        assert!(dirty.contains("mem_20260101_002"));
        // Higher score (B) points at lower score (A)
        assert!(records[0].relations.is_empty());
        assert_eq!(
            records[1].relations,
            vec![Relation::new("mem_20260101_001", RelationType::SameTopic)]
        );
    }

    #[test]
    fn test_auto_link_ignores_dissimilar_and_archived() {
        let config = Config::default().relations;
        let mut a = linked("mem_20260101_001", 30.0, vec![]);
        a.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut b = linked("mem_20260101_002", 60.0, vec![]);
        b.embedding = Some(vec![0.0, 1.0, 0.0]); // orthogonal
        let mut c = linked("mem_20260101_003", 60.0, vec![]);
        c.embedding = Some(vec![1.0, 0.0, 0.0]); // similar but archived
        c.archived_at = Some(c.created);
        c.current_level = 4;
        let mut records = vec![a, b, c];

        let new_ids: HashSet<String> = ["mem_20260101_001".to_string()].into();
        let (_, created) = auto_link(&mut records, &new_ids, &config);
        assert_eq!(created, 0);
    }

    #[test]
    fn test_auto_link_does_not_duplicate_existing_edge() {
        let config = Config::default().relations;
        let mut a = linked("mem_20260101_001", 30.0, vec![]);
        a.embedding = Some(vec![1.0, 0.0]);
        let mut b = linked(
            "mem_20260101_002",
            60.0,
            vec![Relation::new("mem_20260101_001", RelationType::Continues)],
        );
        b.embedding = Some(vec![1.0, 0.0]);
        let mut records = vec![a, b];

        let new_ids: HashSet<String> = ["mem_20260101_001".to_string()].into();
        let (_, created) = auto_link(&mut records, &new_ids, &config);
        assert_eq!(created, 0);
        assert_eq!(records[1].relations.len(), 1);
    }

    #[test]
    fn test_auto_link_fan_out_cap_evicts_lowest_target() {
        let mut config = Config::default().relations;
        config.max_relations_per_memory = 2;

        let mut source = linked(
            "mem_20260101_001",
            90.0,
            vec![
                Relation::new("mem_20260101_002", RelationType::References), // score 5
                Relation::new("mem_20260101_003", RelationType::References), // score 40
            ],
        );
        source.embedding = Some(vec![1.0, 0.0]);
        let low = linked("mem_20260101_002", 5.0, vec![]);
        let mid = linked("mem_20260101_003", 40.0, vec![]);
        let mut similar = linked("mem_20260101_004", 50.0, vec![]);
        similar.embedding = Some(vec![1.0, 0.0]);
        let mut records = vec![source, low, mid, similar];

        let new_ids: HashSet<String> = ["mem_20260101_004".to_string()].into();
        let (_, created) = auto_link(&mut records, &new_ids, &config);
        assert_eq!(created, 1);

        // The lowest-score target (mem_..._002) was evicted to make room
        let ids: Vec<&str> = records[0].relations.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(records[0].relations.len(), 2);
        assert!(ids.contains(&"mem_20260101_003"));
        assert!(ids.contains(&"mem_20260101_004"));
    }
}
