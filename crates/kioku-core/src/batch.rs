//! Daily consolidation batch
//!
//! One guarded invocation per day, nine phases in a fixed order, each phase
//! a single store transaction. Provider calls are staged before the write so
//! a timeout skips one record without mutating state. The order is load-
//! bearing: revival must follow threshold compression, ratio enforcement
//! must follow revival, relation maintenance sees the settled tier layout.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Local};
use rusqlite::params;

use crate::config::{Config, DeleteConditionMode};
use crate::embeddings::EmbeddingProvider;
use crate::memory::{
    MemoryRecord, LEVEL_ARCHIVE, LEVEL_FULL, LEVEL_KEYWORDS, LEVEL_SUMMARY,
};
use crate::providers::{AnalysisProvider, ProviderError};
use crate::recall;
use crate::relations;
use crate::retention::{level_for_score, rescore};
use crate::store::{MemoryPatch, MemoryStore, Result, STATE_LAST_COMPRESSION_RUN};

/// Reason the batch did not run
pub const SKIP_INTERVAL_NOT_ELAPSED: &str = "interval_not_elapsed";

/// Per-phase counters of one batch invocation
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub executed: bool,
    pub skipped_reason: Option<String>,
    pub recalled_processed: usize,
    pub days_updated: usize,
    pub scores_updated: usize,
    pub l1_to_l2: usize,
    pub l2_to_l3: usize,
    pub l3_to_l4: usize,
    pub revived: usize,
    pub l1_forced: usize,
    pub l2_forced: usize,
    pub l3_forced: usize,
    pub relations_new: usize,
    pub relations_updated: usize,
    pub deleted: usize,
}

/// A staged tier transition, providers already consulted
struct TransitionPlan {
    id: String,
    new_level: i32,
    new_trigger: Option<String>,
    new_content: Option<String>,
    new_embedding: Option<Vec<f32>>,
    archived_at: Option<DateTime<FixedOffset>>,
    stepped_1_to_2: bool,
    stepped_2_to_3: bool,
    stepped_3_to_4: bool,
}

/// The daily batch engine
pub struct CompressionBatch<'a> {
    store: &'a MemoryStore,
    analysis: &'a dyn AnalysisProvider,
    embedder: &'a dyn EmbeddingProvider,
    config: &'a Config,
}

impl<'a> CompressionBatch<'a> {
    pub fn new(
        store: &'a MemoryStore,
        analysis: &'a dyn AnalysisProvider,
        embedder: &'a dyn EmbeddingProvider,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            analysis,
            embedder,
            config,
        }
    }

    /// Run the batch now
    pub fn run(&self, force: bool) -> Result<BatchReport> {
        self.run_at(force, Local::now().fixed_offset())
    }

    /// Run the batch at an explicit clock (tests use this)
    pub fn run_at(&self, force: bool, now: DateTime<FixedOffset>) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        let previous_run = self
            .store
            .get_state(STATE_LAST_COMPRESSION_RUN)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok());

        if !force {
            if let Some(last) = previous_run {
                let elapsed = now.signed_duration_since(last);
                if elapsed < chrono::Duration::hours(self.config.compression.interval_hours) {
                    report.skipped_reason = Some(SKIP_INTERVAL_NOT_ELAPSED.to_string());
                    return Ok(report);
                }
            }
        }

        report.executed = true;
        let mut reembedded: HashSet<String> = HashSet::new();

        self.phase_recall_and_aging(&mut report)?;
        self.phase_rescore(&mut report)?;
        self.phase_threshold_compression(&mut report, &mut reembedded, now)?;
        self.phase_revival(&mut report, now)?;
        self.phase_ratio_enforcement(&mut report, &mut reembedded, now)?;
        self.phase_relations(&mut report, &reembedded, previous_run)?;
        self.phase_archive_pruning(&mut report, now)?;

        self.store
            .set_state(STATE_LAST_COMPRESSION_RUN, &now.to_rfc3339())?;

        tracing::info!(
            "batch complete: {} recalled, {} aged, {}/{}/{} compressed, {} revived, {} deleted",
            report.recalled_processed,
            report.days_updated,
            report.l1_to_l2,
            report.l2_to_l3,
            report.l3_to_l4,
            report.revived,
            report.deleted,
        );
        Ok(report)
    }

    /// P1/P2: age the non-recalled set, reinforce the recalled set.
    /// The two sets are disjoint; aging filters on the flag so a reinforced
    /// record is not also aged.
    fn phase_recall_and_aging(&self, report: &mut BatchReport) -> Result<()> {
        let reinforcements: Vec<(String, recall::Reinforcement)> = self
            .store
            .get_active()?
            .iter()
            .filter(|r| r.recalled_since_last_batch)
            .map(|r| {
                (
                    r.id.clone(),
                    recall::reinforce(r, &self.config.recall, &self.config.retention),
                )
            })
            .collect();

        let aged = self.store.transaction(|tx| {
            let aged = tx.execute(
                "UPDATE memories SET memory_days = memory_days + 1.0
                 WHERE recalled_since_last_batch = 0 AND archived_at IS NULL",
                [],
            )?;
            for (id, update) in &reinforcements {
                let mut patch = MemoryPatch::new();
                patch.memory_days = Some(update.memory_days);
                patch.decay_coefficient = Some(update.decay_coefficient);
                patch.recall_count = Some(update.recall_count);
                patch.recalled_since_last_batch = Some(false);
                MemoryStore::apply_patch(tx, id, &patch)?;
            }
            Ok(aged)
        })?;

        report.days_updated = aged;
        report.recalled_processed = reinforcements.len();
        Ok(())
    }

    /// P3: recompute retention scores for every non-archived record
    fn phase_rescore(&self, report: &mut BatchReport) -> Result<()> {
        let actives = self.store.get_active()?;
        let updates: Vec<(String, f64)> = actives
            .iter()
            .map(|record| (record.id.clone(), rescore(record)))
            .collect();

        let count = updates.len();
        self.store.transaction(|tx| {
            for (id, score) in &updates {
                tx.execute(
                    "UPDATE memories SET retention_score = ?1 WHERE id = ?2",
                    params![score, id],
                )?;
            }
            Ok(())
        })?;

        report.scores_updated = count;
        Ok(())
    }

    /// Stage the provider work for one record dropping to `target_level`.
    /// Transitions run stepwise so a two-level drop passes through both
    /// rewrites before archiving.
    fn plan_transition(
        &self,
        record: &MemoryRecord,
        target_level: i32,
        now: DateTime<FixedOffset>,
    ) -> std::result::Result<TransitionPlan, ProviderError> {
        let mut plan = TransitionPlan {
            id: record.id.clone(),
            new_level: record.current_level,
            new_trigger: None,
            new_content: None,
            new_embedding: None,
            archived_at: None,
            stepped_1_to_2: false,
            stepped_2_to_3: false,
            stepped_3_to_4: false,
        };

        let mut trigger = record.trigger.clone();
        let mut content = record.content.clone();
        let mut text_changed = false;

        while plan.new_level < target_level {
            match plan.new_level {
                LEVEL_FULL => {
                    let rewrite = self.analysis.summarize(&trigger, &content)?;
                    trigger = rewrite.trigger;
                    content = rewrite.content;
                    text_changed = true;
                    plan.stepped_1_to_2 = true;
                    plan.new_level = LEVEL_SUMMARY;
                }
                LEVEL_SUMMARY => {
                    let rewrite = self.analysis.keywordize(&trigger, &content)?;
                    trigger = rewrite.trigger;
                    content = rewrite.content;
                    text_changed = true;
                    plan.stepped_2_to_3 = true;
                    plan.new_level = LEVEL_KEYWORDS;
                }
                _ => {
                    plan.archived_at = Some(now);
                    plan.stepped_3_to_4 = true;
                    plan.new_level = LEVEL_ARCHIVE;
                }
            }
        }

        if text_changed {
            plan.new_trigger = Some(trigger.clone());
            plan.new_content = Some(content.clone());
            let embedding = self
                .embedder
                .embed(&format!("{trigger} {content}"))
                .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
            plan.new_embedding = Some(embedding.vector);
        }

        Ok(plan)
    }

    fn patch_for(plan: &TransitionPlan) -> MemoryPatch {
        let mut patch = MemoryPatch::new();
        patch.current_level = Some(plan.new_level);
        patch.trigger = plan.new_trigger.clone();
        patch.content = plan.new_content.clone();
        if let Some(vector) = &plan.new_embedding {
            patch.embedding = Some(Some(vector.clone()));
        }
        if let Some(ts) = plan.archived_at {
            patch.archived_at = Some(Some(ts));
        }
        patch
    }

    fn count_plan(plan: &TransitionPlan, report: &mut BatchReport, forced: bool) {
        if forced {
            // Forced demotions are single-step by construction
            if plan.stepped_1_to_2 {
                report.l1_forced += 1;
            } else if plan.stepped_2_to_3 {
                report.l2_forced += 1;
            } else if plan.stepped_3_to_4 {
                report.l3_forced += 1;
            }
        } else {
            if plan.stepped_1_to_2 {
                report.l1_to_l2 += 1;
            }
            if plan.stepped_2_to_3 {
                report.l2_to_l3 += 1;
            }
            if plan.stepped_3_to_4 {
                report.l3_to_l4 += 1;
            }
        }
    }

    /// P4: demote every non-protected active record whose natural level
    /// dropped below its stored one. A provider failure leaves the record at
    /// its prior level; it retries next batch.
    fn phase_threshold_compression(
        &self,
        report: &mut BatchReport,
        reembedded: &mut HashSet<String>,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let actives = self.store.get_active()?;
        let mut plans = Vec::new();

        for record in &actives {
            if record.protected {
                continue;
            }
            let natural = level_for_score(record.retention_score, &self.config.levels);
            if natural <= record.current_level {
                continue;
            }
            match self.plan_transition(record, natural, now) {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    tracing::warn!("compression of {} skipped: {e}", record.id);
                }
            }
        }

        self.store.transaction(|tx| {
            for plan in &plans {
                MemoryStore::apply_patch(tx, &plan.id, &Self::patch_for(plan))?;
            }
            Ok(())
        })?;

        for plan in &plans {
            Self::count_plan(plan, report, false);
            if plan.new_embedding.is_some() {
                reembedded.insert(plan.id.clone());
            }
        }
        Ok(())
    }

    /// P5: revive requested archive records while the projected L3 share
    /// stays at or below its target ratio. Candidates queue in request order.
    fn phase_revival(&self, report: &mut BatchReport, now: DateTime<FixedOffset>) -> Result<()> {
        let mut candidates: Vec<MemoryRecord> = self
            .store
            .get_archived()?
            .into_iter()
            .filter(|r| r.revival_requested)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        candidates.sort_by(|a, b| a.revival_requested_at.cmp(&b.revival_requested_at));

        let actives = self.store.get_active()?;
        let mut nonprotected_active = actives.iter().filter(|r| !r.protected).count() as f64;
        let mut l3_count = actives
            .iter()
            .filter(|r| !r.protected && r.current_level == LEVEL_KEYWORDS)
            .count() as f64;

        let ratio_limit = self.config.levels.target_ratios.level3;
        let min_score = self.config.levels.level3_threshold + self.config.archive.revival_min_margin;

        enum Outcome {
            Revive { id: String, score: f64 },
            Drop { id: String },
        }
        let mut outcomes = Vec::new();

        for record in &candidates {
            let projected = (l3_count + 1.0) / (nonprotected_active + 1.0);
            if projected <= ratio_limit {
                let archived_days = record
                    .archived_at
                    .map(|ts| now.signed_duration_since(ts).num_days())
                    .unwrap_or(0)
                    .max(0);
                let decayed = f64::from(record.emotional_intensity)
                    * self
                        .config
                        .archive
                        .revival_decay_per_day
                        .powi(archived_days as i32);
                outcomes.push(Outcome::Revive {
                    id: record.id.clone(),
                    score: decayed.max(min_score),
                });
                l3_count += 1.0;
                if !record.protected {
                    nonprotected_active += 1.0;
                }
            } else {
                outcomes.push(Outcome::Drop {
                    id: record.id.clone(),
                });
            }
        }

        let mut revived = 0;
        self.store.transaction(|tx| {
            for outcome in &outcomes {
                match outcome {
                    Outcome::Revive { id, score } => {
                        let mut patch = MemoryPatch::new();
                        patch.archived_at = Some(None);
                        patch.current_level = Some(LEVEL_KEYWORDS);
                        patch.retention_score = Some(*score);
                        patch.revival_requested = Some(false);
                        patch.revival_requested_at = Some(None);
                        patch.recalled_since_last_batch = Some(true);
                        MemoryStore::apply_patch(tx, id, &patch)?;
                        tx.execute(
                            "UPDATE memories SET recall_count = recall_count + 1 WHERE id = ?1",
                            params![id],
                        )?;
                        revived += 1;
                    }
                    Outcome::Drop { id } => {
                        let mut patch = MemoryPatch::new();
                        patch.revival_requested = Some(false);
                        MemoryStore::apply_patch(tx, id, &patch)?;
                    }
                }
            }
            Ok(())
        })?;

        report.revived = revived;
        Ok(())
    }

    /// P6: enforce the tier quotas against the non-protected active count,
    /// top tier first. Demotions feed the next tier, so populations are
    /// recomputed after each level.
    fn phase_ratio_enforcement(
        &self,
        report: &mut BatchReport,
        reembedded: &mut HashSet<String>,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let mut working: Vec<MemoryRecord> = self
            .store
            .get_active()?
            .into_iter()
            .filter(|r| !r.protected)
            .collect();
        let population = working.len() as f64;
        if working.is_empty() {
            return Ok(());
        }

        let ratios = self.config.levels.target_ratios;
        let quotas = [
            (LEVEL_FULL, ratios.level1),
            (LEVEL_SUMMARY, ratios.level2),
            (LEVEL_KEYWORDS, ratios.level3),
        ];

        let mut plans = Vec::new();

        for (level, ratio) in quotas {
            let target = (ratio * population).ceil() as usize;
            let mut members: Vec<&MemoryRecord> = working
                .iter()
                .filter(|r| r.current_level == level && !r.is_archived())
                .collect();
            if members.len() <= target {
                continue;
            }

            members.sort_by(|a, b| {
                a.retention_score
                    .partial_cmp(&b.retention_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.created.cmp(&b.created))
                    .then_with(|| a.recall_count.cmp(&b.recall_count))
            });

            let excess = members.len() - target;
            let demote_ids: Vec<String> =
                members.iter().take(excess).map(|r| r.id.clone()).collect();

            for id in demote_ids {
                let record = working
                    .iter()
                    .find(|r| r.id == id)
                    .expect("demotion candidate came from the working set")
                    .clone();
                match self.plan_transition(&record, level + 1, now) {
                    Ok(plan) => {
                        // Reflect the demotion so the next tier's population
                        // includes it
                        if let Some(entry) = working.iter_mut().find(|r| r.id == plan.id) {
                            entry.current_level = plan.new_level;
                            entry.archived_at = plan.archived_at;
                        }
                        plans.push(plan);
                    }
                    Err(e) => {
                        tracing::warn!("forced demotion of {} skipped: {e}", record.id);
                    }
                }
            }
        }

        self.store.transaction(|tx| {
            for plan in &plans {
                MemoryStore::apply_patch(tx, &plan.id, &Self::patch_for(plan))?;
            }
            Ok(())
        })?;

        for plan in &plans {
            Self::count_plan(plan, report, true);
            if plan.new_embedding.is_some() {
                reembedded.insert(plan.id.clone());
            }
        }
        Ok(())
    }

    /// P7: relation integrity, direction re-evaluation, auto-linking
    fn phase_relations(
        &self,
        report: &mut BatchReport,
        reembedded: &HashSet<String>,
        previous_run: Option<DateTime<FixedOffset>>,
    ) -> Result<()> {
        let mut records = self.store.get_all()?;

        let (dirty_integrity, dropped) = relations::check_integrity(&mut records);
        let (dirty_directions, flipped) =
            relations::reevaluate_directions(&mut records, &self.config.relations);

        // N: inserted since the previous batch, plus re-embedded this batch
        let mut new_ids: HashSet<String> = records
            .iter()
            .filter(|r| !r.is_archived())
            .filter(|r| match previous_run {
                Some(last) => r.created > last,
                None => true,
            })
            .map(|r| r.id.clone())
            .collect();
        new_ids.extend(reembedded.iter().cloned());

        let (dirty_links, created) =
            relations::auto_link(&mut records, &new_ids, &self.config.relations);

        let mut dirty = dirty_integrity;
        dirty.extend(dirty_directions);
        dirty.extend(dirty_links);

        let changed: Vec<(String, Vec<crate::memory::Relation>)> = records
            .iter()
            .filter(|r| dirty.contains(&r.id))
            .map(|r| (r.id.clone(), r.relations.clone()))
            .collect();

        self.store.transaction(|tx| {
            for (id, rels) in &changed {
                let mut patch = MemoryPatch::new();
                patch.relations = Some(rels.clone());
                MemoryStore::apply_patch(tx, id, &patch)?;
            }
            Ok(())
        })?;

        report.relations_updated = dropped + flipped;
        report.relations_new = created;
        Ok(())
    }

    /// P8: delete archived records matching the configured condition set
    fn phase_archive_pruning(
        &self,
        report: &mut BatchReport,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let archive = &self.config.archive;
        if !archive.auto_delete_enabled {
            return Ok(());
        }

        let mut doomed = Vec::new();
        for record in self.store.get_archived()? {
            if record.protected {
                continue;
            }
            let Some(archived_at) = record.archived_at else {
                continue;
            };

            let mut conditions = vec![
                now.signed_duration_since(archived_at).num_days() > archive.retention_days,
            ];
            if archive.delete_require_zero_recall {
                conditions.push(record.recall_count == 0);
            }
            conditions.push(record.emotional_intensity < archive.delete_max_intensity);

            let should_delete = match archive.delete_condition_mode {
                DeleteConditionMode::And => conditions.iter().all(|c| *c),
                DeleteConditionMode::Or => conditions.iter().any(|c| *c),
            };
            if should_delete {
                doomed.push(record.id);
            }
        }

        let deleted = doomed.len();
        self.store.transaction(|tx| {
            for id in &doomed {
                tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
            }
            Ok(())
        })?;

        report.deleted = deleted;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
