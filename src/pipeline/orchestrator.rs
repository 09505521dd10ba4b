//! Orchestrator: drives items through dispatch, judging, classification
//! and persistence.
//!
//! Pipeline flow:
//! QAItem → ResponderPool → (error partition | JudgeService → Classifier → tier partition)
//!
//! Epistemic foundation:
//! - K_i: Every input item ends classified, errored, resumed, or interrupted
//! - K_i: Items with a failed candidate are never judged
//! - B_i: A flush may fail → batch retained, failure counted, run continues
//! - I^B: Shutdown may arrive at any time → stop scheduling, finish in-flight work

use crate::models::{CandidateResult, FinalizedItem, QAItem, Result, RunReport, Tier};
use crate::pipeline::{PipelineContext, classify};
use crate::pool::{JudgeService, ResponderPool};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Terminal state of one item within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Classified { tier: Tier, promoted: bool },
    Errored,
    /// Abandoned on shutdown; not persisted, picked up again on resume
    Interrupted,
}

/// What an item task reports back to the scheduler.
struct Processed {
    id: String,
    outcome: ItemOutcome,
    /// The flush triggered by this item failed
    persist_failed: bool,
}

/// An item queued for processing, with results to reuse.
struct WorkItem {
    item: QAItem,
    known: BTreeMap<String, CandidateResult>,
    from_error: bool,
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
            .expect("valid progress template")
            .progress_chars("##-"),
    );
    pb
}

/// Runs items through the two-level worker pools.
pub struct Orchestrator {
    responders: Arc<ResponderPool>,
    judge: Arc<JudgeService>,
    ctx: PipelineContext,
}

impl Orchestrator {
    pub fn new(responders: ResponderPool, judge: JudgeService, ctx: PipelineContext) -> Self {
        Self {
            responders: Arc::new(responders),
            judge: Arc::new(judge),
            ctx,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Process normalized items.
    ///
    /// When resuming, classified items are skipped and items in the error
    /// partition re-ask only their failed candidates. Without resume, items
    /// already classified in this directory are reported but never re-run:
    /// their tier entry is final, so re-evaluation needs a fresh directory.
    pub async fn run(&self, items: Vec<QAItem>) -> RunReport {
        let mut report = RunReport {
            total_items: items.len(),
            ..Default::default()
        };
        let resume = self.ctx.settings.resume;
        let mut stored_errors: Option<HashMap<String, FinalizedItem>> = None;

        let mut work = Vec::with_capacity(items.len());
        for item in items {
            let known = match self.ctx.store.contains(&item.id) {
                None => None,
                Some(partition) if partition.is_tier() => {
                    if resume {
                        debug!(item_id = %item.id, partition = %partition, "Already persisted, skipping");
                        report.resumed += 1;
                    } else {
                        report.already_classified += 1;
                    }
                    continue;
                }
                Some(_) => {
                    report.retried += 1;
                    if resume {
                        let errors = stored_errors.get_or_insert_with(|| self.stored_errors());
                        Some(
                            errors
                                .get(&item.id)
                                .map(FinalizedItem::answered_candidates)
                                .unwrap_or_default(),
                        )
                    } else {
                        Some(BTreeMap::new())
                    }
                }
            };

            let from_error = known.is_some();
            work.push(WorkItem {
                item,
                known: known.unwrap_or_default(),
                from_error,
            });
        }

        if report.already_classified > 0 {
            warn!(
                dir = %self.ctx.store.dir().display(),
                items = report.already_classified,
                "Resume is off but these items are already classified here; not re-running them. \
                 Use a fresh output directory to re-evaluate"
            );
        }

        info!(
            total = report.total_items,
            resumed = report.resumed,
            retried = report.retried,
            pending = work.len(),
            candidates = self.responders.enabled_count(),
            item_concurrency = self.ctx.settings.item_concurrency,
            "Starting evaluation run"
        );

        self.schedule(work, &mut report).await;
        report
    }

    /// Error-partition entries keyed by id; empty (with a warning) if unreadable.
    fn stored_errors(&self) -> HashMap<String, FinalizedItem> {
        match self.ctx.store.error_items() {
            Ok(items) => items
                .into_iter()
                .map(|item| (item.id().to_string(), item))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read error partition, re-running errored items in full");
                HashMap::new()
            }
        }
    }

    /// Re-dispatch failed candidates of every item in the error partition.
    pub async fn retry_errors(&self) -> Result<RunReport> {
        let errored = self.ctx.store.error_items()?;
        let mut report = RunReport {
            total_items: errored.len(),
            ..Default::default()
        };

        let work: Vec<WorkItem> = errored
            .into_iter()
            .map(|finalized| WorkItem {
                known: finalized.answered_candidates(),
                item: finalized.item,
                from_error: true,
            })
            .collect();

        info!(pending = work.len(), "Starting retry pass over errored items");
        self.schedule(work, &mut report).await;
        Ok(report)
    }

    /// Outer pool: one task per item, bounded by `item_concurrency`.
    async fn schedule(&self, work: Vec<WorkItem>, report: &mut RunReport) {
        let start = Instant::now();
        let pb = progress_bar(report.total_items);
        pb.set_position(report.resumed as u64);

        let permits = Arc::new(Semaphore::new(self.ctx.settings.item_concurrency));
        let mut tasks: JoinSet<Processed> = JoinSet::new();
        let total = work.len();

        for (index, work_item) in work.into_iter().enumerate() {
            while let Some(joined) = tasks.try_join_next() {
                self.record(joined, report, &pb);
            }

            if self.ctx.shutdown.is_triggered() {
                report.cancelled = true;
                report.interrupted += total - index;
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Item pool closed, stopping");
                        report.interrupted += total - index;
                        break;
                    }
                },
                _ = self.ctx.shutdown.triggered() => {
                    report.cancelled = true;
                    report.interrupted += total - index;
                    break;
                }
            };

            let task = self.clone_for_task();
            tasks.spawn(async move {
                let _permit = permit;
                task.process(work_item).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.record(joined, report, &pb);
        }

        if self.ctx.shutdown.is_triggered() {
            report.cancelled = true;
        }

        // Final flush runs even after shutdown
        if let Err(e) = self.ctx.store.flush() {
            report.persistence_errors += 1;
            warn!(error = %e, pending = self.ctx.store.pending(), "Final flush failed");
        }
        if let Err(e) = self.ctx.store.write_summary() {
            warn!(error = %e, "Failed to write summary");
        }

        report.runtime_secs = start.elapsed().as_secs_f64();
        pb.finish_with_message(format!(
            "classified: {}, errors: {}, interrupted: {}",
            report.classified, report.errored, report.interrupted
        ));

        info!(
            classified = report.classified,
            errored = report.errored,
            promoted = report.promoted,
            resumed = report.resumed,
            interrupted = report.interrupted,
            persistence_errors = report.persistence_errors,
            cancelled = report.cancelled,
            runtime_secs = format!("{:.1}", report.runtime_secs),
            "Run complete"
        );
    }

    fn record(
        &self,
        joined: std::result::Result<Processed, tokio::task::JoinError>,
        report: &mut RunReport,
        pb: &ProgressBar,
    ) {
        if let Ok(Processed {
            persist_failed: true,
            ..
        }) = &joined
        {
            report.persistence_errors += 1;
        }

        match joined.map(|p| (p.id, p.outcome)) {
            Ok((_, ItemOutcome::Classified { tier, promoted })) => {
                report.record_tier(tier);
                if promoted {
                    report.promoted += 1;
                }
            }
            Ok((_, ItemOutcome::Errored)) => report.errored += 1,
            Ok((id, ItemOutcome::Interrupted)) => {
                debug!(item_id = %id, "Item interrupted, left for the next run");
                report.interrupted += 1;
            }
            Err(e) => {
                warn!(error = %e, "Item task panicked");
                report.interrupted += 1;
            }
        }
        pb.inc(1);
        pb.set_message(format!(
            "classified: {}, errors: {}",
            report.classified, report.errored
        ));
    }

    /// Create a lightweight handle for spawning item tasks.
    fn clone_for_task(&self) -> ItemTask {
        ItemTask {
            responders: Arc::clone(&self.responders),
            judge: Arc::clone(&self.judge),
            ctx: self.ctx.clone(),
        }
    }
}

/// Handle owned by one spawned item task.
struct ItemTask {
    responders: Arc<ResponderPool>,
    judge: Arc<JudgeService>,
    ctx: PipelineContext,
}

impl ItemTask {
    async fn process(self, work: WorkItem) -> Processed {
        let WorkItem {
            item,
            known,
            from_error,
        } = work;
        let id = item.id.clone();

        let dispatch = self.responders.dispatch(&item, &known, &self.ctx).await;
        if dispatch.interrupted {
            return Processed {
                id,
                outcome: ItemOutcome::Interrupted,
                persist_failed: false,
            };
        }

        let failed = dispatch.failed_candidates();
        if !failed.is_empty() {
            warn!(item_id = %id, failed = ?failed, "Candidates failed, routing to error partition");
            let persist_failed = !self.persist(FinalizedItem::failed(item, dispatch.results, failed));
            return Processed {
                id,
                outcome: ItemOutcome::Errored,
                persist_failed,
            };
        }

        let item = Arc::new(item);
        let mut results = dispatch.results;
        let mut judging = JoinSet::new();
        for result in results.values().filter(|r| r.is_answered()).cloned() {
            let judge = Arc::clone(&self.judge);
            let item = Arc::clone(&item);
            let ctx = self.ctx.clone();
            judging.spawn(async move {
                let judgement = judge.judge_candidate(&item, &result, &ctx).await;
                (result.candidate_id, judgement)
            });
        }

        while let Some(joined) = judging.join_next().await {
            match joined {
                Ok((name, judgement)) => {
                    if let Some(result) = results.get_mut(&name) {
                        judgement.apply(result, self.ctx.settings.debug);
                    }
                }
                // A lost judgement counts as a non-match
                Err(e) => warn!(item_id = %item.id, error = %e, "Judge task panicked"),
            }
        }

        let classification = classify(&results, self.responders.enabled_count());
        let tier = classification.tier;
        debug!(
            item_id = %item.id,
            tier = %tier,
            agreement = classification.agreement_count,
            enabled = classification.enabled_count,
            "Item classified"
        );

        let item = Arc::try_unwrap(item).unwrap_or_else(|shared| (*shared).clone());
        let persist_failed = !self.persist(FinalizedItem::classified(item, results, classification));

        Processed {
            id,
            outcome: ItemOutcome::Classified {
                tier,
                promoted: from_error,
            },
            persist_failed,
        }
    }

    /// Queue a finalized item; false when the flush it triggered failed.
    fn persist(&self, finalized: FinalizedItem) -> bool {
        let id = finalized.id().to_string();
        match self.ctx.store.persist(finalized) {
            Ok(()) => true,
            Err(e) => {
                // The batch stays queued and is retried by the next flush
                warn!(item_id = %id, error = %e, "Flush failed, batch retained");
                false
            }
        }
    }
}
