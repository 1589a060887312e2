// Arena core: match lifecycle, rating settlement, and the event wiring
// that keeps submissions and users in sync with match outcomes.
//
// Every write goes through a read-mutate-CAS loop on the document's
// revision; losing a race means re-reading and re-applying, which is
// safe because all mutations are idempotent no-ops on already-applied
// state. Events are emitted only after the winning write.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::{Event, EventBus, EventKind};
use crate::config::Config;
use crate::db::Database;
use crate::elo;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{
    MatchDoc, MatchStatus, Rating, RatingStatus, RoundExtra, RoundStatus, Submission,
};
use crate::mq::{JudgeTask, TaskDispatcher, TaskQueue};
use crate::queue::DedupWorkerQueue;
use crate::scoreboard::ScoreboardCache;

/// Upper bound on read-mutate-CAS attempts per logical write. Losing
/// this many races in a row means something is systemically wrong.
pub(crate) const CAS_MAX_RETRIES: usize = 16;

/// Result of an administrative full re-derivation pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RefreshOutcome {
    pub updated: usize,
    pub all: usize,
}

pub struct Arena {
    pub db: Database,
    pub bus: EventBus,
    pub config: Config,
    pub tasks: TaskDispatcher,
    /// Coalesces submission status recomputation triggers.
    pub status_queue: DedupWorkerQueue<()>,
    /// Standings cache, invalidated by bus events.
    pub scoreboard: ScoreboardCache,
}

impl Arena {
    /// Build the arena and wire its event subscriptions. Must run inside
    /// a tokio runtime (the status queue spawns its worker task).
    pub fn new(config: Config, db: Database, tasks: TaskDispatcher) -> Arc<Arena> {
        let delay = Duration::from_millis(config.dedup_delay_ms);
        let arena = Arc::new_cyclic(|weak: &Weak<Arena>| {
            let worker_weak = weak.clone();
            let status_queue = DedupWorkerQueue::new(
                delay,
                Arc::new(move |id, ()| {
                    let weak = worker_weak.clone();
                    Box::pin(async move {
                        let Some(arena) = weak.upgrade() else {
                            return Ok(());
                        };
                        let submission_id: i64 = id
                            .parse()
                            .map_err(|_| Error::Validation(format!("bad queue id {id}")))?;
                        arena.rederive_submission_status(submission_id).await
                    })
                }),
            );
            Arena {
                db,
                bus: EventBus::new(),
                config,
                tasks,
                status_queue,
                scoreboard: ScoreboardCache::new(),
            }
        });
        arena.register_handlers();
        arena
    }

    fn register_handlers(self: &Arc<Self>) {
        // Terminal match statuses settle ratings and users; any status
        // change refreshes both submissions' cached match views.
        let weak = Arc::downgrade(self);
        self.bus.on(
            EventKind::MatchStatusUpdated,
            Arc::new(move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(arena) = weak.upgrade() else {
                        return Ok(());
                    };
                    if let Event::MatchStatusUpdated(doc) = event {
                        arena.scoreboard.invalidate();
                        arena.on_match_status_updated(doc).await?;
                    }
                    Ok(())
                })
            }),
        );

        // Round progress updates the cached judge-time totals even while
        // the aggregate status is unchanged.
        let weak = Arc::downgrade(self);
        self.bus.on(
            EventKind::MatchRoundsUpdated,
            Arc::new(move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(arena) = weak.upgrade() else {
                        return Ok(());
                    };
                    if let Event::MatchRoundsUpdated { match_doc, .. } = event {
                        arena
                            .sync_submission_match(match_doc.u1_submission, &match_doc)
                            .await?;
                        arena
                            .sync_submission_match(match_doc.u2_submission, &match_doc)
                            .await?;
                    }
                    Ok(())
                })
            }),
        );

        // Submission status transitions move entries on and off the
        // standings, so they stale the scoreboard cache.
        let weak = Arc::downgrade(self);
        self.bus.on(
            EventKind::SubmissionStatusUpdated,
            Arc::new(move |_event| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(arena) = weak.upgrade() {
                        arena.scoreboard.invalidate();
                    }
                    Ok(())
                })
            }),
        );

        // A changed cached match view schedules a debounced status
        // recomputation for that submission.
        let weak = Arc::downgrade(self);
        self.bus.on(
            EventKind::SubmissionMatchStatusUpdated,
            Arc::new(move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(arena) = weak.upgrade() else {
                        return Ok(());
                    };
                    if let Event::SubmissionMatchStatusUpdated(sub) = event {
                        arena.status_queue.push(sub.id.to_string(), ());
                    }
                    Ok(())
                })
            }),
        );
    }

    // ── Judge round callbacks ─────────────────────────────────────────

    /// "Round begun" callback from a judge worker. Duplicates and late
    /// arrivals for a round that already moved on are dropped.
    pub async fn judge_start_round(&self, match_id: i64, round_id: Uuid) -> Result<bool> {
        metrics::ROUND_CALLBACKS_TOTAL.with_label_values(&["start"]).inc();
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_match(match_id).await?;
            let mut doc = v.doc;
            if !doc.start_round(round_id)? {
                metrics::IGNORED_CALLBACKS_TOTAL
                    .with_label_values(&["duplicate_start"])
                    .inc();
                tracing::debug!(match_id, %round_id, "duplicate start callback ignored");
                return Ok(false);
            }
            let status_changed = doc.recompute_status();
            if !self.db.update_match_cas(&doc, v.rev).await? {
                continue;
            }
            let round = doc.round(round_id).cloned().ok_or(Error::NotFound("round"))?;
            let doc = Arc::new(doc);
            self.bus
                .emit(Event::MatchRoundsUpdated { match_doc: doc.clone(), round })
                .await;
            if status_changed {
                self.bus.emit(Event::MatchStatusUpdated(doc)).await;
            }
            return Ok(true);
        }
        Err(Error::Conflict)
    }

    /// "Round finished" callback. The first recorded outcome wins;
    /// redelivered callbacks are no-ops.
    pub async fn judge_complete_round(
        &self,
        match_id: i64,
        round_id: Uuid,
        status: RoundStatus,
        extra: RoundExtra,
    ) -> Result<bool> {
        metrics::ROUND_CALLBACKS_TOTAL
            .with_label_values(&["complete"])
            .inc();
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_match(match_id).await?;
            let mut doc = v.doc;
            if !doc.complete_round(round_id, status, extra.clone())? {
                metrics::IGNORED_CALLBACKS_TOTAL
                    .with_label_values(&["duplicate_complete"])
                    .inc();
                tracing::debug!(match_id, %round_id, "duplicate complete callback ignored");
                return Ok(false);
            }
            let status_changed = doc.recompute_status();
            if !self.db.update_match_cas(&doc, v.rev).await? {
                continue;
            }
            if status_changed && doc.status.is_finished() {
                metrics::MATCHES_SETTLED_TOTAL
                    .with_label_values(&[doc.status.as_str()])
                    .inc();
            }
            let round = doc.round(round_id).cloned().ok_or(Error::NotFound("round"))?;
            let doc = Arc::new(doc);
            self.bus
                .emit(Event::MatchRoundsUpdated { match_doc: doc.clone(), round })
                .await;
            if status_changed {
                self.bus.emit(Event::MatchStatusUpdated(doc)).await;
            }
            return Ok(true);
        }
        Err(Error::Conflict)
    }

    // ── Settlement ────────────────────────────────────────────────────

    async fn on_match_status_updated(&self, doc: Arc<MatchDoc>) -> Result<()> {
        if doc.status.is_finished() {
            self.settle_match(&doc).await?;
        }
        self.sync_submission_match(doc.u1_submission, &doc).await?;
        self.sync_submission_match(doc.u2_submission, &doc).await?;
        Ok(())
    }

    /// Settle both ratings and fold them into the users. Idempotent:
    /// each rating settles at most once, and user updates only run for
    /// the sides whose rating transitioned in this call, so a crashed
    /// half-settlement is completed by re-running.
    pub async fn settle_match(&self, doc: &MatchDoc) -> Result<()> {
        let r1 = self.db.get_rating(doc.u1_rating).await?;
        let r2 = self.db.get_rating(doc.u2_rating).await?;
        let Some(settlement) = elo::settle(doc.status, r1.before, r2.before, &self.config.k_bands)
        else {
            return Ok(());
        };

        // Persist both rating rows before touching any user, so the
        // deltas survive a crash between the two phases.
        let settled1 = self
            .db
            .settle_rating(r1.id, settlement.u1.status, settlement.u1.after, settlement.u1.change)
            .await?;
        let settled2 = self
            .db
            .settle_rating(r2.id, settlement.u2.status, settlement.u2.after, settlement.u2.change)
            .await?;

        if settled1 {
            let rating = self.db.get_rating(r1.id).await?;
            self.update_user_rating(doc.u1, &rating).await?;
        }
        if settled2 {
            let rating = self.db.get_rating(r2.id).await?;
            self.update_user_rating(doc.u2, &rating).await?;
        }
        if settled1 || settled2 {
            tracing::info!(
                match_id = doc.id,
                status = doc.status.as_str(),
                "match settled"
            );
        }
        Ok(())
    }

    async fn update_user_rating(&self, user_id: i64, rating: &Rating) -> Result<()> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_user(user_id).await?;
            let mut user = v.doc;
            user.apply_settled_rating(rating);
            if self.db.update_user_cas(&user, v.rev).await? {
                self.bus.emit(Event::UserRatingUpdated(Arc::new(user))).await;
                return Ok(());
            }
        }
        Err(Error::Conflict)
    }

    // ── Match creation ────────────────────────────────────────────────

    /// Create a match between two claimed users. Pending ratings are
    /// recorded first so the pre-match `before` scores are fixed even if
    /// a concurrent settlement moves the live scores.
    pub async fn create_match(&self, s1: &Submission, s2: &Submission) -> Result<MatchDoc> {
        let u1 = self.db.get_user(s1.user_id).await?.doc;
        let u2 = self.db.get_user(s2.user_id).await?.doc;

        let r1 = self
            .db
            .create_rating(u1.id, None, RatingStatus::Pending, u1.rating.score, -1.0)
            .await?;
        let r2 = self
            .db
            .create_rating(u2.id, None, RatingStatus::Pending, u2.rating.score, -1.0)
            .await?;

        let mut doc = MatchDoc {
            id: 0,
            status: MatchStatus::Pending,
            u1: u1.id,
            u2: u2.id,
            u1_submission: s1.id,
            u2_submission: s2.id,
            u1_rating: r1.id,
            u2_rating: r2.id,
            rounds: MatchDoc::generate_rounds(&self.config.opening_ids()),
            created_at: Utc::now(),
        };
        doc.id = self.db.create_match(&doc).await?;
        self.db.link_rating(r1.id, doc.id).await?;
        self.db.link_rating(r2.id, doc.id).await?;

        self.add_match_to_submission(s1.id, &doc).await?;
        self.add_match_to_submission(s2.id, &doc).await?;

        self.dispatch_round_tasks(&doc);
        metrics::MATCHES_CREATED_TOTAL.inc();
        tracing::info!(match_id = doc.id, u1 = u1.id, u2 = u2.id, "match created");
        self.bus.emit(Event::MatchCreated(Arc::new(doc.clone()))).await;
        Ok(doc)
    }

    /// Publish one judge task per still-pending round.
    pub fn dispatch_round_tasks(&self, doc: &MatchDoc) {
        for round in &doc.rounds {
            if round.status != RoundStatus::Pending {
                continue;
            }
            let opening = self
                .config
                .opening_content(&round.opening_id)
                .unwrap_or("{}")
                .to_string();
            let task = JudgeTask {
                match_id: doc.id,
                round_id: round.id,
                u1_submission: doc.u1_submission,
                u2_submission: doc.u2_submission,
                u1_field: if round.u1_black { "black" } else { "white" }.to_string(),
                opening,
                rules: self.config.rules.clone(),
            };
            match serde_json::to_value(&task) {
                Ok(payload) => self.tasks.publish(TaskQueue::Judge, payload),
                Err(err) => tracing::error!(%err, "judge task serialization failed"),
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn get_match(&self, id: i64) -> Result<MatchDoc> {
        Ok(self.db.get_match(id).await?.doc)
    }

    pub async fn get_pending_matches(&self) -> Result<Vec<MatchDoc>> {
        self.db.pending_matches().await
    }

    pub async fn get_matches_for_submission(&self, submission_id: i64) -> Result<Vec<MatchDoc>> {
        self.db.matches_for_submission(submission_id).await
    }

    // ── Administrative refresh ────────────────────────────────────────

    /// Re-derive every match's aggregate status from its rounds and
    /// retry settlement of finished matches. Safe to run at any time;
    /// used after crashes and manual datastore surgery.
    pub async fn refresh_all_matches(&self) -> Result<RefreshOutcome> {
        let ids = self.db.all_match_ids().await?;
        let all = ids.len();
        let mut updated = 0usize;
        for id in ids {
            for _ in 0..CAS_MAX_RETRIES {
                let v = self.db.get_match(id).await?;
                let mut doc = v.doc;
                let changed = doc.recompute_status();
                if changed && !self.db.update_match_cas(&doc, v.rev).await? {
                    continue;
                }
                if changed {
                    updated += 1;
                    self.bus.emit(Event::MatchStatusUpdated(Arc::new(doc))).await;
                } else if doc.status.is_finished() {
                    // Unchanged but finished: complete any half-applied
                    // settlement left by a crash.
                    self.settle_match(&doc).await?;
                }
                break;
            }
        }
        tracing::info!(updated, all, "refreshed all matches");
        Ok(RefreshOutcome { updated, all })
    }
}
