// Submission lifecycle: intake gating, compile callbacks, the cached
// match view, and status re-derivation.
//
// A submission's status after its matches move is never edited in
// place from the callback path; callbacks only refresh the cached match
// view, and the debounced status queue re-derives the submission from
// current state. Re-derivation is idempotent, so coalesced or repeated
// runs converge on the same answer.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::Event;
use crate::engine::{Arena, CAS_MAX_RETRIES};
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{HotStatus, MatchDoc, MatchRef, RatingStatus, Submission, SubmissionStatus};
use crate::mq::{CompileTask, TaskQueue};

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

impl Arena {
    // ── Intake ────────────────────────────────────────────────────────

    /// Why the user may not submit right now, or `Cold` if they may.
    pub async fn submit_hot_status(&self, user_id: i64) -> Result<HotStatus> {
        let user = self.db.get_user(user_id).await?.doc;

        if !user.role.can_bypass_submission_lock() {
            if let Some("1") = self.db.sys_get("lock_submission").await?.as_deref() {
                let reason = self
                    .db
                    .sys_get("lock_submission_reason")
                    .await?
                    .unwrap_or_default();
                return Ok(HotStatus::GlobalLock { reason });
            }
        }

        let used_ms = self.db.quota_used(user_id, &today()).await?;
        if used_ms >= self.config.max_exec_quota_ms {
            return Ok(HotStatus::QuotaLimit {
                used_ms,
                limit_ms: self.config.max_exec_quota_ms,
            });
        }

        if let Some(last) = self.db.latest_submission(user_id).await? {
            let interval = if user.role.has_short_submit_cooldown() {
                self.config.privileged_submit_interval_ms
            } else {
                self.config.submit_interval_ms
            };
            let elapsed = (Utc::now() - last.created_at).num_milliseconds();
            if elapsed < interval {
                return Ok(HotStatus::CooldownLimit {
                    remaining_ms: interval - elapsed,
                });
            }
        }

        Ok(HotStatus::Cold)
    }

    /// Accept a new submission and dispatch its compile task.
    pub async fn create_submission(&self, user_id: i64, code: String) -> Result<Submission> {
        if code.len() > self.config.max_code_size {
            return Err(Error::Validation(format!(
                "code exceeds the {} byte limit",
                self.config.max_code_size
            )));
        }
        let hot = self.submit_hot_status(user_id).await?;
        if hot != HotStatus::Cold {
            return Err(Error::SubmitRejected(hot));
        }

        let version = self.db.next_submission_version(user_id).await?;
        let token = Uuid::new_v4().to_string();
        let mut sub = Submission {
            id: 0,
            user_id,
            version,
            code,
            status: SubmissionStatus::Pending,
            text: String::new(),
            task_token: Some(token.clone()),
            exe_blob: None,
            matches: Vec::new(),
            start_rating: None,
            end_rating: None,
            created_at: Utc::now(),
        };
        sub.id = self.db.create_submission(&sub).await?;

        self.dispatch_compile_task(sub.id, &token);
        metrics::SUBMISSIONS_CREATED_TOTAL.inc();
        tracing::info!(submission_id = sub.id, user_id, version, "submission accepted");
        self.bus.emit(Event::SubmissionCreated(Arc::new(sub.clone()))).await;
        Ok(sub)
    }

    fn dispatch_compile_task(&self, submission_id: i64, token: &str) {
        let task = CompileTask {
            submission_id,
            token: token.to_string(),
            max_code_size: self.config.max_code_size,
        };
        match serde_json::to_value(&task) {
            Ok(payload) => self.tasks.publish(TaskQueue::Compile, payload),
            Err(err) => tracing::error!(%err, "compile task serialization failed"),
        }
    }

    // ── Compile worker callbacks ──────────────────────────────────────

    fn check_task_token(sub: &Submission, token: &str) -> Result<()> {
        if sub.task_token.as_deref() != Some(token) {
            metrics::IGNORED_CALLBACKS_TOTAL
                .with_label_values(&["task_token_mismatch"])
                .inc();
            tracing::warn!(submission_id = sub.id, "stale task token, callback dropped");
            return Err(Error::TaskTokenMismatch);
        }
        Ok(())
    }

    /// "Compile started" callback.
    pub async fn judge_start_compile(&self, submission_id: i64, token: &str) -> Result<bool> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            Self::check_task_token(&sub, token)?;
            if sub.status != SubmissionStatus::Pending {
                return Ok(false);
            }
            sub.status = SubmissionStatus::Compiling;
            if !self.db.update_submission_cas(&sub, v.rev).await? {
                continue;
            }
            self.bus
                .emit(Event::SubmissionStatusUpdated(Arc::new(sub)))
                .await;
            return Ok(true);
        }
        Err(Error::Conflict)
    }

    /// "Compile finished" callback. On success the submission becomes
    /// effective, supersedes the user's other live submissions, and
    /// makes a first-time user matchable.
    pub async fn judge_complete_compile(
        &self,
        submission_id: i64,
        token: &str,
        success: bool,
        text: String,
        exe_blob: Option<String>,
    ) -> Result<bool> {
        let mut committed = None;
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            Self::check_task_token(&sub, token)?;
            if !matches!(
                sub.status,
                SubmissionStatus::Pending | SubmissionStatus::Compiling
            ) {
                return Ok(false);
            }
            if success {
                sub.status = SubmissionStatus::Effective;
                sub.exe_blob = exe_blob.clone();
                sub.task_token = None;
            } else {
                sub.status = SubmissionStatus::CompileError;
            }
            sub.text = text.clone();
            if self.db.update_submission_cas(&sub, v.rev).await? {
                committed = Some(sub);
                break;
            }
        }
        let sub = committed.ok_or(Error::Conflict)?;

        if success {
            self.db
                .mark_user_submissions_inactive(sub.user_id, sub.id)
                .await?;
            self.ensure_init_rating(sub.user_id).await?;
            tracing::info!(submission_id = sub.id, "submission effective");
        } else {
            tracing::info!(submission_id = sub.id, "compile error");
        }
        self.bus
            .emit(Event::SubmissionStatusUpdated(Arc::new(sub)))
            .await;
        Ok(true)
    }

    /// Worker-side fault before or during compilation.
    pub async fn judge_set_system_error(
        &self,
        submission_id: i64,
        token: &str,
        text: String,
    ) -> Result<bool> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            Self::check_task_token(&sub, token)?;
            if !matches!(
                sub.status,
                SubmissionStatus::Pending | SubmissionStatus::Compiling
            ) {
                return Ok(false);
            }
            sub.status = SubmissionStatus::SystemError;
            sub.text = text.clone();
            if !self.db.update_submission_cas(&sub, v.rev).await? {
                continue;
            }
            tracing::warn!(submission_id = sub.id, "submission system error");
            self.bus
                .emit(Event::SubmissionStatusUpdated(Arc::new(sub)))
                .await;
            return Ok(true);
        }
        Err(Error::Conflict)
    }

    /// Record the user's rating baseline with their first effective
    /// submission, and put a first-time user into matchmaking.
    async fn ensure_init_rating(&self, user_id: i64) -> Result<()> {
        let v = self.db.get_user(user_id).await?;
        let user = v.doc;
        if !self.db.has_init_rating(user_id).await? {
            self.db
                .create_rating(
                    user_id,
                    None,
                    RatingStatus::Init,
                    user.rating.score,
                    user.rating.score,
                )
                .await?;
        }
        if user.ladder.initial && user.is_busy() {
            self.db.set_user_priority(user_id, 1.0).await?;
        }
        Ok(())
    }

    // ── Administrative operations ─────────────────────────────────────

    /// Re-queue a failed submission for compilation with a fresh token.
    pub async fn recompile(&self, submission_id: i64) -> Result<Submission> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            if !matches!(
                sub.status,
                SubmissionStatus::CompileError
                    | SubmissionStatus::SystemError
                    | SubmissionStatus::Pending
                    | SubmissionStatus::Compiling
            ) {
                return Err(Error::Validation(format!(
                    "cannot recompile a submission in status {}",
                    sub.status.as_str()
                )));
            }
            let token = Uuid::new_v4().to_string();
            sub.status = SubmissionStatus::Pending;
            sub.task_token = Some(token.clone());
            sub.text = String::new();
            if !self.db.update_submission_cas(&sub, v.rev).await? {
                continue;
            }
            self.dispatch_compile_task(sub.id, &token);
            tracing::info!(submission_id = sub.id, "recompile queued");
            self.bus
                .emit(Event::SubmissionStatusUpdated(Arc::new(sub.clone())))
                .await;
            return Ok(sub);
        }
        Err(Error::Conflict)
    }

    /// Sweep submissions stuck in a transient status: pending and
    /// compiling ones are recompiled with a fresh token, running ones
    /// get a status re-derivation. Returns how many were touched.
    pub async fn reset_stuck_submissions(&self) -> Result<usize> {
        let stuck = self.db.stuck_submissions().await?;
        let mut touched = 0usize;
        for sub in stuck {
            match sub.status {
                SubmissionStatus::Pending | SubmissionStatus::Compiling => {
                    self.recompile(sub.id).await?;
                    touched += 1;
                }
                SubmissionStatus::Running => {
                    self.status_queue.push(sub.id.to_string(), ());
                    touched += 1;
                }
                _ => {}
            }
        }
        tracing::info!(touched, "stuck submission sweep done");
        Ok(touched)
    }

    /// Flip the global submission lock. Locked intake rejects everyone
    /// without lock-bypass rights.
    pub async fn set_submission_lock(&self, locked: bool, reason: Option<&str>) -> Result<()> {
        self.db
            .sys_set("lock_submission", if locked { "1" } else { "0" })
            .await?;
        match reason {
            Some(r) => self.db.sys_set("lock_submission_reason", r).await?,
            None => self.db.sys_delete("lock_submission_reason").await?,
        }
        Ok(())
    }

    // ── Match linkage ─────────────────────────────────────────────────

    /// Attach a freshly created match to one side's submission. The
    /// submission must be effective and its previous match finished;
    /// one submission never plays two matches at once.
    pub async fn add_match_to_submission(
        &self,
        submission_id: i64,
        doc: &MatchDoc,
    ) -> Result<()> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            if sub.status != SubmissionStatus::Effective {
                return Err(Error::Validation(format!(
                    "cannot add a match to a submission in status {}",
                    sub.status.as_str()
                )));
            }
            if let Some(last) = sub.last_match() {
                if !last.status.is_finished() {
                    return Err(Error::Validation(
                        "submission already has a live match".to_string(),
                    ));
                }
            }
            let side_rating = if doc.u1_submission == submission_id {
                doc.u1_rating
            } else {
                doc.u2_rating
            };
            sub.matches.push(MatchRef {
                match_id: doc.id,
                status: doc.status,
                used_time_ms: doc.used_time_ms(),
            });
            if sub.start_rating.is_none() {
                sub.start_rating = Some(side_rating);
            }
            sub.status = SubmissionStatus::Running;
            if !self.db.update_submission_cas(&sub, v.rev).await? {
                continue;
            }
            self.bus
                .emit(Event::SubmissionStatusUpdated(Arc::new(sub)))
                .await;
            return Ok(());
        }
        Err(Error::Conflict)
    }

    /// Refresh one cached match entry from the match document. Emits
    /// only when the cached view actually changed.
    pub async fn sync_submission_match(&self, submission_id: i64, doc: &MatchDoc) -> Result<()> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            let Some(entry) = sub.matches.iter_mut().find(|m| m.match_id == doc.id) else {
                return Ok(());
            };
            let used_time_ms = doc.used_time_ms();
            if entry.status == doc.status && entry.used_time_ms == used_time_ms {
                return Ok(());
            }
            entry.status = doc.status;
            entry.used_time_ms = used_time_ms;
            if !self.db.update_submission_cas(&sub, v.rev).await? {
                continue;
            }
            self.bus
                .emit(Event::SubmissionMatchStatusUpdated(Arc::new(sub)))
                .await;
            return Ok(());
        }
        Err(Error::Conflict)
    }

    /// Re-derive a running submission's status from its last match.
    /// Runs on the debounced status queue; must stay idempotent.
    pub async fn rederive_submission_status(&self, submission_id: i64) -> Result<()> {
        for _ in 0..CAS_MAX_RETRIES {
            let v = self.db.get_submission(submission_id).await?;
            let mut sub = v.doc;
            if sub.status != SubmissionStatus::Running {
                return Ok(());
            }
            let Some(last) = sub.last_match() else {
                return Ok(());
            };
            if !last.status.is_finished() {
                return Ok(());
            }
            let used_time_ms = last.used_time_ms;
            let last_match_id = last.match_id;

            let latest_live = self.db.latest_live_submission(sub.user_id).await?;
            let is_latest = latest_live.map(|l| l.id == sub.id).unwrap_or(false);
            sub.status = if is_latest {
                SubmissionStatus::Effective
            } else {
                SubmissionStatus::Inactive
            };

            let match_doc = self.db.get_match(last_match_id).await?.doc;
            sub.end_rating = Some(if match_doc.u1_submission == sub.id {
                match_doc.u1_rating
            } else {
                match_doc.u2_rating
            });

            if !self.db.update_submission_cas(&sub, v.rev).await? {
                continue;
            }
            // Charged after the winning write so a CAS retry cannot
            // double-count the judge time.
            if used_time_ms > 0 {
                self.db.quota_add(sub.user_id, &today(), used_time_ms).await?;
            }
            tracing::debug!(
                submission_id = sub.id,
                status = sub.status.as_str(),
                "submission status re-derived"
            );
            self.bus
                .emit(Event::SubmissionStatusUpdated(Arc::new(sub)))
                .await;
            return Ok(());
        }
        Err(Error::Conflict)
    }

    pub async fn get_submission(&self, id: i64) -> Result<Submission> {
        Ok(self.db.get_submission(id).await?.doc)
    }
}
