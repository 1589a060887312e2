// Matchmaking loop.
//
// Each cycle takes the idle user with the highest rematch priority and
// pairs them with the opponent whose score sits on the side their
// streak points to: a winning streak seeks stronger opponents, a losing
// streak weaker ones, falling back to the other side when that half of
// the ladder is empty. Both users are claimed with a conditional write
// before the match is created, so two concurrent cycles can never pair
// the same user twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::Arena;
use crate::error::Result;
use crate::metrics;
use crate::models::{MatchDoc, Submission, User};

/// An idle user together with their playable submission.
struct Candidate {
    user: User,
    submission: Submission,
}

impl Arena {
    /// Run one matchmaking cycle. Returns the created match, or `None`
    /// when no pairing was possible.
    pub async fn run_matchmaking_cycle(&self) -> Result<Option<MatchDoc>> {
        let candidates = self.matchable_users().await?;
        let Some((picked, opponent)) = pick_pair(&candidates) else {
            metrics::SCHEDULER_CYCLES_TOTAL.with_label_values(&["idle"]).inc();
            return Ok(None);
        };

        if !self.db.try_mark_user_busy(picked.user.id).await? {
            metrics::SCHEDULER_CYCLES_TOTAL.with_label_values(&["contended"]).inc();
            return Ok(None);
        }
        if !self.db.try_mark_user_busy(opponent.user.id).await? {
            // Roll the half-claimed pairing back.
            self.db
                .set_user_priority(picked.user.id, picked.user.ladder.priority)
                .await?;
            metrics::SCHEDULER_CYCLES_TOTAL.with_label_values(&["contended"]).inc();
            return Ok(None);
        }

        match self
            .create_match(&picked.submission, &opponent.submission)
            .await
        {
            Ok(doc) => {
                metrics::SCHEDULER_CYCLES_TOTAL.with_label_values(&["matched"]).inc();
                Ok(Some(doc))
            }
            Err(err) => {
                tracing::error!(%err, "match creation failed, releasing users");
                self.db
                    .set_user_priority(picked.user.id, picked.user.ladder.priority)
                    .await?;
                self.db
                    .set_user_priority(opponent.user.id, opponent.user.ladder.priority)
                    .await?;
                Err(err)
            }
        }
    }

    /// Idle users that actually have something to play with, ordered by
    /// rematch priority.
    async fn matchable_users(&self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for user in self.db.idle_users().await? {
            if let Some(submission) = self.db.latest_effective_submission(user.id).await? {
                candidates.push(Candidate { user, submission });
            }
        }
        Ok(candidates)
    }
}

/// Choose the highest-priority candidate and their best opponent.
/// `candidates` is ordered by priority descending.
fn pick_pair<'a>(candidates: &'a [Candidate]) -> Option<(&'a Candidate, &'a Candidate)> {
    let picked = candidates.first()?;
    let rest = &candidates[1..];
    if rest.is_empty() {
        return None;
    }

    let score = picked.user.rating.score;
    let seek_stronger = picked.user.ladder.streak >= 0;
    // Equal-rated opponents sit on the preferred side of both splits.
    let (preferred, fallback): (Vec<&Candidate>, Vec<&Candidate>) = rest.iter().partition(|c| {
        if seek_stronger {
            c.user.rating.score >= score
        } else {
            c.user.rating.score <= score
        }
    });

    let nearest = |pool: &[&'a Candidate]| -> Option<&'a Candidate> {
        pool.iter()
            .min_by(|a, b| {
                let da = (a.user.rating.score - score).abs();
                let db = (b.user.rating.score - score).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
    };

    let opponent = nearest(&preferred).or_else(|| nearest(&fallback))?;
    Some((picked, opponent))
}

/// Spawn the background matchmaking loop.
pub fn spawn_scheduler(arena: Arc<Arena>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_ms = interval.as_millis() as u64, "scheduler started");
        loop {
            tokio::time::sleep(interval).await;
            match arena.run_matchmaking_cycle().await {
                Ok(Some(doc)) => {
                    tracing::debug!(match_id = doc.id, "scheduler created match");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(%err, "matchmaking cycle failed");
                }
            }
        }
    })
}
