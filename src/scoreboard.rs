// Points standings over every user's newest live submission.
//
// The standings are a pull-through cache: bus events mark it dirty and
// the next read recomputes from the store. A user pair contributes at
// most one result, the newest decided match between their listed
// submissions: 3 points to the winner, 1 point to each side of a draw.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::engine::Arena;
use crate::error::Result;
use crate::models::{MatchDoc, MatchStatus, User};

#[derive(Debug, Clone, Serialize)]
pub struct ScoreboardEntry {
    /// 1-based standing; equal scores share a rank.
    pub rank: usize,
    pub user_id: i64,
    pub name: String,
    pub score: i64,
    pub win: i64,
    pub lose: i64,
    pub draw: i64,
    /// The listed submission, absent for users with nothing live.
    pub submission_id: Option<i64>,
}

/// Cached standings behind a dirty flag. `invalidate` is cheap and safe
/// to call from any event handler; the recompute runs on the first read
/// after an invalidation.
pub struct ScoreboardCache {
    rows: RwLock<Option<Arc<Vec<ScoreboardEntry>>>>,
    dirty: AtomicBool,
}

impl Default for ScoreboardCache {
    fn default() -> ScoreboardCache {
        ScoreboardCache::new()
    }
}

impl ScoreboardCache {
    pub fn new() -> ScoreboardCache {
        ScoreboardCache {
            rows: RwLock::new(None),
            dirty: AtomicBool::new(true),
        }
    }

    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
            || self.rows.read().expect("scoreboard lock poisoned").is_none()
    }

    /// Return the cached standings, running `recompute` when stale. The
    /// dirty flag is cleared before the recompute starts, so an
    /// invalidation arriving mid-recompute forces another pass on the
    /// next read instead of being lost.
    pub async fn refresh_if_stale<F, Fut>(&self, recompute: F) -> Result<Arc<Vec<ScoreboardEntry>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ScoreboardEntry>>>,
    {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            if let Some(rows) = self.rows.read().expect("scoreboard lock poisoned").clone() {
                return Ok(rows);
            }
        }
        match recompute().await {
            Ok(rows) => {
                let rows = Arc::new(rows);
                *self.rows.write().expect("scoreboard lock poisoned") = Some(rows.clone());
                Ok(rows)
            }
            Err(err) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }
}

impl Arena {
    /// Current standings; recomputed when a bus event marked the cache
    /// stale, served from memory otherwise.
    pub async fn get_scoreboard(&self) -> Result<Arc<Vec<ScoreboardEntry>>> {
        self.scoreboard.refresh_if_stale(|| self.compute_standings()).await
    }

    async fn compute_standings(&self) -> Result<Vec<ScoreboardEntry>> {
        let users = self.db.all_users().await?;
        let latest: HashMap<i64, i64> = self
            .db
            .latest_live_submission_ids()
            .await?
            .into_iter()
            .collect();
        let matches = self.db.decided_matches().await?;
        tracing::debug!(users = users.len(), matches = matches.len(), "standings recomputed");
        Ok(build_standings(&users, &latest, &matches))
    }
}

/// Pure standings computation. `latest` maps user id to their listed
/// submission; `matches` is every decided match, newest first. Matches
/// of superseded submissions are skipped, and only the newest match per
/// user pair counts.
pub fn build_standings(
    users: &[User],
    latest: &HashMap<i64, i64>,
    matches: &[MatchDoc],
) -> Vec<ScoreboardEntry> {
    let listed: HashSet<i64> = latest.values().copied().collect();
    let mut tally: HashMap<i64, Tally> = users.iter().map(|u| (u.id, Tally::default())).collect();
    let mut counted: HashSet<(i64, i64)> = HashSet::new();

    for doc in matches {
        if !listed.contains(&doc.u1_submission) || !listed.contains(&doc.u2_submission) {
            continue;
        }
        let pair = (doc.u1.min(doc.u2), doc.u1.max(doc.u2));
        if !counted.insert(pair) {
            continue;
        }
        let (winner, loser) = match doc.status {
            MatchStatus::U1Win => (doc.u1, doc.u2),
            MatchStatus::U2Win => (doc.u2, doc.u1),
            MatchStatus::Draw => {
                for uid in [doc.u1, doc.u2] {
                    if let Some(t) = tally.get_mut(&uid) {
                        t.score += 1;
                        t.draw += 1;
                    }
                }
                continue;
            }
            _ => continue,
        };
        if let Some(t) = tally.get_mut(&winner) {
            t.score += 3;
            t.win += 1;
        }
        if let Some(t) = tally.get_mut(&loser) {
            t.lose += 1;
        }
    }

    let mut entries: Vec<ScoreboardEntry> = users
        .iter()
        .map(|u| {
            let t = tally.get(&u.id).copied().unwrap_or_default();
            ScoreboardEntry {
                rank: 0,
                user_id: u.id,
                name: u.name.clone(),
                score: t.score,
                win: t.win,
                lose: t.lose,
                draw: t.draw,
                submission_id: latest.get(&u.id).copied(),
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.win.cmp(&a.win))
            .then(b.draw.cmp(&a.draw))
            .then(a.lose.cmp(&b.lose))
            .then(a.user_id.cmp(&b.user_id))
    });

    // Equal scores share a rank; the next lower score resumes at its
    // positional index.
    let mut last_score = 0i64;
    let mut last_rank = 0usize;
    for (idx, entry) in entries.iter_mut().enumerate() {
        if idx == 0 || entry.score != last_score {
            last_rank = idx + 1;
            last_score = entry.score;
        }
        entry.rank = last_rank;
    }
    entries
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    score: i64,
    win: i64,
    lose: i64,
    draw: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::models::{LadderState, RatingSummary, Role, RoundExtra, RoundStatus, Submission};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn user(id: i64) -> User {
        User {
            id,
            name: format!("u{id}"),
            role: Role::Student,
            rating: RatingSummary { score: 1500.0, win: 0, lose: 0, draw: 0 },
            ladder: LadderState { streak: 0, change: 0.0, priority: 1.0, initial: false },
        }
    }

    fn decided(id: i64, u1: i64, u2: i64, s1: i64, s2: i64, status: MatchStatus) -> MatchDoc {
        MatchDoc {
            id,
            status,
            u1,
            u2,
            u1_submission: s1,
            u2_submission: s2,
            u1_rating: 0,
            u2_rating: 0,
            rounds: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_win_draw_scoring() {
        let users = vec![user(1), user(2), user(3)];
        let latest = HashMap::from([(1, 11), (2, 22), (3, 33)]);
        let matches = vec![
            decided(2, 1, 3, 11, 33, MatchStatus::Draw),
            decided(1, 1, 2, 11, 22, MatchStatus::U1Win),
        ];
        let rows = build_standings(&users, &latest, &matches);

        // u1: one win and one draw, u3: one draw, u2: one loss
        assert_eq!(rows[0].user_id, 1);
        assert_eq!(rows[0].score, 4);
        assert_eq!((rows[0].win, rows[0].lose, rows[0].draw), (1, 0, 1));
        assert_eq!(rows[1].user_id, 3);
        assert_eq!(rows[1].score, 1);
        assert_eq!(rows[2].user_id, 2);
        assert_eq!(rows[2].score, 0);
        assert_eq!(rows[2].lose, 1);
    }

    #[test]
    fn test_equal_scores_share_rank() {
        let users = vec![user(1), user(2), user(3), user(4)];
        let latest = HashMap::from([(1, 11), (2, 22), (3, 33), (4, 44)]);
        let matches = vec![
            decided(1, 1, 2, 11, 22, MatchStatus::U1Win),
            decided(2, 3, 4, 33, 44, MatchStatus::U2Win),
        ];
        let rows = build_standings(&users, &latest, &matches);

        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].rank, 1);
        // The next distinct score resumes at position three
        assert_eq!(rows[2].rank, 3);
        assert_eq!(rows[3].rank, 3);
    }

    #[test]
    fn test_only_newest_match_per_pair_counts() {
        let users = vec![user(1), user(2)];
        let latest = HashMap::from([(1, 11), (2, 22)]);
        // Newest first: the rematch won by u2 supersedes the earlier win
        let matches = vec![
            decided(5, 1, 2, 11, 22, MatchStatus::U2Win),
            decided(3, 1, 2, 11, 22, MatchStatus::U1Win),
        ];
        let rows = build_standings(&users, &latest, &matches);

        assert_eq!(rows[0].user_id, 2);
        assert_eq!(rows[0].score, 3);
        assert_eq!(rows[1].score, 0);
    }

    #[test]
    fn test_superseded_submissions_do_not_count() {
        let users = vec![user(1), user(2)];
        // u1's listed submission is 12; the match was played by 11
        let latest = HashMap::from([(1, 12), (2, 22)]);
        let matches = vec![decided(1, 1, 2, 11, 22, MatchStatus::U1Win)];
        let rows = build_standings(&users, &latest, &matches);

        assert!(rows.iter().all(|r| r.score == 0));
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].rank, 1);
    }

    #[test]
    fn test_user_without_live_submission_is_listed_unscored() {
        let users = vec![user(1), user(2)];
        let latest = HashMap::from([(1, 11)]);
        let rows = build_standings(&users, &latest, &[]);

        let u2 = rows.iter().find(|r| r.user_id == 2).unwrap();
        assert_eq!(u2.score, 0);
        assert!(u2.submission_id.is_none());
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let cache = ScoreboardCache::new();
        let mut calls = 0usize;

        for _ in 0..3 {
            cache
                .refresh_if_stale(|| {
                    calls += 1;
                    async { Ok(Vec::new()) }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls, 1);
        assert!(!cache.is_stale());

        cache.invalidate();
        assert!(cache.is_stale());
        cache
            .refresh_if_stale(|| {
                calls += 1;
                async { Ok(Vec::new()) }
            })
            .await
            .unwrap();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_cache_stays_stale_after_failed_recompute() {
        let cache = ScoreboardCache::new();
        let err = cache
            .refresh_if_stale(|| async { Err(crate::error::Error::NotFound("users")) })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)));
        assert!(cache.is_stale());
    }

    async fn test_arena() -> Arc<Arena> {
        let config = Config {
            dedup_delay_ms: 10,
            ..Config::default()
        };
        let db = Database::new("sqlite::memory:").await.unwrap();
        let (tasks, _rx) = crate::mq::channel();
        Arena::new(config, db, tasks)
    }

    async fn seeded_match(arena: &Arena) -> MatchDoc {
        let u1 = arena.db.create_user("p1", Role::Student, 1500.0).await.unwrap();
        let u2 = arena.db.create_user("p2", Role::Student, 1500.0).await.unwrap();
        let mut s1 = effective_submission(u1.id);
        s1.id = arena.db.create_submission(&s1).await.unwrap();
        let mut s2 = effective_submission(u2.id);
        s2.id = arena.db.create_submission(&s2).await.unwrap();
        arena.create_match(&s1, &s2).await.unwrap()
    }

    fn effective_submission(user_id: i64) -> Submission {
        Submission {
            id: 0,
            user_id,
            version: 1,
            code: "move(7, 7)".into(),
            status: crate::models::SubmissionStatus::Effective,
            text: String::new(),
            task_token: None,
            exe_blob: Some("blob".into()),
            matches: Vec::new(),
            start_rating: None,
            end_rating: None,
            created_at: Utc::now(),
        }
    }

    async fn wait_queue_idle(arena: &Arena) {
        timeout(Duration::from_secs(2), async {
            while !arena.status_queue.is_idle() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status queue did not drain");
    }

    #[tokio::test]
    async fn test_settlement_invalidates_and_scores() {
        let arena = test_arena().await;
        let doc = seeded_match(&arena).await;

        let before = arena.get_scoreboard().await.unwrap();
        assert!(before.iter().all(|r| r.score == 0));

        for round in &doc.rounds {
            arena
                .judge_complete_round(doc.id, round.id, RoundStatus::U1Win, RoundExtra::default())
                .await
                .unwrap();
        }
        wait_queue_idle(&arena).await;

        // The settlement marked the cache stale through the bus
        assert!(arena.scoreboard.is_stale());
        let rows = arena.get_scoreboard().await.unwrap();
        assert_eq!(rows[0].user_id, doc.u1);
        assert_eq!(rows[0].score, 3);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].score, 0);
        assert_eq!(rows[1].rank, 2);

        // Quiet period: reads reuse the cached standings
        let again = arena.get_scoreboard().await.unwrap();
        assert!(Arc::ptr_eq(&rows, &again));
    }
}
