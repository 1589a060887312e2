// Domain documents and the pure round/match state machine.
//
// Matches embed their rounds; the aggregate status is always a pure
// function of round statuses and is recomputed inside the same write
// as the round mutation (see engine.rs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Exit codes the judge worker reports for a finished round.
/// Anything outside the table is treated as a system error.
pub const JUDGE_EXITCODE_MIN: i32 = 33;

// ── Statuses ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Running,
    U1Win,
    U2Win,
    Draw,
    #[serde(rename = "se")]
    SystemError,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RoundStatus::Pending | RoundStatus::Running)
    }

    pub fn from_judge_exit_code(code: i32) -> RoundStatus {
        match code - JUDGE_EXITCODE_MIN {
            0 => RoundStatus::U1Win,
            1 => RoundStatus::U2Win,
            2 => RoundStatus::Draw,
            _ => RoundStatus::SystemError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Running => "running",
            RoundStatus::U1Win => "u1win",
            RoundStatus::U2Win => "u2win",
            RoundStatus::Draw => "draw",
            RoundStatus::SystemError => "se",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Running,
    U1Win,
    U2Win,
    Draw,
    #[serde(rename = "se")]
    SystemError,
}

impl MatchStatus {
    /// Still being judged (pending or running).
    pub fn is_live(self) -> bool {
        matches!(self, MatchStatus::Pending | MatchStatus::Running)
    }

    /// Terminal aggregate status. A system error counts as finished:
    /// it voids the match but no further rounds will change it.
    pub fn is_finished(self) -> bool {
        !self.is_live()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Running => "running",
            MatchStatus::U1Win => "u1win",
            MatchStatus::U2Win => "u2win",
            MatchStatus::Draw => "draw",
            MatchStatus::SystemError => "se",
        }
    }

    pub fn from_str_name(s: &str) -> Option<MatchStatus> {
        match s {
            "pending" => Some(MatchStatus::Pending),
            "running" => Some(MatchStatus::Running),
            "u1win" => Some(MatchStatus::U1Win),
            "u2win" => Some(MatchStatus::U2Win),
            "draw" => Some(MatchStatus::Draw),
            "se" => Some(MatchStatus::SystemError),
            _ => None,
        }
    }

    /// Translate into one side's perspective.
    pub fn relative_to(self, is_u1: bool) -> RelativeStatus {
        match (self, is_u1) {
            (MatchStatus::U1Win, true) | (MatchStatus::U2Win, false) => RelativeStatus::Win,
            (MatchStatus::U1Win, false) | (MatchStatus::U2Win, true) => RelativeStatus::Lose,
            (MatchStatus::Draw, _) => RelativeStatus::Draw,
            (MatchStatus::Pending, _) => RelativeStatus::Pending,
            (MatchStatus::Running, _) => RelativeStatus::Running,
            (MatchStatus::SystemError, _) => RelativeStatus::SystemError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeStatus {
    Pending,
    Running,
    Win,
    Lose,
    Draw,
    #[serde(rename = "se")]
    SystemError,
}

// ── Round ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: Uuid,
    pub status: RoundStatus,
    pub u1_black: bool,
    pub opening_id: String,
    pub begin_judge_at: Option<DateTime<Utc>>,
    pub end_judge_at: Option<DateTime<Utc>>,
    /// Opaque reference into the external blob store.
    pub log_blob: Option<String>,
    pub summary: Option<String>,
    pub used_time_ms: i64,
}

impl Round {
    pub fn new(opening_id: &str, u1_black: bool) -> Round {
        Round {
            id: Uuid::new_v4(),
            status: RoundStatus::Pending,
            u1_black,
            opening_id: opening_id.to_string(),
            begin_judge_at: None,
            end_judge_at: None,
            log_blob: None,
            summary: None,
            used_time_ms: 0,
        }
    }

    pub fn u2_black(&self) -> bool {
        !self.u1_black
    }
}

/// Extra fields merged into a round on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundExtra {
    pub log_blob: Option<String>,
    pub summary: Option<String>,
    pub used_time_ms: Option<i64>,
}

// ── Match ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDoc {
    pub id: i64,
    pub status: MatchStatus,
    pub u1: i64,
    pub u2: i64,
    pub u1_submission: i64,
    pub u2_submission: i64,
    pub u1_rating: i64,
    pub u2_rating: i64,
    pub rounds: Vec<Round>,
    pub created_at: DateTime<Utc>,
}

impl MatchDoc {
    /// One round per configured opening per color assignment.
    pub fn generate_rounds(opening_ids: &[String]) -> Vec<Round> {
        let mut rounds = Vec::with_capacity(opening_ids.len() * 2);
        for opening_id in opening_ids {
            for u1_black in [true, false] {
                rounds.push(Round::new(opening_id, u1_black));
            }
        }
        rounds
    }

    fn round_mut(&mut self, round_id: Uuid) -> Result<&mut Round> {
        self.rounds
            .iter_mut()
            .find(|r| r.id == round_id)
            .ok_or(Error::NotFound("round"))
    }

    pub fn round(&self, round_id: Uuid) -> Option<&Round> {
        self.rounds.iter().find(|r| r.id == round_id)
    }

    /// Mark a pending round as running. A duplicate or late "begin"
    /// callback for a round that already moved on is a no-op.
    /// Returns whether the round was mutated.
    pub fn start_round(&mut self, round_id: Uuid) -> Result<bool> {
        let round = self.round_mut(round_id)?;
        if round.status != RoundStatus::Pending {
            return Ok(false);
        }
        round.status = RoundStatus::Running;
        round.begin_judge_at = Some(Utc::now());
        Ok(true)
    }

    /// Record a terminal outcome for a round. Rejects non-terminal
    /// statuses; no-ops on an already-terminal round so a redelivered
    /// callback can never overwrite the first recorded outcome.
    /// Backfills `begin_judge_at` when the begin callback was lost.
    pub fn complete_round(
        &mut self,
        round_id: Uuid,
        status: RoundStatus,
        extra: RoundExtra,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "complete_round: status {} is not a terminal round status",
                status.as_str()
            )));
        }
        let round = self.round_mut(round_id)?;
        if round.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        round.status = status;
        round.end_judge_at = Some(now);
        if round.begin_judge_at.is_none() {
            round.begin_judge_at = Some(now);
        }
        if let Some(log_blob) = extra.log_blob {
            round.log_blob = Some(log_blob);
        }
        if let Some(summary) = extra.summary {
            round.summary = Some(summary);
        }
        if let Some(used) = extra.used_time_ms {
            round.used_time_ms = used;
        }
        Ok(true)
    }

    /// Recompute the aggregate status from the rounds. Pure and
    /// idempotent; returns whether the status changed.
    pub fn recompute_status(&mut self) -> bool {
        let new_status = aggregate_status(&self.rounds);
        if new_status == self.status {
            return false;
        }
        self.status = new_status;
        true
    }

    /// Total judge time across rounds, in milliseconds.
    pub fn used_time_ms(&self) -> i64 {
        self.rounds.iter().map(|r| r.used_time_ms).sum()
    }
}

/// Aggregate a match status from its round statuses:
/// all pending → pending; any system error → system error (fail fast,
/// the whole match is voided rather than partially scored); any
/// pending/running → running; otherwise strict majority of u1win vs
/// u2win, ties draw.
pub fn aggregate_status(rounds: &[Round]) -> MatchStatus {
    let mut pending = 0usize;
    let mut running = 0usize;
    let mut u1win = 0usize;
    let mut u2win = 0usize;
    let mut errors = 0usize;
    for round in rounds {
        match round.status {
            RoundStatus::Pending => pending += 1,
            RoundStatus::Running => running += 1,
            RoundStatus::U1Win => u1win += 1,
            RoundStatus::U2Win => u2win += 1,
            RoundStatus::Draw => {}
            RoundStatus::SystemError => errors += 1,
        }
    }
    if pending == rounds.len() {
        return MatchStatus::Pending;
    }
    if errors > 0 {
        return MatchStatus::SystemError;
    }
    if pending > 0 || running > 0 {
        return MatchStatus::Running;
    }
    if u1win > u2win {
        MatchStatus::U1Win
    } else if u1win < u2win {
        MatchStatus::U2Win
    } else {
        MatchStatus::Draw
    }
}

// ── Rating ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingStatus {
    /// Created at match start, not yet settled.
    Pending,
    Win,
    Lose,
    Draw,
    /// Settled after a judge fault; no rating impact.
    Error,
    /// Baseline record created with the user's first effective
    /// submission; the live score falls back to it when no match has
    /// settled yet.
    Init,
}

impl RatingStatus {
    pub fn from_str_name(s: &str) -> Option<RatingStatus> {
        match s {
            "pending" => Some(RatingStatus::Pending),
            "win" => Some(RatingStatus::Win),
            "lose" => Some(RatingStatus::Lose),
            "draw" => Some(RatingStatus::Draw),
            "error" => Some(RatingStatus::Error),
            "init" => Some(RatingStatus::Init),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RatingStatus::Pending => "pending",
            RatingStatus::Win => "win",
            RatingStatus::Lose => "lose",
            RatingStatus::Draw => "draw",
            RatingStatus::Error => "error",
            RatingStatus::Init => "init",
        }
    }
}

/// Per-(user, match) Elo record. `after` is immutable once settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: i64,
    pub user_id: i64,
    /// None for the init baseline record.
    pub match_id: Option<i64>,
    pub status: RatingStatus,
    pub before: f64,
    pub after: f64,
    pub change: f64,
}

// ── User ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Role> {
        match s {
            "student" => Some(Role::Student),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn can_bypass_submission_lock(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn has_short_submit_cooldown(self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingSummary {
    pub score: f64,
    pub win: i64,
    pub lose: i64,
    pub draw: i64,
}

/// Matchmaking state. `priority <= 0` means the user is busy (currently
/// playing); a positive priority ranks matchmaking urgency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderState {
    pub streak: i64,
    pub change: f64,
    pub priority: f64,
    /// True until the user's first match settles.
    pub initial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub role: Role,
    pub rating: RatingSummary,
    pub ladder: LadderState,
}

impl User {
    pub fn is_busy(&self) -> bool {
        self.ladder.priority <= 0.0
    }

    /// Fold a settled rating into the live user state: score, counters,
    /// streak (same sign extends, flip resets to ±1, draw clears),
    /// cumulative change while the streak holds, and the rematch
    /// priority abs(streak * change) + 1.
    pub fn apply_settled_rating(&mut self, rating: &Rating) {
        match rating.status {
            RatingStatus::Win => {
                self.rating.win += 1;
                if self.ladder.streak > 0 {
                    self.ladder.streak += 1;
                    self.ladder.change += rating.change;
                } else {
                    self.ladder.streak = 1;
                    self.ladder.change = rating.change;
                }
            }
            RatingStatus::Lose => {
                self.rating.lose += 1;
                if self.ladder.streak < 0 {
                    self.ladder.streak -= 1;
                    self.ladder.change += rating.change;
                } else {
                    self.ladder.streak = -1;
                    self.ladder.change = rating.change;
                }
            }
            RatingStatus::Draw => {
                self.rating.draw += 1;
                self.ladder.streak = 0;
                self.ladder.change = 0.0;
            }
            // Error settlement has no rating impact; the caller only
            // restores the idle priority.
            RatingStatus::Error | RatingStatus::Pending | RatingStatus::Init => {
                self.ladder.priority = self.rematch_priority();
                return;
            }
        }
        self.rating.score = rating.after;
        self.ladder.initial = false;
        self.ladder.priority = self.rematch_priority();
    }

    pub fn rematch_priority(&self) -> f64 {
        (self.ladder.streak as f64 * self.ladder.change).abs() + 1.0
    }
}

// ── Submission ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Awaiting compile.
    Pending,
    Compiling,
    #[serde(rename = "ce")]
    CompileError,
    #[serde(rename = "se")]
    SystemError,
    /// Playing a match.
    Running,
    /// Compiled and eligible for matchmaking.
    Effective,
    /// Superseded by a newer effective submission. Terminal.
    Inactive,
}

impl SubmissionStatus {
    pub fn from_str_name(s: &str) -> Option<SubmissionStatus> {
        match s {
            "pending" => Some(SubmissionStatus::Pending),
            "compiling" => Some(SubmissionStatus::Compiling),
            "ce" => Some(SubmissionStatus::CompileError),
            "se" => Some(SubmissionStatus::SystemError),
            "running" => Some(SubmissionStatus::Running),
            "effective" => Some(SubmissionStatus::Effective),
            "inactive" => Some(SubmissionStatus::Inactive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Compiling => "compiling",
            SubmissionStatus::CompileError => "ce",
            SubmissionStatus::SystemError => "se",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Effective => "effective",
            SubmissionStatus::Inactive => "inactive",
        }
    }
}

/// Cached view of one of the submission's matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRef {
    pub match_id: i64,
    pub status: MatchStatus,
    pub used_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub user_id: i64,
    /// Monotonic per-user submission number.
    pub version: i64,
    pub code: String,
    pub status: SubmissionStatus,
    /// Compiler / judge output shown to the user.
    pub text: String,
    /// Identifies the in-flight compile task; stale callbacks carrying
    /// an old token are dropped.
    pub task_token: Option<String>,
    /// Opaque reference to the compiled artifact in the blob store.
    pub exe_blob: Option<String>,
    pub matches: Vec<MatchRef>,
    pub start_rating: Option<i64>,
    pub end_rating: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn last_match(&self) -> Option<&MatchRef> {
        self.matches.last()
    }
}

/// Coarse reason a user may not submit right now. Anything but `Cold`
/// is a hard rejection, not a retry hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HotStatus {
    Cold,
    GlobalLock { reason: String },
    QuotaLimit { used_ms: i64, limit_ms: i64 },
    CooldownLimit { remaining_ms: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn match_with_rounds(n: usize) -> MatchDoc {
        MatchDoc {
            id: 1,
            status: MatchStatus::Pending,
            u1: 1,
            u2: 2,
            u1_submission: 10,
            u2_submission: 20,
            u1_rating: 100,
            u2_rating: 200,
            rounds: (0..n).map(|i| Round::new(&format!("o{i}"), i % 2 == 0)).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(RoundStatus::from_judge_exit_code(33), RoundStatus::U1Win);
        assert_eq!(RoundStatus::from_judge_exit_code(34), RoundStatus::U2Win);
        assert_eq!(RoundStatus::from_judge_exit_code(35), RoundStatus::Draw);
        assert_eq!(RoundStatus::from_judge_exit_code(36), RoundStatus::SystemError);
        // Unknown exit codes collapse to system error
        assert_eq!(RoundStatus::from_judge_exit_code(0), RoundStatus::SystemError);
        assert_eq!(RoundStatus::from_judge_exit_code(137), RoundStatus::SystemError);
    }

    #[test]
    fn test_generate_rounds_openings_times_colors() {
        let rounds = MatchDoc::generate_rounds(&["a".into(), "b".into()]);
        assert_eq!(rounds.len(), 4);
        assert_eq!(rounds.iter().filter(|r| r.u1_black).count(), 2);
        for round in &rounds {
            assert_eq!(round.status, RoundStatus::Pending);
            assert_ne!(round.u1_black, round.u2_black());
        }
    }

    #[test]
    fn test_start_round_only_from_pending() {
        let mut m = match_with_rounds(2);
        let rid = m.rounds[0].id;

        assert!(m.start_round(rid).unwrap());
        assert_eq!(m.rounds[0].status, RoundStatus::Running);
        let begin = m.rounds[0].begin_judge_at;
        assert!(begin.is_some());

        // Duplicate begin callback is a no-op and keeps the first stamp
        assert!(!m.start_round(rid).unwrap());
        assert_eq!(m.rounds[0].begin_judge_at, begin);
    }

    #[test]
    fn test_complete_round_rejects_non_terminal() {
        let mut m = match_with_rounds(1);
        let rid = m.rounds[0].id;
        let err = m
            .complete_round(rid, RoundStatus::Running, RoundExtra::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(m.rounds[0].status, RoundStatus::Pending);
    }

    #[test]
    fn test_complete_round_backfills_begin() {
        let mut m = match_with_rounds(1);
        let rid = m.rounds[0].id;
        // "begin" callback lost in transit: complete arrives first
        assert!(m
            .complete_round(rid, RoundStatus::U1Win, RoundExtra::default())
            .unwrap());
        assert!(m.rounds[0].begin_judge_at.is_some());
        assert!(m.rounds[0].end_judge_at.is_some());
        assert!(m.rounds[0].begin_judge_at <= m.rounds[0].end_judge_at);
    }

    #[test]
    fn test_complete_round_duplicate_preserves_first_outcome() {
        let mut m = match_with_rounds(1);
        let rid = m.rounds[0].id;
        let extra = RoundExtra {
            log_blob: Some("blob-1".into()),
            summary: Some("first".into()),
            used_time_ms: Some(1200),
        };
        assert!(m.complete_round(rid, RoundStatus::U2Win, extra).unwrap());

        // Redelivered with different values: must not overwrite
        let dup = RoundExtra {
            log_blob: Some("blob-2".into()),
            summary: Some("second".into()),
            used_time_ms: Some(9999),
        };
        assert!(!m.complete_round(rid, RoundStatus::U1Win, dup).unwrap());
        assert_eq!(m.rounds[0].status, RoundStatus::U2Win);
        assert_eq!(m.rounds[0].log_blob.as_deref(), Some("blob-1"));
        assert_eq!(m.rounds[0].used_time_ms, 1200);
    }

    #[test]
    fn test_aggregate_all_pending() {
        let m = match_with_rounds(4);
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::Pending);
    }

    #[test]
    fn test_aggregate_system_error_fail_fast() {
        let mut m = match_with_rounds(2);
        let rid = m.rounds[0].id;
        m.complete_round(rid, RoundStatus::SystemError, RoundExtra::default())
            .unwrap();
        // Other round still pending: error wins immediately
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::SystemError);
    }

    #[test]
    fn test_aggregate_running_while_any_unfinished() {
        let mut m = match_with_rounds(3);
        let rid = m.rounds[0].id;
        m.complete_round(rid, RoundStatus::U1Win, RoundExtra::default())
            .unwrap();
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::Running);

        m.start_round(m.rounds[1].id).unwrap();
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::Running);
    }

    #[test]
    fn test_aggregate_majority_decides() {
        let mut m = match_with_rounds(4);
        let outcomes = [
            RoundStatus::U1Win,
            RoundStatus::U1Win,
            RoundStatus::U2Win,
            RoundStatus::Draw,
        ];
        let ids: Vec<Uuid> = m.rounds.iter().map(|r| r.id).collect();
        for (rid, status) in ids.iter().zip(outcomes) {
            m.complete_round(*rid, status, RoundExtra::default()).unwrap();
        }
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::U1Win);
    }

    #[test]
    fn test_aggregate_tie_is_draw() {
        let mut m = match_with_rounds(2);
        let ids: Vec<Uuid> = m.rounds.iter().map(|r| r.id).collect();
        m.complete_round(ids[0], RoundStatus::U1Win, RoundExtra::default())
            .unwrap();
        m.complete_round(ids[1], RoundStatus::U2Win, RoundExtra::default())
            .unwrap();
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::Draw);

        // All draws is a draw too
        let mut m = match_with_rounds(2);
        for rid in m.rounds.iter().map(|r| r.id).collect::<Vec<_>>() {
            m.complete_round(rid, RoundStatus::Draw, RoundExtra::default())
                .unwrap();
        }
        assert_eq!(aggregate_status(&m.rounds), MatchStatus::Draw);
    }

    #[test]
    fn test_recompute_idempotent() {
        let mut m = match_with_rounds(2);
        let rid = m.rounds[0].id;
        m.complete_round(rid, RoundStatus::U1Win, RoundExtra::default())
            .unwrap();
        assert!(m.recompute_status());
        assert_eq!(m.status, MatchStatus::Running);
        // No round changed: recomputing again yields the same status
        assert!(!m.recompute_status());
        assert_eq!(m.status, MatchStatus::Running);
    }

    #[test]
    fn test_relative_status() {
        assert_eq!(MatchStatus::U1Win.relative_to(true), RelativeStatus::Win);
        assert_eq!(MatchStatus::U1Win.relative_to(false), RelativeStatus::Lose);
        assert_eq!(MatchStatus::U2Win.relative_to(true), RelativeStatus::Lose);
        assert_eq!(MatchStatus::U2Win.relative_to(false), RelativeStatus::Win);
        assert_eq!(MatchStatus::Draw.relative_to(true), RelativeStatus::Draw);
        assert_eq!(
            MatchStatus::SystemError.relative_to(false),
            RelativeStatus::SystemError
        );
    }

    fn user_with(streak: i64, change: f64, score: f64) -> User {
        User {
            id: 1,
            name: "alice".into(),
            role: Role::Student,
            rating: RatingSummary { score, win: 0, lose: 0, draw: 0 },
            ladder: LadderState { streak, change, priority: 0.0, initial: false },
        }
    }

    fn settled(status: RatingStatus, before: f64, after: f64) -> Rating {
        Rating {
            id: 1,
            user_id: 1,
            match_id: Some(1),
            status,
            before,
            after,
            change: after - before,
        }
    }

    #[test]
    fn test_streak_extends_on_same_sign() {
        let mut u = user_with(2, 30.0, 1530.0);
        u.apply_settled_rating(&settled(RatingStatus::Win, 1530.0, 1545.0));
        assert_eq!(u.ladder.streak, 3);
        assert_eq!(u.ladder.change, 45.0);
        assert_eq!(u.rating.score, 1545.0);
        assert_eq!(u.rating.win, 1);
        assert_eq!(u.ladder.priority, (3.0f64 * 45.0).abs() + 1.0);
    }

    #[test]
    fn test_streak_resets_on_sign_flip() {
        let mut u = user_with(3, 45.0, 1545.0);
        u.apply_settled_rating(&settled(RatingStatus::Lose, 1545.0, 1530.0));
        assert_eq!(u.ladder.streak, -1);
        assert_eq!(u.ladder.change, -15.0);
        assert_eq!(u.rating.lose, 1);
        assert_eq!(u.ladder.priority, 15.0 + 1.0);
    }

    #[test]
    fn test_draw_clears_streak() {
        let mut u = user_with(3, 45.0, 1545.0);
        u.apply_settled_rating(&settled(RatingStatus::Draw, 1545.0, 1545.0));
        assert_eq!(u.ladder.streak, 0);
        assert_eq!(u.ladder.change, 0.0);
        assert_eq!(u.rating.draw, 1);
        assert_eq!(u.ladder.priority, 1.0);
    }

    #[test]
    fn test_win_priority_beats_draw_priority() {
        // A user on streak +2 / change +30 wins again; the resulting
        // priority must be strictly greater than a draw's.
        let mut winner = user_with(2, 30.0, 1530.0);
        winner.apply_settled_rating(&settled(RatingStatus::Win, 1530.0, 1548.0));
        let mut drawer = user_with(2, 30.0, 1530.0);
        drawer.apply_settled_rating(&settled(RatingStatus::Draw, 1530.0, 1530.0));
        assert_eq!(winner.ladder.streak, 3);
        assert!(winner.ladder.priority > drawer.ladder.priority);
    }

    #[test]
    fn test_error_settlement_restores_idle_priority_only() {
        let mut u = user_with(2, 30.0, 1530.0);
        u.apply_settled_rating(&settled(RatingStatus::Error, 1530.0, 1530.0));
        assert_eq!(u.ladder.streak, 2);
        assert_eq!(u.rating.score, 1530.0);
        assert_eq!(u.rating.win + u.rating.lose + u.rating.draw, 0);
        assert!(u.ladder.priority > 0.0);
    }

    #[test]
    fn test_busy_flag() {
        let mut u = user_with(0, 0.0, 1500.0);
        assert!(u.is_busy());
        u.ladder.priority = 1.0;
        assert!(!u.is_busy());
    }
}
