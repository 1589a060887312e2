// Database access layer (SQLite via sqlx).
//
// Every mutable document row carries a `rev` counter; writers go
// through `update_*_cas` which only applies when the caller still holds
// the current revision. Embedded sub-documents (match rounds, cached
// submission match refs) are stored as JSON columns.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result};
use crate::models::{
    LadderState, MatchDoc, MatchRef, MatchStatus, Rating, RatingStatus, RatingSummary, Role,
    Round, Submission, SubmissionStatus, User,
};

/// A document together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub doc: T,
    pub rev: i64,
}

pub struct Database {
    pool: SqlitePool,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    role: String,
    rating_score: f64,
    rating_win: i64,
    rating_lose: i64,
    rating_draw: i64,
    streak: i64,
    change: f64,
    priority: f64,
    initial: i64,
    rev: i64,
}

impl UserRow {
    fn into_versioned(self) -> Result<Versioned<User>> {
        let role = Role::from_str_name(&self.role)
            .ok_or_else(|| Error::Validation(format!("unknown role {}", self.role)))?;
        Ok(Versioned {
            doc: User {
                id: self.id,
                name: self.name,
                role,
                rating: RatingSummary {
                    score: self.rating_score,
                    win: self.rating_win,
                    lose: self.rating_lose,
                    draw: self.rating_draw,
                },
                ladder: LadderState {
                    streak: self.streak,
                    change: self.change,
                    priority: self.priority,
                    initial: self.initial != 0,
                },
            },
            rev: self.rev,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: i64,
    user_id: i64,
    version: i64,
    code: String,
    status: String,
    text: String,
    task_token: Option<String>,
    exe_blob: Option<String>,
    matches: String,
    start_rating: Option<i64>,
    end_rating: Option<i64>,
    created_at: String,
    rev: i64,
}

impl SubmissionRow {
    fn into_versioned(self) -> Result<Versioned<Submission>> {
        let status = SubmissionStatus::from_str_name(&self.status)
            .ok_or_else(|| Error::Validation(format!("unknown submission status {}", self.status)))?;
        let matches: Vec<MatchRef> = serde_json::from_str(&self.matches)?;
        Ok(Versioned {
            doc: Submission {
                id: self.id,
                user_id: self.user_id,
                version: self.version,
                code: self.code,
                status,
                text: self.text,
                task_token: self.task_token,
                exe_blob: self.exe_blob,
                matches,
                start_rating: self.start_rating,
                end_rating: self.end_rating,
                created_at: parse_time(&self.created_at),
            },
            rev: self.rev,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MatchRow {
    id: i64,
    status: String,
    u1: i64,
    u2: i64,
    u1_submission: i64,
    u2_submission: i64,
    u1_rating: i64,
    u2_rating: i64,
    rounds: String,
    created_at: String,
    rev: i64,
}

impl MatchRow {
    fn into_versioned(self) -> Result<Versioned<MatchDoc>> {
        let status = MatchStatus::from_str_name(&self.status)
            .ok_or_else(|| Error::Validation(format!("unknown match status {}", self.status)))?;
        let rounds: Vec<Round> = serde_json::from_str(&self.rounds)?;
        Ok(Versioned {
            doc: MatchDoc {
                id: self.id,
                status,
                u1: self.u1,
                u2: self.u2,
                u1_submission: self.u1_submission,
                u2_submission: self.u2_submission,
                u1_rating: self.u1_rating,
                u2_rating: self.u2_rating,
                rounds,
                created_at: parse_time(&self.created_at),
            },
            rev: self.rev,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RatingRow {
    id: i64,
    user_id: i64,
    match_id: Option<i64>,
    status: String,
    before: f64,
    after: f64,
    change: f64,
}

impl RatingRow {
    fn into_rating(self) -> Result<Rating> {
        let status = RatingStatus::from_str_name(&self.status)
            .ok_or_else(|| Error::Validation(format!("unknown rating status {}", self.status)))?;
        Ok(Rating {
            id: self.id,
            user_id: self.user_id,
            match_id: self.match_id,
            status,
            before: self.before,
            after: self.after,
            change: self.change,
        })
    }
}

const SUBMISSION_COLS: &str = "id, user_id, version, code, status, text, task_token, exe_blob, matches, start_rating, end_rating, created_at, rev";
const MATCH_COLS: &str =
    "id, status, u1, u2, u1_submission, u2_submission, u1_rating, u2_rating, rounds, created_at, rev";
const USER_COLS: &str = "id, name, role, rating_score, rating_win, rating_lose, rating_draw, streak, change, priority, initial, rev";
const RATING_COLS: &str = "id, user_id, match_id, status, before, after, change";

impl Database {
    pub async fn new(database_url: &str) -> Result<Database> {
        // A single connection keeps `sqlite::memory:` coherent in tests
        // and serializes writers against the same revision counters.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'student',
                rating_score REAL NOT NULL,
                rating_win INTEGER NOT NULL DEFAULT 0,
                rating_lose INTEGER NOT NULL DEFAULT 0,
                rating_draw INTEGER NOT NULL DEFAULT 0,
                streak INTEGER NOT NULL DEFAULT 0,
                change REAL NOT NULL DEFAULT 0,
                priority REAL NOT NULL DEFAULT 0,
                initial INTEGER NOT NULL DEFAULT 1,
                submission_count INTEGER NOT NULL DEFAULT 0,
                rev INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                version INTEGER NOT NULL,
                code TEXT NOT NULL,
                status TEXT NOT NULL,
                text TEXT NOT NULL DEFAULT '',
                task_token TEXT,
                exe_blob TEXT,
                matches TEXT NOT NULL DEFAULT '[]',
                start_rating INTEGER,
                end_rating INTEGER,
                created_at TEXT NOT NULL,
                rev INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                u1 INTEGER NOT NULL REFERENCES users(id),
                u2 INTEGER NOT NULL REFERENCES users(id),
                u1_submission INTEGER NOT NULL REFERENCES submissions(id),
                u2_submission INTEGER NOT NULL REFERENCES submissions(id),
                u1_rating INTEGER NOT NULL,
                u2_rating INTEGER NOT NULL,
                rounds TEXT NOT NULL,
                created_at TEXT NOT NULL,
                rev INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ratings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                match_id INTEGER,
                status TEXT NOT NULL,
                before REAL NOT NULL,
                after REAL NOT NULL,
                change REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sys (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota (
                user_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                used_ms INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_submissions_user ON submissions(user_id, id DESC)",
            "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status, id DESC)",
            "CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status)",
            "CREATE INDEX IF NOT EXISTS idx_matches_u1s ON matches(u1_submission)",
            "CREATE INDEX IF NOT EXISTS idx_matches_u2s ON matches(u2_submission)",
            "CREATE INDEX IF NOT EXISTS idx_ratings_user ON ratings(user_id, status)",
        ] {
            sqlx::query(idx).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(&self, name: &str, role: Role, initial_score: f64) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (name, role, rating_score) VALUES (?, ?, ?) RETURNING {USER_COLS}"
        ))
        .bind(name)
        .bind(role.as_str())
        .bind(initial_score)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_versioned()?.doc)
    }

    pub async fn get_user(&self, id: i64) -> Result<Versioned<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("user"))?;
        row.into_versioned()
    }

    /// Compare-and-set write of every mutable user field.
    pub async fn update_user_cas(&self, user: &User, rev: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                rating_score = ?, rating_win = ?, rating_lose = ?, rating_draw = ?,
                streak = ?, change = ?, priority = ?, initial = ?,
                rev = rev + 1
            WHERE id = ? AND rev = ?
        "#,
        )
        .bind(user.rating.score)
        .bind(user.rating.win)
        .bind(user.rating.lose)
        .bind(user.rating.draw)
        .bind(user.ladder.streak)
        .bind(user.ladder.change)
        .bind(user.ladder.priority)
        .bind(user.ladder.initial as i64)
        .bind(user.id)
        .bind(rev)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Idle users (positive priority), most urgent first.
    pub async fn all_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLS} FROM users ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_versioned().map(|v| v.doc))
            .collect()
    }

    pub async fn idle_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLS} FROM users WHERE priority > 0 ORDER BY priority DESC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_versioned().map(|v| v.doc))
            .collect()
    }

    /// Claim a user for a match. Fails when someone else claimed them
    /// first (priority already 0).
    pub async fn try_mark_user_busy(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE users SET priority = 0, rev = rev + 1 WHERE id = ? AND priority > 0")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unconditional priority write, used to roll back a half-claimed
    /// pairing.
    pub async fn set_user_priority(&self, id: i64, priority: f64) -> Result<()> {
        sqlx::query("UPDATE users SET priority = ?, rev = rev + 1 WHERE id = ?")
            .bind(priority)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Monotonic per-user submission number.
    pub async fn next_submission_version(&self, user_id: i64) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            "UPDATE users SET submission_count = submission_count + 1 WHERE id = ? RETURNING submission_count",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("user"))?;
        Ok(version)
    }

    // ── Submissions ───────────────────────────────────────────────────

    pub async fn create_submission(&self, sub: &Submission) -> Result<i64> {
        let matches = serde_json::to_string(&sub.matches)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO submissions
                (user_id, version, code, status, text, task_token, exe_blob, matches,
                 start_rating, end_rating, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(sub.user_id)
        .bind(sub.version)
        .bind(&sub.code)
        .bind(sub.status.as_str())
        .bind(&sub.text)
        .bind(&sub.task_token)
        .bind(&sub.exe_blob)
        .bind(matches)
        .bind(sub.start_rating)
        .bind(sub.end_rating)
        .bind(sub.created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_submission(&self, id: i64) -> Result<Versioned<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("submission"))?;
        row.into_versioned()
    }

    pub async fn update_submission_cas(&self, sub: &Submission, rev: i64) -> Result<bool> {
        let matches = serde_json::to_string(&sub.matches)?;
        let result = sqlx::query(
            r#"
            UPDATE submissions SET
                status = ?, text = ?, task_token = ?, exe_blob = ?, matches = ?,
                start_rating = ?, end_rating = ?, rev = rev + 1
            WHERE id = ? AND rev = ?
        "#,
        )
        .bind(sub.status.as_str())
        .bind(&sub.text)
        .bind(&sub.task_token)
        .bind(&sub.exe_blob)
        .bind(matches)
        .bind(sub.start_rating)
        .bind(sub.end_rating)
        .bind(sub.id)
        .bind(rev)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn latest_submission(&self, user_id: i64) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions WHERE user_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_versioned().map(|v| v.doc)).transpose()
    }

    /// The user's newest submission that is playing or eligible to play.
    pub async fn latest_live_submission(&self, user_id: i64) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions
             WHERE user_id = ? AND status IN ('running', 'effective')
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_versioned().map(|v| v.doc)).transpose()
    }

    /// Every user's newest live (running or effective) submission id.
    pub async fn latest_live_submission_ids(&self) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT user_id, MAX(id) FROM submissions
             WHERE status IN ('running', 'effective')
             GROUP BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn latest_effective_submission(&self, user_id: i64) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions
             WHERE user_id = ? AND status = 'effective'
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_versioned().map(|v| v.doc)).transpose()
    }

    /// Force the user's other pending/effective submissions inactive.
    pub async fn mark_user_submissions_inactive(
        &self,
        user_id: i64,
        except_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE submissions SET status = 'inactive', rev = rev + 1
            WHERE user_id = ? AND id != ? AND status IN ('pending', 'effective')
        "#,
        )
        .bind(user_id)
        .bind(except_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Submissions stuck before the match phase, for the admin sweep.
    pub async fn stuck_submissions(&self) -> Result<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions
             WHERE status IN ('pending', 'compiling', 'running')
             ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_versioned().map(|v| v.doc))
            .collect()
    }

    // ── Matches ───────────────────────────────────────────────────────

    pub async fn create_match(&self, doc: &MatchDoc) -> Result<i64> {
        let rounds = serde_json::to_string(&doc.rounds)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO matches
                (status, u1, u2, u1_submission, u2_submission, u1_rating, u2_rating,
                 rounds, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(doc.status.as_str())
        .bind(doc.u1)
        .bind(doc.u2)
        .bind(doc.u1_submission)
        .bind(doc.u2_submission)
        .bind(doc.u1_rating)
        .bind(doc.u2_rating)
        .bind(rounds)
        .bind(doc.created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_match(&self, id: i64) -> Result<Versioned<MatchDoc>> {
        let row = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLS} FROM matches WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("match"))?;
        row.into_versioned()
    }

    pub async fn update_match_cas(&self, doc: &MatchDoc, rev: i64) -> Result<bool> {
        let rounds = serde_json::to_string(&doc.rounds)?;
        let result = sqlx::query(
            "UPDATE matches SET status = ?, rounds = ?, rev = rev + 1 WHERE id = ? AND rev = ?",
        )
        .bind(doc.status.as_str())
        .bind(rounds)
        .bind(doc.id)
        .bind(rev)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Matches still pending or running, oldest first. Surfaces matches
    /// stuck waiting on a judge that never called back.
    pub async fn pending_matches(&self) -> Result<Vec<MatchDoc>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLS} FROM matches WHERE status IN ('pending', 'running') ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_versioned().map(|v| v.doc))
            .collect()
    }

    /// Matches that ended with a result, newest first. System errors do
    /// not count as decided.
    pub async fn decided_matches(&self) -> Result<Vec<MatchDoc>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLS} FROM matches
             WHERE status IN ('u1win', 'u2win', 'draw')
             ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_versioned().map(|v| v.doc))
            .collect()
    }

    pub async fn all_match_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM matches ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn matches_for_submission(&self, submission_id: i64) -> Result<Vec<MatchDoc>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLS} FROM matches
             WHERE u1_submission = ? OR u2_submission = ?
             ORDER BY id DESC LIMIT 20"
        ))
        .bind(submission_id)
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.into_versioned().map(|v| v.doc))
            .collect()
    }

    // ── Ratings ───────────────────────────────────────────────────────

    pub async fn create_rating(
        &self,
        user_id: i64,
        match_id: Option<i64>,
        status: RatingStatus,
        before: f64,
        after: f64,
    ) -> Result<Rating> {
        let row = sqlx::query_as::<_, RatingRow>(&format!(
            r#"
            INSERT INTO ratings (user_id, match_id, status, before, after, change, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            RETURNING {RATING_COLS}
        "#
        ))
        .bind(user_id)
        .bind(match_id)
        .bind(status.as_str())
        .bind(before)
        .bind(after)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        row.into_rating()
    }

    /// Back-link a rating to the match it was created for. The match id
    /// only exists after the match row is inserted, which is after both
    /// pending ratings already exist.
    pub async fn link_rating(&self, id: i64, match_id: i64) -> Result<()> {
        sqlx::query("UPDATE ratings SET match_id = ? WHERE id = ?")
            .bind(match_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_rating(&self, id: i64) -> Result<Rating> {
        let row = sqlx::query_as::<_, RatingRow>(&format!(
            "SELECT {RATING_COLS} FROM ratings WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("rating"))?;
        row.into_rating()
    }

    /// Settle a rating exactly once: applies only while still pending,
    /// so `after` can never be rewritten.
    pub async fn settle_rating(
        &self,
        id: i64,
        status: RatingStatus,
        after: f64,
        change: f64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ratings SET status = ?, after = ?, change = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(after)
        .bind(change)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn has_init_rating(&self, user_id: i64) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ratings WHERE user_id = ? AND status = 'init'")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    // ── Sys flags ─────────────────────────────────────────────────────

    pub async fn sys_get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM sys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn sys_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT INTO sys (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn sys_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sys WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Daily judge-time quota ────────────────────────────────────────

    pub async fn quota_used(&self, user_id: i64, day: &str) -> Result<i64> {
        let used = sqlx::query_scalar::<_, i64>(
            "SELECT used_ms FROM quota WHERE user_id = ? AND day = ?",
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;
        Ok(used.unwrap_or(0))
    }

    pub async fn quota_add(&self, user_id: i64, day: &str, used_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quota (user_id, day, used_ms) VALUES (?, ?, ?)
            ON CONFLICT(user_id, day) DO UPDATE SET used_ms = used_ms + excluded.used_ms
        "#,
        )
        .bind(user_id)
        .bind(day)
        .bind(used_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
