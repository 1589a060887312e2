// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;

use crate::elo::{default_k_bands, KBand, INITIAL_SCORE};

/// One opening from the opening library. The content is handed to the
/// judge verbatim.
#[derive(Debug, Clone)]
pub struct Opening {
    pub id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Opening library; every match plays each opening with both color
    /// assignments.
    pub openings: Vec<Opening>,
    /// Opaque rules string forwarded to the judge.
    pub rules: String,
    /// Minimum interval between two submissions of one user.
    pub submit_interval_ms: i64,
    /// Shorter cooldown for privileged roles.
    pub privileged_submit_interval_ms: i64,
    /// Per-day execution-time quota per user.
    pub max_exec_quota_ms: i64,
    /// Maximum accepted source size in bytes.
    pub max_code_size: usize,
    /// Score new users start from.
    pub initial_score: f64,
    /// Elo K-factor title table.
    pub k_bands: Vec<KBand>,
    /// Debounce window of the submission status queue.
    pub dedup_delay_ms: u64,
    /// Backoff between matchmaking cycles.
    pub scheduler_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            database_url: "sqlite:arena.db?mode=rwc".to_string(),
            port: 3000,
            openings: vec![Opening { id: "default".to_string(), content: "{}".to_string() }],
            rules: "standard".to_string(),
            submit_interval_ms: 30_000,
            privileged_submit_interval_ms: 1_000,
            max_exec_quota_ms: 15 * 60_000,
            max_code_size: 64 * 1024,
            initial_score: INITIAL_SCORE,
            k_bands: default_k_bands(),
            dedup_delay_ms: 1_000,
            scheduler_interval_ms: 2_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `OPENINGS_DIR` - directory of `<id>.json` opening files
    /// - `ARENA_RULES` - rules string forwarded to the judge
    /// - `ARENA_SUBMIT_INTERVAL_MS` / `ARENA_PRIV_SUBMIT_INTERVAL_MS`
    /// - `ARENA_MAX_EXEC_QUOTA_MS` - per-day judge-time quota
    /// - `ARENA_DEDUP_DELAY_MS` - status queue debounce window
    /// - `ARENA_SCHEDULER_INTERVAL_MS` - matchmaking backoff
    ///
    /// CLI flags:
    /// - `--port <PORT>` - override the port
    pub fn load() -> Config {
        let args: Vec<String> = std::env::args().collect();
        let mut config = Config::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        // Port: CLI flag --port takes precedence, then env var
        if let Some(port) = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        {
            config.port = port;
        }

        if let Ok(dir) = std::env::var("OPENINGS_DIR") {
            match load_openings(&PathBuf::from(&dir)) {
                Ok(openings) if !openings.is_empty() => config.openings = openings,
                Ok(_) => tracing::warn!(%dir, "openings dir is empty, using built-in opening"),
                Err(err) => tracing::warn!(%dir, %err, "failed to load openings dir"),
            }
        }

        if let Ok(rules) = std::env::var("ARENA_RULES") {
            config.rules = rules;
        }

        Self::env_i64("ARENA_SUBMIT_INTERVAL_MS", &mut config.submit_interval_ms);
        Self::env_i64(
            "ARENA_PRIV_SUBMIT_INTERVAL_MS",
            &mut config.privileged_submit_interval_ms,
        );
        Self::env_i64("ARENA_MAX_EXEC_QUOTA_MS", &mut config.max_exec_quota_ms);
        Self::env_u64("ARENA_DEDUP_DELAY_MS", &mut config.dedup_delay_ms);
        Self::env_u64(
            "ARENA_SCHEDULER_INTERVAL_MS",
            &mut config.scheduler_interval_ms,
        );

        config
    }

    pub fn opening_ids(&self) -> Vec<String> {
        self.openings.iter().map(|o| o.id.clone()).collect()
    }

    pub fn opening_content(&self, id: &str) -> Option<&str> {
        self.openings
            .iter()
            .find(|o| o.id == id)
            .map(|o| o.content.as_str())
    }

    fn env_i64(key: &str, slot: &mut i64) {
        if let Some(v) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
            *slot = v;
        }
    }

    fn env_u64(key: &str, slot: &mut u64) {
        if let Some(v) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
            *slot = v;
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Read every `<id>.json` file in the directory as an opening.
fn load_openings(dir: &PathBuf) -> std::io::Result<Vec<Opening>> {
    let mut openings = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        openings.push(Opening {
            id: id.to_string(),
            content: std::fs::read_to_string(&path)?,
        });
    }
    openings.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(openings)
}
