use std::time::Duration;

use gomoku_arena::scheduler::spawn_scheduler;
use gomoku_arena::{api, metrics, mq, Arena, Config, Database};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");

    let (tasks, task_rx) = mq::channel();
    let port = config.port;
    let scheduler_interval = Duration::from_millis(config.scheduler_interval_ms);
    let arena = Arena::new(config, db, tasks);

    spawn_scheduler(arena.clone(), scheduler_interval);

    let app = api::router(arena, task_rx);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to port {port}: {e}"));

    tracing::info!("Gomoku arena listening on port {port}");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
