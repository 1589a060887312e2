// Task dispatch channel for the external worker pool.
//
// Fire-and-forget publish; delivery to workers is at-least-once and the
// payloads carry everything a worker needs (workers are stateless).
// In-process the channel is a tokio mpsc pair: the arena holds the
// sender, the HTTP task-poll endpoint (or a broker bridge) drains the
// receiver.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueue {
    Compile,
    Judge,
}

impl TaskQueue {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskQueue::Compile => "compile",
            TaskQueue::Judge => "judge",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub queue: TaskQueue,
    pub payload: serde_json::Value,
}

/// Payload for a compile task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileTask {
    pub submission_id: i64,
    pub token: String,
    pub max_code_size: usize,
}

/// Payload for one round of judging. The opening content and rules are
/// opaque to this core; the judge interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeTask {
    pub match_id: i64,
    pub round_id: uuid::Uuid,
    pub u1_submission: i64,
    pub u2_submission: i64,
    /// "black" or "white": the color u1 plays this round.
    pub u1_field: String,
    pub opening: String,
    pub rules: String,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    tx: mpsc::UnboundedSender<Task>,
}

pub fn channel() -> (TaskDispatcher, mpsc::UnboundedReceiver<Task>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskDispatcher { tx }, rx)
}

impl TaskDispatcher {
    pub fn publish(&self, queue: TaskQueue, payload: serde_json::Value) {
        tracing::debug!(queue = queue.as_str(), "dispatching task");
        if self.tx.send(Task { queue, payload }).is_err() {
            tracing::warn!(queue = queue.as_str(), "task channel closed, task dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_delivers_in_order() {
        let (dispatcher, mut rx) = channel();
        dispatcher.publish(TaskQueue::Compile, json!({ "submission_id": 1 }));
        dispatcher.publish(TaskQueue::Judge, json!({ "match_id": 2 }));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.queue, TaskQueue::Compile);
        assert_eq!(first.payload["submission_id"], 1);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.queue, TaskQueue::Judge);
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped_is_silent() {
        let (dispatcher, rx) = channel();
        drop(rx);
        // Fire-and-forget: must not panic or error
        dispatcher.publish(TaskQueue::Judge, json!({}));
    }

    #[test]
    fn test_judge_task_roundtrip() {
        let task = JudgeTask {
            match_id: 5,
            round_id: uuid::Uuid::new_v4(),
            u1_submission: 11,
            u2_submission: 22,
            u1_field: "black".into(),
            opening: "{}".into(),
            rules: "standard".into(),
        };
        let value = serde_json::to_value(&task).unwrap();
        let back: JudgeTask = serde_json::from_value(value).unwrap();
        assert_eq!(back.match_id, 5);
        assert_eq!(back.u1_field, "black");
    }
}
