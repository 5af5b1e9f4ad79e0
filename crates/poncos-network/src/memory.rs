//! In-process agent channel
//!
//! Answers every request with a user supplied handler and keeps a log of
//! what was sent. Used to drive backends and probes without agents.

use async_trait::async_trait;
use poncos_core::PoncosResult;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::channel::AgentChannel;
use crate::messages::SUCCESS;

type Handler = dyn Fn(&str, &str, &Value) -> PoncosResult<Value> + Send + Sync;

/// A request seen by a [`MemoryChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub host: String,
    pub topic: String,
    pub body: Value,
}

/// Channel whose agents live in this process
pub struct MemoryChannel {
    handler: Box<Handler>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl MemoryChannel {
    /// Answer requests with `handler(host, topic, body)`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &Value) -> PoncosResult<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Report success for everything: one successful result per task of a
    /// task batch, a successful acknowledgement otherwise
    pub fn acknowledging() -> Self {
        Self::new(|_, _, body| Ok(task_replies(body, |_| SUCCESS)))
    }

    /// Requests received so far, in arrival order
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().await.clone()
    }

    /// Requests received so far on `topic`
    pub async fn requests_on(&self, topic: &str) -> Vec<RecordedRequest> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }
}

/// Reply to `body` with one result per entry of its `tasks`, each carrying
/// the status `status(task)` and the task's guest name
pub fn task_replies<F>(body: &Value, status: F) -> Value
where
    F: Fn(&Value) -> &'static str,
{
    let results: Vec<Value> = body["tasks"]
        .as_array()
        .map(|tasks| {
            tasks
                .iter()
                .map(|task| {
                    serde_json::json!({
                        "vm_name": task["vm_name"].as_str().unwrap_or_default(),
                        "status": status(task),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    serde_json::json!({
        "status": SUCCESS,
        "results": results,
    })
}

#[async_trait]
impl AgentChannel for MemoryChannel {
    async fn request(&self, host: &str, topic: &str, body: Value) -> PoncosResult<Value> {
        let reply = (self.handler)(host, topic, &body);
        self.log.lock().await.push(RecordedRequest {
            host: host.to_string(),
            topic: topic.to_string(),
            body,
        });
        reply
    }
}
