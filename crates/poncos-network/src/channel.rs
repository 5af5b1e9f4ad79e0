//! Request/reply channel to the per-machine agents

use async_trait::async_trait;
use poncos_core::{NetworkConfig, PoncosError, PoncosResult};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// One request/reply round-trip with the agent on `host`
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn request(&self, host: &str, topic: &str, body: Value) -> PoncosResult<Value>;
}

/// Typed wrapper around [`AgentChannel::request`]
pub async fn call<Req, Rep>(
    channel: &dyn AgentChannel,
    host: &str,
    topic: &str,
    request: &Req,
) -> PoncosResult<Rep>
where
    Req: Serialize + Sync,
    Rep: DeserializeOwned,
{
    let body = serde_json::to_value(request)?;
    let reply = channel.request(host, topic, body).await?;
    Ok(serde_json::from_value(reply)?)
}

/// HTTP transport: `POST http://<host>:<port>/<topic>` with a JSON body
pub struct HttpChannel {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl HttpChannel {
    /// Create a channel with the deadline and retry policy from `config`
    pub fn new(config: &NetworkConfig) -> PoncosResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoncosError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            port: config.agent_port,
            timeout,
            retries: config.retries,
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    fn url(&self, host: &str, topic: &str) -> String {
        format!("http://{}:{}/{}", host, self.port, topic)
    }

    async fn send_once(&self, url: &str, body: &Value) -> PoncosResult<Value> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let response = response
            .error_for_status()
            .map_err(|e| PoncosError::Network(format!("{} answered: {}", url, e)))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| PoncosError::Serialization(format!("Bad reply from {}: {}", url, e)))
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> PoncosError {
        if err.is_timeout() {
            PoncosError::Timeout {
                operation: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            PoncosError::Network(format!("{}: {}", url, err))
        }
    }
}

#[async_trait]
impl AgentChannel for HttpChannel {
    async fn request(&self, host: &str, topic: &str, body: Value) -> PoncosResult<Value> {
        let url = self.url(host, topic);
        let mut attempt = 0;

        loop {
            debug!(url = %url, attempt = attempt, "Sending agent request");

            let err = match tokio::time::timeout(self.timeout, self.send_once(&url, &body)).await
            {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => e,
                Err(_) => PoncosError::Timeout {
                    operation: format!("{} on {}", topic, host),
                    secs: self.timeout.as_secs(),
                },
            };

            let retryable = matches!(err, PoncosError::Network(_) | PoncosError::Timeout { .. });
            if attempt >= self.retries || !retryable {
                return Err(err);
            }

            attempt += 1;
            warn!(
                url = %url,
                attempt = attempt,
                error = %err,
                "Agent request failed, retrying"
            );
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_channel_url() {
        let config = NetworkConfig {
            agent_port: 7171,
            ..NetworkConfig::default()
        };
        let channel = HttpChannel::new(&config).unwrap();
        assert_eq!(
            channel.url("node03", "mmbwmon/request"),
            "http://node03:7171/mmbwmon/request"
        );
        assert_eq!(channel.timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_unreachable_agent_gives_up_after_retries() {
        let config = NetworkConfig {
            agent_port: 9,
            timeout_secs: 1,
            retries: 1,
            backoff_ms: 1,
        };
        let channel = HttpChannel::new(&config).unwrap();

        let result = channel
            .request("127.0.0.1", "mmbwmon/stop", serde_json::json!({"cgroup": "x"}))
            .await;
        assert!(result.unwrap_err().is_recoverable());
    }
}
