use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One request/response hop to the trace service.
pub trait DeliveryChannel: Send + Sync {
    /// Deliver `payload` to `path`. Any error, including a non-2xx response,
    /// counts as a delivery failure.
    #[allow(clippy::missing_errors_doc)]
    fn deliver(&self, path: &str, payload: &Value) -> Result<()>;
}

/// JSON-over-HTTP channel backed by a blocking `ureq` agent.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpChannel {
    #[must_use]
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl DeliveryChannel for HttpChannel {
    fn deliver(&self, path: &str, payload: &Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = match self
            .agent
            .post(&url)
            .set("content-type", "application/json")
            .send_json(payload)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("{url} answered with http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };

        let code = response.status();
        if (200..300).contains(&code) {
            Ok(())
        } else {
            Err(anyhow!("{url} answered with http status {code}"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transport already disabled, or the event could not be encoded.
    Skipped,
    /// This send failed and disabled the transport.
    Failed,
}

/// Fail-open wrapper around a [`DeliveryChannel`].
///
/// Starts enabled. The first failed delivery disables it for good and logs a
/// single warning; later sends return [`DeliveryOutcome::Skipped`] without
/// touching the channel.
pub struct Transport {
    channel: Box<dyn DeliveryChannel>,
    enabled: AtomicBool,
}

impl Transport {
    pub fn new(channel: impl DeliveryChannel + 'static) -> Self {
        Self {
            channel: Box::new(channel),
            enabled: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn http(api_url: &str, timeout: Duration) -> Self {
        Self::new(HttpChannel::new(api_url, timeout))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn send(&self, path: &str, payload: &Value) -> DeliveryOutcome {
        if !self.is_enabled() {
            return DeliveryOutcome::Skipped;
        }

        match self.channel.deliver(path, payload) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(err) => {
                if self.enabled.swap(false, Ordering::AcqRel) {
                    tracing::warn!(
                        path,
                        error = %format!("{err:#}"),
                        "trace backend unreachable; further trace events are dropped"
                    );
                }
                DeliveryOutcome::Failed
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
