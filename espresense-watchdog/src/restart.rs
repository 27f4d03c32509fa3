//! Restart actuator: one `POST http://<address>/restart` per call, no retry.
//!
//! Every transport problem is folded into [`RestartOutcome::Failed`]; nothing
//! here returns an error to the scheduler.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RestartFailure {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("device answered HTTP {0}")]
    HttpStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Succeeded,
    Failed(RestartFailure),
}

impl RestartOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RestartOutcome::Succeeded)
    }
}

/// Sends the restart command to a device.
pub trait RestartTransport: Send + Sync {
    fn restart(&self, room: &str, address: &str) -> impl Future<Output = RestartOutcome> + Send;
}

/// Restarter hitting the node's built-in HTTP endpoint.
pub struct HttpRestarter {
    client: reqwest::Client,
    timeout: Duration,
    strict_status: bool,
}

impl HttpRestarter {
    /// `strict_status` turns non-2xx answers into failures; otherwise any
    /// completed request counts as delivered.
    pub fn new(timeout: Duration, strict_status: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, timeout, strict_status })
    }

    fn classify(&self, err: reqwest::Error) -> RestartFailure {
        if err.is_timeout() {
            RestartFailure::Timeout(self.timeout)
        } else {
            RestartFailure::Connect(err.to_string())
        }
    }
}

pub fn restart_url(address: &str) -> String {
    format!("http://{address}/restart")
}

impl RestartTransport for HttpRestarter {
    async fn restart(&self, room: &str, address: &str) -> RestartOutcome {
        let url = restart_url(address);
        match self.client.post(&url).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    debug!(room, %url, %status, "restart delivered");
                    RestartOutcome::Succeeded
                } else if self.strict_status {
                    RestartOutcome::Failed(RestartFailure::HttpStatus(status.as_u16()))
                } else {
                    warn!(room, %url, %status, "restart answered with an error status, counting it as delivered");
                    RestartOutcome::Succeeded
                }
            }
            Err(e) => RestartOutcome::Failed(self.classify(e)),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory transport recording each call and answering from a script.
    #[derive(Default)]
    pub struct ScriptedRestarter {
        calls: Mutex<Vec<(String, String)>>,
        failures: Mutex<HashMap<String, RestartFailure>>,
        hang_for: Mutex<Option<Duration>>,
    }

    impl ScriptedRestarter {
        pub fn fail_address(&self, address: &str, failure: RestartFailure) {
            self.failures.lock().insert(address.to_string(), failure);
        }

        pub fn hang(&self, d: Duration) {
            *self.hang_for.lock() = Some(d);
        }

        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    impl RestartTransport for ScriptedRestarter {
        async fn restart(&self, room: &str, address: &str) -> RestartOutcome {
            self.calls.lock().push((room.to_string(), address.to_string()));
            let hang = *self.hang_for.lock();
            if let Some(d) = hang {
                tokio::time::sleep(d).await;
            }
            match self.failures.lock().get(address) {
                Some(f) => RestartOutcome::Failed(f.clone()),
                None => RestartOutcome::Succeeded,
            }
        }
    }
}
