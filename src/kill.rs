use crate::error::{FetchError, TerminateError};
use crate::gateway::{OperationsGateway, ServerFilter};
use crate::model::{BatchKillResult, KillOutcome, OpId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KillPolicy {
    pub max_attempts: u32,
    pub verify_timeout: Duration,
    pub verify_poll: Duration,
    pub backoff_base: Duration,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            verify_timeout: Duration::from_secs(5),
            verify_poll: Duration::from_millis(500),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl KillPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

pub struct KillCoordinator {
    gateway: Arc<dyn OperationsGateway>,
    policy: KillPolicy,
}

impl KillCoordinator {
    pub fn new(gateway: Arc<dyn OperationsGateway>, policy: KillPolicy) -> Self {
        Self { gateway, policy }
    }

    pub async fn kill_selected(&self, ids: &[OpId]) -> BatchKillResult {
        info!("killing {} operation(s)", ids.len());
        let mut result = BatchKillResult::default();
        for id in ids {
            let outcome = self.kill_one(id).await;
            match &outcome {
                KillOutcome::Terminated => info!("operation {} terminated", id),
                KillOutcome::NotFound => info!("operation {} was already gone", id),
                KillOutcome::Failed(reason) => warn!("failed to kill operation {}: {}", id, reason),
            }
            result.push(id.clone(), outcome);
        }
        result
    }

    async fn kill_one(&self, id: &OpId) -> KillOutcome {
        if id.is_empty() {
            return KillOutcome::Failed(TerminateError::InvalidId(id.to_string()).to_string());
        }

        let attempts = self.policy.max_attempts.max(1);
        let mut last_failure = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(self.policy.backoff(attempt)).await;
                info!("retrying kill of {} (attempt {}/{})", id, attempt + 1, attempts);
            }

            match self.gateway.terminate(id).await {
                Ok(()) => match self.wait_until_gone(id).await {
                    Ok(true) => return KillOutcome::Terminated,
                    Ok(false) => {
                        last_failure = format!(
                            "still running {}s after kill",
                            self.policy.verify_timeout.as_secs_f32()
                        );
                        warn!("operation {} {}", id, last_failure);
                    }
                    Err(error) => last_failure = format!("verification failed: {error}"),
                },
                Err(TerminateError::NotFound(_)) => return KillOutcome::NotFound,
                Err(error) if error.is_connectivity() => {
                    warn!("lost connection while killing {}: {}", id, error);
                    last_failure = error.to_string();
                }
                Err(error) => {
                    warn!("kill attempt {} for {} failed: {}", attempt + 1, id, error);
                    last_failure = error.to_string();
                }
            }
        }
        KillOutcome::Failed(last_failure)
    }

    async fn still_running(&self, id: &OpId) -> Result<bool, FetchError> {
        let operations = self
            .gateway
            .fetch_operations(&ServerFilter::verification(id))
            .await?;
        Ok(operations.iter().any(|op| &op.id == id))
    }

    async fn wait_until_gone(&self, id: &OpId) -> Result<bool, FetchError> {
        let started = Instant::now();
        loop {
            if !self.still_running(id).await? {
                return Ok(true);
            }
            if started.elapsed() >= self.policy.verify_timeout {
                return Ok(false);
            }
            sleep(self.policy.verify_poll).await;
        }
    }
}
