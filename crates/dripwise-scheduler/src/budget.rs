//! Time budgets for batch passes: a per-call timeout around every
//! collaborator and a wall-clock limit on the whole pass.

use std::future::Future;
use std::time::Duration;

use dripwise_core::error::{DripError, Result};
use tokio::time::Instant;

/// Run a collaborator call, failing with [`DripError::Timeout`] after `secs`.
pub async fn with_timeout<T, F>(secs: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(DripError::Timeout(secs)),
    }
}

/// Wall-clock allowance for one pass. Once exhausted, the pass stops picking
/// up new work and leaves it for the next invocation.
#[derive(Debug, Clone, Copy)]
pub struct PassBudget {
    started: Instant,
    limit: Duration,
}

impl PassBudget {
    pub fn start(limit_secs: u64) -> Self {
        Self {
            started: Instant::now(),
            limit: Duration::from_secs(limit_secs),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.limit
    }
}
