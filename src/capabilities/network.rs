use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

use super::{ApiError, ReachabilityProbe, ValidatedUrl};

/// Reachability by a `HEAD` against the backend. Any HTTP answer, whatever its
/// status, proves the network path works.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    target: ValidatedUrl,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(target: ValidatedUrl, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            target,
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> Result<bool, ApiError> {
        let response = self
            .client
            .head(self.target.as_str())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ApiError::NetworkUnreachable(e.to_string()))?;
        trace!(status = response.status().as_u16(), "Probe answered");
        Ok(true)
    }
}

/// Probe whose answer is set by hand: platform network callbacks in an app,
/// scripted connectivity in tests.
#[derive(Debug, Default)]
pub struct ManualProbe {
    online: AtomicBool,
    failing: AtomicBool,
    hanging: AtomicBool,
    calls: AtomicU64,
}

impl ManualProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            ..Default::default()
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make every probe return an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every probe wait forever.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for ManualProbe {
    async fn probe(&self) -> Result<bool, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::NetworkUnreachable("probe failed".to_string()));
        }
        Ok(self.online.load(Ordering::SeqCst))
    }
}
