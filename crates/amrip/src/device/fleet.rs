//! Storefront-to-device scheduling and per-device failure bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngExt;
use tracing::{debug, warn};

use crate::config::DecryptRetryConfig;
use crate::device::DeviceLink;
use crate::error::RipError;

/// What a decrypt session should do after a per-sample failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    /// Retry the decrypt call from scratch.
    Retry,
    /// Recover the device, then retry.
    RecoverThenRetry,
    /// Give up on this track.
    Fatal,
}

/// Per-device failure counter backing the three-tier decrypt escalation.
///
/// Failure `k` (0-indexed) on a device maps to: `k == recover_at` ⇒ recover
/// then retry, `k >= fatal_at` ⇒ fatal, anything else ⇒ plain retry. A
/// successful decrypt resets the device's count.
#[derive(Default)]
pub struct RetryLedger {
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure against `serial` and return the escalation step.
    pub fn escalate(&self, serial: &str, cfg: &DecryptRetryConfig) -> EscalationStep {
        let mut counts = self.counts.lock();
        let count = counts.entry(serial.to_string()).or_insert(0);
        let step = if *count >= cfg.fatal_at {
            EscalationStep::Fatal
        } else if *count == cfg.recover_at {
            EscalationStep::RecoverThenRetry
        } else {
            EscalationStep::Retry
        };
        *count += 1;
        debug!(serial, count = *count, ?step, "decrypt failure recorded");
        step
    }

    /// Clear `serial`'s failure count after a successful decrypt.
    pub fn reset(&self, serial: &str) {
        self.counts.lock().remove(serial);
    }

    #[cfg(test)]
    pub(crate) fn count(&self, serial: &str) -> u32 {
        self.counts.lock().get(serial).copied().unwrap_or(0)
    }
}

/// Maps storefronts to device links and owns the fleet-wide retry ledger.
pub struct FleetScheduler {
    links: Vec<Arc<DeviceLink>>,
    default_storefront: String,
    ledger: RetryLedger,
}

impl FleetScheduler {
    pub fn new(links: Vec<Arc<DeviceLink>>, default_storefront: impl Into<String>) -> Self {
        Self {
            links,
            default_storefront: default_storefront.into(),
            ledger: RetryLedger::new(),
        }
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn links(&self) -> &[Arc<DeviceLink>] {
        &self.links
    }

    /// Pick a link for `storefront`: prefer an idle one, else uniform random
    /// among all mapped links (queuing behind the gate). An unmapped
    /// storefront falls back to the default storefront's links.
    pub fn pick_link(&self, storefront: &str) -> Result<Arc<DeviceLink>, RipError> {
        let mut pool: Vec<&Arc<DeviceLink>> = self
            .links
            .iter()
            .filter(|l| l.storefront() == storefront)
            .collect();

        if pool.is_empty() {
            warn!(
                storefront,
                fallback = %self.default_storefront,
                "no device mapped to storefront, using default storefront pool"
            );
            pool = self
                .links
                .iter()
                .filter(|l| l.storefront() == self.default_storefront)
                .collect();
        }

        if pool.is_empty() {
            return Err(RipError::NoDeviceAvailable {
                storefront: storefront.to_string(),
            });
        }

        if let Some(idle) = pool.iter().find(|l| !l.is_busy()) {
            return Ok(Arc::clone(idle));
        }

        let index = rand::rng().random_range(0..pool.len());
        debug!(storefront, serial = pool[index].serial(), "all links busy, queuing");
        Ok(Arc::clone(pool[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::RecordingAgent;

    fn link(serial: &str, storefront: &str) -> Arc<DeviceLink> {
        DeviceLink::new("127.0.0.1", 10020, serial, storefront, RecordingAgent::new())
    }

    #[test]
    fn escalation_tiers_follow_thresholds() {
        let ledger = RetryLedger::new();
        let cfg = DecryptRetryConfig::default();
        let steps: Vec<EscalationStep> = (0..8).map(|_| ledger.escalate("emu-1", &cfg)).collect();
        assert_eq!(
            steps,
            vec![
                EscalationStep::Retry,
                EscalationStep::Retry,
                EscalationStep::Retry,
                EscalationStep::RecoverThenRetry,
                EscalationStep::Retry,
                EscalationStep::Retry,
                EscalationStep::Fatal,
                EscalationStep::Fatal,
            ]
        );
    }

    #[test]
    fn reset_clears_count_per_device() {
        let ledger = RetryLedger::new();
        let cfg = DecryptRetryConfig::default();
        for _ in 0..4 {
            ledger.escalate("emu-1", &cfg);
        }
        ledger.escalate("emu-2", &cfg);
        ledger.reset("emu-1");
        assert_eq!(ledger.count("emu-1"), 0);
        assert_eq!(ledger.count("emu-2"), 1);
        assert_eq!(ledger.escalate("emu-1", &cfg), EscalationStep::Retry);
    }

    #[tokio::test]
    async fn prefers_the_idle_link() {
        let a = link("a", "us");
        let b = link("b", "us");
        let c = link("c", "us");
        let scheduler = FleetScheduler::new(vec![a.clone(), b.clone(), c.clone()], "us");

        let _pa = a.acquire().await.unwrap();
        let _pc = c.acquire().await.unwrap();
        for _ in 0..16 {
            assert_eq!(scheduler.pick_link("us").unwrap().serial(), "b");
        }
    }

    #[tokio::test]
    async fn samples_uniformly_when_all_busy() {
        let links: Vec<Arc<DeviceLink>> = ["a", "b", "c"].iter().map(|s| link(s, "us")).collect();
        let scheduler = FleetScheduler::new(links.clone(), "us");
        let _permits: Vec<_> = futures::future::try_join_all(links.iter().map(|l| l.acquire()))
            .await
            .unwrap();

        let mut hits: HashMap<String, u32> = HashMap::new();
        for _ in 0..3000 {
            let picked = scheduler.pick_link("us").unwrap();
            *hits.entry(picked.serial().to_string()).or_insert(0) += 1;
        }
        assert_eq!(hits.len(), 3);
        for (_, count) in hits {
            // Expected 1000 each; allow generous slack.
            assert!(count > 700, "skewed pick distribution: {count}");
        }
    }

    #[test]
    fn unmapped_storefront_falls_back_to_default() {
        let scheduler = FleetScheduler::new(vec![link("a", "us")], "us");
        assert_eq!(scheduler.pick_link("jp").unwrap().serial(), "a");
    }

    #[test]
    fn empty_fleet_is_an_error() {
        let scheduler = FleetScheduler::new(vec![], "us");
        let err = scheduler.pick_link("jp").unwrap_err();
        assert!(matches!(err, RipError::NoDeviceAvailable { .. }));
    }
}
