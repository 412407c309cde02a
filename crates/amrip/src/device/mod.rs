//! Decryption backends: one [`DeviceLink`] per reachable oracle endpoint.

mod fleet;

pub use fleet::{EscalationStep, FleetScheduler, RetryLedger};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

use crate::error::RipError;

/// Re-establishes the decrypt agent on the physical backend.
///
/// The mechanics (kill/respawn the target app, re-attach instrumentation,
/// reload the agent script) live outside this crate; implementations are
/// handed the agent port to re-inject at.
#[async_trait]
pub trait DeviceAgent: Send + Sync {
    async fn reinject(&self, port: u16) -> Result<(), RipError>;
}

/// Recovery agent that shells out to a configured command, substituting
/// `{serial}` and `{port}` in its arguments.
pub struct CommandAgent {
    serial: String,
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(serial: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            serial: serial.into(),
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl DeviceAgent for CommandAgent {
    async fn reinject(&self, port: u16) -> Result<(), RipError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{serial}", &self.serial)
                    .replace("{port}", &port.to_string())
            })
            .collect();
        info!(serial = %self.serial, port, "running device recovery command");
        let status = tokio::process::Command::new(&self.program)
            .args(&args)
            .status()
            .await
            .map_err(|e| RipError::RecoveryFailed {
                serial: self.serial.clone(),
                reason: format!("failed to spawn `{}`: {e}", self.program),
            })?;
        if !status.success() {
            return Err(RipError::RecoveryFailed {
                serial: self.serial.clone(),
                reason: format!("recovery command exited with {status}"),
            });
        }
        Ok(())
    }
}

/// One decryption backend endpoint.
///
/// The gate serializes decrypt traffic: at most one session may hold it, and
/// its state is the sole load-balancing signal. Links are created at startup
/// and never destroyed; a broken link is recovered in place and reused.
pub struct DeviceLink {
    host: String,
    port: u16,
    serial: String,
    storefront: String,
    gate: Semaphore,
    agent: Arc<dyn DeviceAgent>,
}

impl DeviceLink {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        serial: impl Into<String>,
        storefront: impl Into<String>,
        agent: Arc<dyn DeviceAgent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            port,
            serial: serial.into(),
            storefront: storefront.into(),
            gate: Semaphore::new(1),
            agent,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn storefront(&self) -> &str {
        &self.storefront
    }

    /// Acquire the exclusive decrypt gate. The permit releases the gate when
    /// dropped, on every exit path.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, RipError> {
        self.gate
            .acquire()
            .await
            .map_err(|_| RipError::internal("device gate closed"))
    }

    /// Non-blocking poll of the gate, for load-balancing decisions only.
    pub fn is_busy(&self) -> bool {
        self.gate.available_permits() == 0
    }

    /// Tear down and re-establish the remote agent at this link's port.
    ///
    /// Not protected by the gate; callers must already hold it or accept the
    /// race.
    pub async fn mark_broken_and_recover(&self) -> Result<(), RipError> {
        warn!(serial = %self.serial, port = self.port, "recovering device link");
        self.agent.reinject(self.port).await?;
        info!(serial = %self.serial, port = self.port, "device link recovered");
        Ok(())
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("serial", &self.serial)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storefront", &self.storefront)
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Expand one physical backend into `count` logical links on consecutive
/// agent ports, all sharing the physical device's recovery agent.
pub fn hyper_pool(
    host: &str,
    base_port: u16,
    serial: &str,
    storefront: &str,
    count: u16,
    agent: Arc<dyn DeviceAgent>,
) -> Vec<Arc<DeviceLink>> {
    (0..count)
        .map(|k| {
            DeviceLink::new(
                host,
                base_port + k,
                format!("{serial}-hyper{k}"),
                storefront,
                Arc::clone(&agent),
            )
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testutil::RecordingAgent;
    use super::*;

    #[tokio::test]
    async fn gate_is_exclusive_and_released_on_drop() {
        let link = DeviceLink::new("127.0.0.1", 10020, "emu-1", "us", RecordingAgent::new());
        assert!(!link.is_busy());
        let permit = link.acquire().await.unwrap();
        assert!(link.is_busy());
        drop(permit);
        assert!(!link.is_busy());
    }

    #[tokio::test]
    async fn recovery_delegates_to_agent() {
        let agent = RecordingAgent::new();
        let link = DeviceLink::new("127.0.0.1", 10020, "emu-1", "us", agent.clone());
        link.mark_broken_and_recover().await.unwrap();
        assert_eq!(agent.count(), 1);
    }

    #[tokio::test]
    async fn failed_recovery_surfaces() {
        let link = DeviceLink::new("127.0.0.1", 10020, "emu-1", "us", RecordingAgent::failing());
        let err = link.mark_broken_and_recover().await.unwrap_err();
        assert!(matches!(err, RipError::RecoveryFailed { .. }));
    }

    #[test]
    fn hyper_pool_derives_serials_and_ports() {
        let links = hyper_pool("10.0.0.5", 10020, "pixel", "jp", 3, RecordingAgent::new());
        let got: Vec<(u16, &str)> = links.iter().map(|l| (l.port(), l.serial())).collect();
        assert_eq!(
            got,
            vec![
                (10020, "pixel-hyper0"),
                (10021, "pixel-hyper1"),
                (10022, "pixel-hyper2"),
            ]
        );
    }

    #[tokio::test]
    async fn command_agent_reports_nonzero_exit() {
        let agent = CommandAgent::new("emu-1", "false", vec![]);
        let err = agent.reinject(10020).await.unwrap_err();
        assert!(matches!(err, RipError::RecoveryFailed { .. }));
    }
}
