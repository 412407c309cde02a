//! JSON settings file: device fleet, output layout, retry tuning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use amrip_engine::{
    hyper_pool, Codec, CodecFallback, CommandAgent, DecryptRetryConfig, DeviceAgent, DeviceLink,
    FleetScheduler, RipConfig, RipError, RetryPolicy, VariantCaps,
};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub host: String,
    pub agent_port: u16,
    pub serial: String,
    pub storefront: String,
    /// >1 multiplexes the device over consecutive agent ports.
    #[serde(default = "default_hyper_count")]
    pub hyper_count: u16,
    /// Recovery command and arguments; `{serial}` and `{port}` are
    /// substituted. Without one the device cannot be recovered in place.
    #[serde(default)]
    pub recovery_command: Vec<String>,
}

fn default_hyper_count() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub devices: Vec<DeviceEntry>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_storefront")]
    pub default_storefront: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: usize,
    #[serde(default)]
    pub media_user_token: Option<String>,
    /// Walk these codecs in order when the requested one has no variant.
    #[serde(default)]
    pub codec_fallback: Vec<Codec>,
    #[serde(default = "default_recover_at")]
    pub decrypt_recover_at: u32,
    #[serde(default = "default_fatal_at")]
    pub decrypt_fatal_at: u32,
    #[serde(default)]
    pub alac_max: Option<u32>,
    #[serde(default)]
    pub atmos_max: Option<u32>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_storefront() -> String {
    "us".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_concurrency_cap() -> usize {
    16
}

fn default_recover_at() -> u32 {
    3
}

fn default_fatal_at() -> u32 {
    6
}

/// Placeholder agent for devices configured without a recovery command.
struct UnrecoverableAgent {
    serial: String,
}

#[async_trait]
impl DeviceAgent for UnrecoverableAgent {
    async fn reinject(&self, _port: u16) -> Result<(), RipError> {
        Err(RipError::RecoveryFailed {
            serial: self.serial.clone(),
            reason: "no recovery command configured".to_string(),
        })
    }
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self, RipError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| RipError::config(format!("{}: {e}", path.display())))?;
        if settings.devices.is_empty() {
            return Err(RipError::config("settings declare no devices"));
        }
        Ok(settings)
    }

    /// Build the device fleet, expanding hyper pools.
    pub fn build_scheduler(&self) -> FleetScheduler {
        let mut links: Vec<Arc<DeviceLink>> = Vec::new();
        for entry in &self.devices {
            let agent: Arc<dyn DeviceAgent> = match entry.recovery_command.split_first() {
                Some((program, args)) => Arc::new(CommandAgent::new(
                    entry.serial.clone(),
                    program.clone(),
                    args.to_vec(),
                )),
                None => Arc::new(UnrecoverableAgent {
                    serial: entry.serial.clone(),
                }),
            };
            if entry.hyper_count > 1 {
                links.extend(hyper_pool(
                    &entry.host,
                    entry.agent_port,
                    &entry.serial,
                    &entry.storefront,
                    entry.hyper_count,
                    agent,
                ));
            } else {
                links.push(DeviceLink::new(
                    entry.host.clone(),
                    entry.agent_port,
                    entry.serial.clone(),
                    entry.storefront.clone(),
                    agent,
                ));
            }
        }
        FleetScheduler::new(links, self.default_storefront.clone())
    }

    pub fn rip_config(&self) -> RipConfig {
        let defaults = RipConfig::default();
        RipConfig {
            concurrency_cap: self.concurrency_cap,
            download_retry: defaults.download_retry,
            decrypt: DecryptRetryConfig {
                recover_at: self.decrypt_recover_at,
                fatal_at: self.decrypt_fatal_at,
                max_connect_attempts: 3,
                backoff: RetryPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(500),
                    max_delay: Duration::from_secs(15),
                    jitter: true,
                },
            },
            fallback: CodecFallback {
                enabled: !self.codec_fallback.is_empty(),
                priority: self.codec_fallback.clone(),
            },
            caps: VariantCaps {
                alac_max: self.alac_max,
                atmos_max: self.atmos_max,
            },
            default_storefront: self.default_storefront.clone(),
            language: self.language.clone(),
        }
    }
}
