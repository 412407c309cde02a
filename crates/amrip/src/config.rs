//! Engine configuration: concurrency caps, retry budgets, codec policy.

use std::time::Duration;

use crate::codec::Codec;
use crate::retry::RetryPolicy;

/// Escalation thresholds for per-sample decrypt failures, keyed off the
/// per-device failure count.
///
/// A count equal to `recover_at` triggers device recovery before the next
/// retry; a count at or beyond `fatal_at` makes the failure fatal for the
/// track. Everything below `fatal_at` (other than the recovery point) is a
/// plain retry.
#[derive(Debug, Clone)]
pub struct DecryptRetryConfig {
    pub recover_at: u32,
    pub fatal_at: u32,
    /// Attempts at establishing the oracle TCP connection per decrypt call.
    pub max_connect_attempts: u32,
    /// Backoff applied between whole-call retries.
    pub backoff: RetryPolicy,
}

impl Default for DecryptRetryConfig {
    fn default() -> Self {
        Self {
            recover_at: 3,
            fatal_at: 6,
            max_connect_attempts: 3,
            backoff: RetryPolicy {
                // max_retries is unused here; the ledger decides when to stop.
                max_retries: 0,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(15),
                jitter: true,
            },
        }
    }
}

/// Variant-selection bitrate ceilings (the group-id encodes the figure).
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantCaps {
    /// Maximum ALAC sample rate, e.g. 192000.
    pub alac_max: Option<u32>,
    /// Maximum Atmos bitrate, e.g. 2768.
    pub atmos_max: Option<u32>,
}

/// Alternative-codec fallback policy when the requested codec has no variant.
#[derive(Debug, Clone)]
pub struct CodecFallback {
    pub enabled: bool,
    pub priority: Vec<Codec>,
}

impl Default for CodecFallback {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: vec![Codec::Alac, Codec::Ec3, Codec::Aac],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RipConfig {
    /// Global cap on tracks simultaneously inside the heavy pipeline.
    pub concurrency_cap: usize,
    /// Retry budget for container downloads (length mismatches, network).
    pub download_retry: RetryPolicy,
    pub decrypt: DecryptRetryConfig,
    pub fallback: CodecFallback,
    pub caps: VariantCaps,
    /// Storefront whose devices serve requests for unmapped storefronts.
    pub default_storefront: String,
    /// Catalog response language.
    pub language: String,
}

impl Default for RipConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 16,
            download_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: true,
            },
            decrypt: DecryptRetryConfig::default(),
            fallback: CodecFallback::default(),
            caps: VariantCaps {
                alac_max: Some(192_000),
                atmos_max: Some(2768),
            },
            default_storefront: "us".to_string(),
            language: "en-US".to_string(),
        }
    }
}
