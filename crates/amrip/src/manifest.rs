//! Stream-variant records and selection policy.

use regex::Regex;
use tracing::warn;

use crate::codec::Codec;
use crate::config::{CodecFallback, VariantCaps};
use crate::error::RipError;
use crate::plan::KeySet;

/// One audio rendition advertised by a track's master manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Rendition group id, e.g. `audio-alac-stereo-44100-16`.
    pub group_id: String,
    /// Absolute URI of the rendition's media playlist.
    pub uri: String,
    pub average_bandwidth: u64,
}

/// Resolved stream for a selected variant: the single-file container URL and
/// the content-key URIs in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub container_url: String,
    pub key_uris: Vec<String>,
    pub group_id: String,
}

impl StreamSource {
    /// ALAC group ids embed `<sample-rate>-<bit-depth>`; recover them for
    /// tagging.
    pub fn alac_params(&self) -> Option<(u32, u32)> {
        let parts: Vec<&str> = self.group_id.split('-').collect();
        match parts.as_slice() {
            ["audio", "alac", "stereo", rate, depth] => {
                Some((rate.parse().ok()?, depth.parse().ok()?))
            }
            _ => None,
        }
    }
}

/// Find the best variant for one codec: pattern match, apply the bitrate
/// ceiling, then take the highest average bandwidth.
pub fn find_best_variant<'a>(
    variants: &'a [Variant],
    codec: Codec,
    caps: &VariantCaps,
) -> Option<&'a Variant> {
    let pattern = Regex::new(codec.group_id_pattern()).ok()?;
    let mut matching: Vec<&Variant> = variants
        .iter()
        .filter(|v| pattern.is_match(&v.group_id))
        .filter(|v| within_caps(&v.group_id, caps))
        .collect();
    matching.sort_by_key(|v| std::cmp::Reverse(v.average_bandwidth));
    matching.first().copied()
}

fn within_caps(group_id: &str, caps: &VariantCaps) -> bool {
    let parts: Vec<&str> = group_id.split('-').collect();
    if group_id.contains("alac") {
        if let (Some(max), Some(rate)) = (caps.alac_max, parts.get(3)) {
            return rate.parse::<u32>().map(|r| r <= max).unwrap_or(false);
        }
    } else if group_id.contains("atmos") {
        if let (Some(max), Some(rate)) = (caps.atmos_max, parts.get(2)) {
            return rate.parse::<u32>().map(|r| r <= max).unwrap_or(false);
        }
    }
    true
}

/// Select a variant for the requested codec, walking the configured fallback
/// priority when permitted. Returns the variant and the codec it actually
/// carries.
pub fn select_variant(
    variants: &[Variant],
    requested: Codec,
    fallback: &CodecFallback,
    caps: &VariantCaps,
) -> Result<(Variant, Codec), RipError> {
    if let Some(variant) = find_best_variant(variants, requested, caps) {
        return Ok((variant.clone(), requested));
    }

    if fallback.enabled {
        warn!(codec = %requested, "requested codec not present, trying fallback priority");
        for &candidate in &fallback.priority {
            if candidate == requested {
                continue;
            }
            if let Some(variant) = find_best_variant(variants, candidate, caps) {
                return Ok((variant.clone(), candidate));
            }
        }
    }

    Err(RipError::CodecNotFound { codec: requested })
}

/// Build the ordered key set for a resolved stream.
///
/// Index 0 is the reserved prefetch placeholder; manifest keys follow in
/// declaration order, filtered to this codec's suffix (or the codec-neutral
/// default suffix).
pub fn build_key_set(key_uris: &[String], codec: Codec) -> KeySet {
    let mut keys = KeySet::new();
    for uri in key_uris {
        if !uri.starts_with("skd://") {
            continue;
        }
        if uri.ends_with(codec.key_suffix()) || uri.ends_with(Codec::DEFAULT_KEY_SUFFIX) {
            keys.push(uri.clone());
        }
    }
    keys
}
