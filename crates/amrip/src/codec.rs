//! Codec identities, their stream-variant group-id patterns, and the key-URI
//! suffixes the license server attaches per codec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    Alac,
    Ec3,
    Ac3,
    Aac,
    AacBinaural,
    AacDownmix,
}

impl Codec {
    pub const ALL: [Codec; 6] = [
        Codec::Alac,
        Codec::Ec3,
        Codec::Ac3,
        Codec::Aac,
        Codec::AacBinaural,
        Codec::AacDownmix,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Alac => "alac",
            Codec::Ec3 => "ec3",
            Codec::Ac3 => "ac3",
            Codec::Aac => "aac",
            Codec::AacBinaural => "aac-binaural",
            Codec::AacDownmix => "aac-downmix",
        }
    }

    /// Anchored pattern matching this codec's stream-variant group ids.
    pub fn group_id_pattern(self) -> &'static str {
        match self {
            Codec::Alac => r"^audio-alac-stereo-\d{5,6}-\d{2}$",
            Codec::Ec3 => r"^audio-(atmos|ec3)-\d{4}$",
            Codec::Ac3 => r"^audio-ac3-\d{3}$",
            Codec::Aac => r"^audio-stereo-\d{3}$",
            Codec::AacBinaural => r"^audio-stereo-\d{3}-binaural$",
            Codec::AacDownmix => r"^audio-stereo-\d{3}-downmix$",
        }
    }

    /// Key-URI suffix the license server uses for this codec's content keys.
    pub fn key_suffix(self) -> &'static str {
        match self {
            Codec::Alac => "c23",
            Codec::Ec3 | Codec::Ac3 => "c24",
            Codec::Aac => "c22",
            Codec::AacBinaural | Codec::AacDownmix => "c24",
        }
    }

    /// Suffix shared by keys that apply regardless of codec.
    pub const DEFAULT_KEY_SUFFIX: &'static str = "c6";

    /// The decoder-configuration atom this codec needs for re-encapsulation,
    /// if any.
    pub fn decoder_config_kind(self) -> Option<fmp4::DecoderConfigKind> {
        match self {
            Codec::Alac => Some(fmp4::DecoderConfigKind::Alac),
            Codec::Aac | Codec::AacBinaural | Codec::AacDownmix => {
                Some(fmp4::DecoderConfigKind::Esds)
            }
            Codec::Ec3 | Codec::Ac3 => None,
        }
    }

    pub fn is_atmos(self) -> bool {
        matches!(self, Codec::Ec3 | Codec::Ac3)
    }

    /// Output file suffix when the decrypted stream is kept raw (Atmos) or
    /// re-encapsulated (everything else).
    pub fn file_suffix(self) -> &'static str {
        match self {
            Codec::Ec3 => "ec3",
            Codec::Ac3 => "ac3",
            _ => "m4a",
        }
    }

    /// Identify the codec a stream-variant group id belongs to.
    pub fn from_group_id(group_id: &str) -> Option<Codec> {
        // Order matters: the plain AAC pattern is a prefix of the
        // binaural/downmix ones but anchoring keeps them disjoint.
        Codec::ALL.into_iter().find(|codec| {
            regex::Regex::new(codec.group_id_pattern())
                .map(|re| re.is_match(group_id))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = RipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Codec::ALL
            .into_iter()
            .find(|codec| codec.as_str() == s)
            .ok_or_else(|| RipError::config(format!("unknown codec `{s}`")))
    }
}
