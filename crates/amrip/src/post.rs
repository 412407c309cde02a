//! Post-decrypt collaborators: re-encapsulation, integrity checking, and the
//! output sink. The media transforms themselves live behind these traits;
//! the pipeline only sequences them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::catalog::{TrackMetadata, TrackRef};
use crate::codec::Codec;
use crate::error::RipError;
use crate::plan::MovieTimes;

/// Everything the post-processing stage needs for one decrypted track.
pub struct FinishedTrack {
    pub track: TrackRef,
    pub metadata: TrackMetadata,
    pub codec: Codec,
    pub plaintext: Bytes,
    pub decoder_config: Option<Bytes>,
    pub times: Option<MovieTimes>,
    pub lyrics: Option<String>,
    pub cover: Option<Bytes>,
}

/// Remuxes the decrypted elementary stream into its delivery container and
/// applies tags.
#[async_trait]
pub trait Encapsulator: Send + Sync {
    async fn encapsulate(&self, finished: &FinishedTrack) -> Result<Bytes, RipError>;
}

/// No-op encapsulator for codecs delivered as raw elementary streams
/// (Atmos/AC-3) or when remuxing is handled elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncapsulator;

#[async_trait]
impl Encapsulator for PassthroughEncapsulator {
    async fn encapsulate(&self, finished: &FinishedTrack) -> Result<Bytes, RipError> {
        Ok(finished.plaintext.clone())
    }
}

/// Post-save integrity check over the finished artifact.
#[async_trait]
pub trait IntegrityVerifier: Send + Sync {
    async fn verify(&self, path: &Path) -> Result<(), RipError>;
}

/// Decodes the artifact to the null muxer; any decode error fails the check.
pub struct FfmpegVerifier {
    program: String,
}

impl FfmpegVerifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegVerifier {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl IntegrityVerifier for FfmpegVerifier {
    async fn verify(&self, path: &Path) -> Result<(), RipError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(path)
            .arg("-f")
            .arg("null")
            .arg("-")
            .output()
            .await
            .map_err(|e| {
                RipError::integrity(format!("failed to spawn `{}`: {e}", self.program))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RipError::integrity(format!(
                "decode check exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        debug!(path = %path.display(), "integrity check passed");
        Ok(())
    }
}

/// Decides where finished tracks live and writes them there.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Target path for a track, used for the existence short-circuit.
    fn path_for(&self, metadata: &TrackMetadata, codec: Codec) -> PathBuf;

    async fn exists(&self, metadata: &TrackMetadata, codec: Codec) -> bool;

    /// Write the finished bytes; returns the path written.
    async fn save(&self, finished: &FinishedTrack, bytes: &Bytes) -> Result<PathBuf, RipError>;
}

/// Filesystem sink with an `artist/album/NN TITLE.ext` layout.
pub struct FsOutputSink {
    root: PathBuf,
}

impl FsOutputSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Replace path-hostile characters so catalog strings can become file names.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl OutputSink for FsOutputSink {
    fn path_for(&self, metadata: &TrackMetadata, codec: Codec) -> PathBuf {
        let file = format!(
            "{:02} {}.{}",
            metadata.track_number,
            sanitize(&metadata.title),
            codec.file_suffix()
        );
        self.root
            .join(sanitize(&metadata.artist))
            .join(sanitize(&metadata.album))
            .join(file)
    }

    async fn exists(&self, metadata: &TrackMetadata, codec: Codec) -> bool {
        tokio::fs::try_exists(self.path_for(metadata, codec))
            .await
            .unwrap_or(false)
    }

    async fn save(&self, finished: &FinishedTrack, bytes: &Bytes) -> Result<PathBuf, RipError> {
        let path = self.path_for(&finished.metadata, finished.codec);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), bytes = bytes.len(), "track saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> TrackMetadata {
        TrackMetadata {
            title: "Song: A/B?".to_string(),
            artist: "Some Artist".to_string(),
            album: "An Album.".to_string(),
            track_number: 3,
            ..TrackMetadata::default()
        }
    }

    fn finished(bytes: &'static [u8]) -> FinishedTrack {
        FinishedTrack {
            track: TrackRef::new("12345", "us"),
            metadata: metadata(),
            codec: Codec::Alac,
            plaintext: Bytes::from_static(bytes),
            decoder_config: None,
            times: None,
            lyrics: None,
            cover: None,
        }
    }

    #[test]
    fn path_layout_sanitizes_catalog_strings() {
        let sink = FsOutputSink::new("/music");
        let path = sink.path_for(&metadata(), Codec::Alac);
        assert_eq!(
            path,
            PathBuf::from("/music/Some Artist/An Album/03 Song_ A_B_.m4a")
        );
    }

    #[tokio::test]
    async fn save_then_exists_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsOutputSink::new(dir.path());
        let finished = finished(b"plaintext");

        assert!(!sink.exists(&finished.metadata, finished.codec).await);
        let path = sink.save(&finished, &finished.plaintext).await.unwrap();
        assert!(sink.exists(&finished.metadata, finished.codec).await);
        assert_eq!(std::fs::read(path).unwrap(), b"plaintext");
    }

    #[tokio::test]
    async fn passthrough_returns_plaintext_unchanged() {
        let finished = finished(b"raw-ec3");
        let out = PassthroughEncapsulator
            .encapsulate(&finished)
            .await
            .unwrap();
        assert_eq!(out, finished.plaintext);
    }
}
