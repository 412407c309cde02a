//! Catalog records and the collaborator contracts the pipeline consumes.
//!
//! The remote catalog, the media downloader, and the stream-URL override
//! side channel are all external services from the coordinator's point of
//! view; they appear here only as typed traits.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RipError;
use crate::manifest::{StreamSource, Variant};

/// Identity of one track acquisition: catalog id plus storefront.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackRef {
    pub id: String,
    pub storefront: String,
}

impl TrackRef {
    pub fn new(id: impl Into<String>, storefront: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            storefront: storefront.into(),
        }
    }
}

impl std::fmt::Display for TrackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.storefront, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Album,
    Playlist,
    Artist,
}

impl CollectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Album => "album",
            CollectionKind::Playlist => "playlist",
            CollectionKind::Artist => "artist",
        }
    }
}

/// A multi-track catalog entity to fan out over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub kind: CollectionKind,
    pub id: String,
    pub storefront: String,
}

/// Catalog metadata for one track, as much of it as the pipeline needs.
///
/// Tagging-oriented fields ride along untouched; the coordinator itself only
/// reads `manifest_url`.
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: u32,
    pub disc_number: u32,
    pub release_date: Option<String>,
    /// Master stream manifest URL. Absent when the catalog offers no audio
    /// for this track in this storefront.
    pub manifest_url: Option<String>,
    /// Artwork URL template with `{w}x{h}` placeholders.
    pub artwork_url: Option<String>,
}

/// One page of collection members plus the cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct CollectionPage {
    pub tracks: Vec<TrackRef>,
    pub next: Option<String>,
}

/// Remote catalog service.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn track_metadata(
        &self,
        track: &TrackRef,
        language: &str,
    ) -> Result<TrackMetadata, RipError>;

    /// Fetch a master manifest and list its audio renditions.
    async fn stream_variants(&self, manifest_url: &str) -> Result<Vec<Variant>, RipError>;

    /// Fetch a rendition's media playlist and resolve the single-file
    /// container URL plus its content-key URIs in declaration order.
    async fn resolve_stream(&self, variant: &Variant) -> Result<StreamSource, RipError>;

    /// One page of a collection's members; pass the previous page's `next`
    /// cursor to continue.
    async fn collection_page(
        &self,
        collection: &CollectionRef,
        cursor: Option<&str>,
        language: &str,
    ) -> Result<CollectionPage, RipError>;

    /// Time-synced or plain lyrics, when the catalog has them.
    async fn lyrics(&self, track: &TrackRef, language: &str) -> Result<Option<String>, RipError>;

    /// Cover art bytes for an artwork URL template.
    async fn cover(&self, artwork_url: &str) -> Result<Bytes, RipError>;
}

/// Raw media downloader. Implementations must fail with
/// [`RipError::LengthMismatch`] when the body does not match the
/// server-declared total length.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn download(&self, url: &str) -> Result<Bytes, RipError>;
}

/// Optional side channel consulted for a stream manifest URL before the
/// catalog-provided one is used.
#[async_trait]
pub trait StreamUrlOverride: Send + Sync {
    /// `Ok(None)` means no override for this track; the caller falls back to
    /// the catalog manifest.
    async fn manifest_for(&self, track: &TrackRef) -> Result<Option<String>, RipError>;
}
