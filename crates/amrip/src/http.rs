//! HTTP-backed collaborators: the amp-api catalog client and the raw media
//! fetcher.
//!
//! Manifest and playlist parsing is kept in plain functions so it can be
//! exercised without a network.

use async_trait::async_trait;
use bytes::Bytes;
use m3u8_rs::Playlist;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, ORIGIN};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::catalog::{
    CatalogService, CollectionKind, CollectionPage, CollectionRef, MediaFetcher, TrackMetadata,
    TrackRef,
};
use crate::error::RipError;
use crate::manifest::{StreamSource, Variant};

const API_BASE: &str = "https://amp-api.music.apple.com";
const WEB_PLAYER: &str = "https://music.apple.com";
const COLLECTION_PAGE_LIMIT: u32 = 100;

/// Scrape the web player's anonymous bearer token from its bundled script.
pub async fn fetch_anonymous_token(client: &Client) -> Result<String, RipError> {
    let index = client
        .get(WEB_PLAYER)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let script_path = extract_script_path(&index)
        .ok_or_else(|| RipError::catalog("web player index carries no bundle script"))?;
    let script = client
        .get(format!("{WEB_PLAYER}{script_path}"))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    extract_bearer_token(&script)
        .ok_or_else(|| RipError::catalog("no bearer token in web player bundle"))
}

fn extract_script_path(index_html: &str) -> Option<String> {
    let re = Regex::new(r#"/assets/index-legacy-[^/"]+\.js|/assets/index-[^/"]+\.js"#).ok()?;
    re.find(index_html).map(|m| m.as_str().to_string())
}

fn extract_bearer_token(script: &str) -> Option<String> {
    let re = Regex::new(r#""(eyJh[^"]+)""#).ok()?;
    re.captures(script)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
struct ApiPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SongResource {
    id: String,
    attributes: Option<SongAttributes>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongAttributes {
    #[serde(default)]
    name: String,
    #[serde(default)]
    artist_name: String,
    #[serde(default)]
    album_name: String,
    track_number: Option<u32>,
    disc_number: Option<u32>,
    release_date: Option<String>,
    artwork: Option<Artwork>,
    extended_asset_urls: Option<ExtendedAssetUrls>,
}

#[derive(Debug, Deserialize)]
struct Artwork {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedAssetUrls {
    enhanced_hls: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LyricsResource {
    attributes: Option<LyricsAttributes>,
}

#[derive(Debug, Deserialize)]
struct LyricsAttributes {
    ttml: Option<String>,
}

/// amp-api catalog client.
pub struct HttpCatalog {
    client: Client,
}

impl HttpCatalog {
    /// Build a client around an already-obtained bearer token.
    pub fn new(bearer_token: &str, media_user_token: Option<&str>) -> Result<Self, RipError> {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(WEB_PLAYER));
        let auth = HeaderValue::from_str(&format!("Bearer {bearer_token}"))
            .map_err(|_| RipError::config("bearer token contains invalid header bytes"))?;
        headers.insert(AUTHORIZATION, auth);
        if let Some(token) = media_user_token {
            let value = HeaderValue::from_str(token)
                .map_err(|_| RipError::config("media user token contains invalid header bytes"))?;
            headers.insert("Media-User-Token", value);
        }
        let client = Client::builder().default_headers(headers).build()?;
        Ok(Self { client })
    }

    /// Scrape the anonymous token and build a client around it.
    pub async fn connect(media_user_token: Option<&str>) -> Result<Self, RipError> {
        let token = fetch_anonymous_token(&Client::new()).await?;
        Self::new(&token, media_user_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RipError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RipError::catalog(format!("{url} answered {status}")));
        }
        Ok(response.json().await?)
    }

    fn collection_endpoint(collection: &CollectionRef) -> String {
        let CollectionRef {
            kind,
            id,
            storefront,
        } = collection;
        match kind {
            CollectionKind::Album => {
                format!("{API_BASE}/v1/catalog/{storefront}/albums/{id}/tracks")
            }
            CollectionKind::Playlist => {
                format!("{API_BASE}/v1/catalog/{storefront}/playlists/{id}/tracks")
            }
            CollectionKind::Artist => {
                format!("{API_BASE}/v1/catalog/{storefront}/artists/{id}/songs")
            }
        }
    }
}

#[async_trait]
impl CatalogService for HttpCatalog {
    async fn track_metadata(
        &self,
        track: &TrackRef,
        language: &str,
    ) -> Result<TrackMetadata, RipError> {
        let url = format!(
            "{API_BASE}/v1/catalog/{}/songs/{}?l={language}&extend=extendedAssetUrls",
            track.storefront, track.id
        );
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RipError::NotInStorefront {
                track_id: track.id.clone(),
                storefront: track.storefront.clone(),
            });
        }
        if !response.status().is_success() {
            return Err(RipError::catalog(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        let page: ApiPage<SongResource> = response.json().await?;
        let song = page
            .data
            .into_iter()
            .next()
            .ok_or_else(|| RipError::NotInStorefront {
                track_id: track.id.clone(),
                storefront: track.storefront.clone(),
            })?;
        let attrs = song.attributes.unwrap_or_default();
        Ok(TrackMetadata {
            title: attrs.name,
            artist: attrs.artist_name,
            album: attrs.album_name,
            track_number: attrs.track_number.unwrap_or(0),
            disc_number: attrs.disc_number.unwrap_or(0),
            release_date: attrs.release_date,
            manifest_url: attrs
                .extended_asset_urls
                .and_then(|urls| urls.enhanced_hls),
            artwork_url: attrs.artwork.and_then(|a| a.url),
        })
    }

    async fn stream_variants(&self, manifest_url: &str) -> Result<Vec<Variant>, RipError> {
        let text = self
            .client
            .get(manifest_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        variants_from_master(manifest_url, &text)
    }

    async fn resolve_stream(&self, variant: &Variant) -> Result<StreamSource, RipError> {
        let text = self
            .client
            .get(&variant.uri)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        stream_from_media_playlist(variant, &text)
    }

    async fn collection_page(
        &self,
        collection: &CollectionRef,
        cursor: Option<&str>,
        language: &str,
    ) -> Result<CollectionPage, RipError> {
        let url = match cursor {
            // The `next` field is a path relative to the API host.
            Some(next) => format!("{API_BASE}{next}"),
            None => format!(
                "{}?l={language}&limit={COLLECTION_PAGE_LIMIT}",
                Self::collection_endpoint(collection)
            ),
        };
        let page: ApiPage<SongResource> = self.get_json(&url).await?;
        debug!(
            kind = collection.kind.as_str(),
            id = %collection.id,
            members = page.data.len(),
            has_next = page.next.is_some(),
            "collection page fetched"
        );
        Ok(CollectionPage {
            tracks: page
                .data
                .into_iter()
                .map(|song| TrackRef::new(song.id, collection.storefront.clone()))
                .collect(),
            next: page.next,
        })
    }

    async fn lyrics(&self, track: &TrackRef, language: &str) -> Result<Option<String>, RipError> {
        let url = format!(
            "{API_BASE}/v1/catalog/{}/songs/{}/lyrics?l={language}",
            track.storefront, track.id
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(track = %track, status = %response.status(), "lyrics unavailable");
            return Ok(None);
        }
        let page: ApiPage<LyricsResource> = response.json().await?;
        Ok(page
            .data
            .into_iter()
            .next()
            .and_then(|r| r.attributes)
            .and_then(|a| a.ttml))
    }

    async fn cover(&self, artwork_url: &str) -> Result<Bytes, RipError> {
        let url = artwork_template(artwork_url, 3000, 3000);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes)
    }
}

fn artwork_template(url: &str, width: u32, height: u32) -> String {
    url.replace("{w}", &width.to_string())
        .replace("{h}", &height.to_string())
}

/// Map a master playlist's variant streams to audio [`Variant`]s, resolving
/// playlist URIs against the manifest URL.
fn variants_from_master(manifest_url: &str, text: &str) -> Result<Vec<Variant>, RipError> {
    let base = Url::parse(manifest_url)
        .map_err(|e| RipError::invalid_url(manifest_url, e.to_string()))?;
    let master = m3u8_rs::parse_master_playlist_res(text.as_bytes())
        .map_err(|e| RipError::manifest(format!("master playlist: {e}")))?;

    let mut variants = Vec::new();
    for stream in master.variants {
        let Some(group_id) = stream.audio else {
            continue;
        };
        let uri = base
            .join(&stream.uri)
            .map_err(|e| RipError::invalid_url(&stream.uri, e.to_string()))?;
        variants.push(Variant {
            group_id,
            uri: uri.to_string(),
            average_bandwidth: stream.average_bandwidth.or(Some(stream.bandwidth)).unwrap_or(0),
        });
    }
    Ok(variants)
}

/// Resolve a rendition's media playlist into the single-file container URL
/// plus its content-key URIs in declaration order.
fn stream_from_media_playlist(variant: &Variant, text: &str) -> Result<StreamSource, RipError> {
    let base = Url::parse(&variant.uri)
        .map_err(|e| RipError::invalid_url(&variant.uri, e.to_string()))?;
    let playlist = match m3u8_rs::parse_playlist_res(text.as_bytes())
        .map_err(|e| RipError::manifest(format!("media playlist: {e}")))?
    {
        Playlist::MediaPlaylist(media) => media,
        Playlist::MasterPlaylist(_) => {
            return Err(RipError::manifest(
                "expected a media playlist, got a master playlist",
            ));
        }
    };

    let mut key_uris: Vec<String> = Vec::new();
    let mut container_uri: Option<String> = None;
    for segment in &playlist.segments {
        if let Some(uri) = segment.key.as_ref().and_then(|k| k.uri.clone()) {
            if !key_uris.contains(&uri) {
                key_uris.push(uri);
            }
        }
        // Single-file streams reference the container through the init map;
        // segment URIs all point at byte ranges of the same file.
        if container_uri.is_none() {
            if let Some(map) = &segment.map {
                container_uri = Some(map.uri.clone());
            } else {
                container_uri = Some(segment.uri.clone());
            }
        }
    }
    let container_uri =
        container_uri.ok_or_else(|| RipError::manifest("media playlist has no segments"))?;
    let container_url = base
        .join(&container_uri)
        .map_err(|e| RipError::invalid_url(&container_uri, e.to_string()))?;

    Ok(StreamSource {
        container_url: container_url.to_string(),
        key_uris,
        group_id: variant.group_id.clone(),
    })
}

/// Raw media downloader with server-declared length verification.
pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpMediaFetcher {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn download(&self, url: &str) -> Result<Bytes, RipError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let declared = response.content_length();
        let body = response.bytes().await?;
        if let Some(expected) = declared {
            let actual = body.len() as u64;
            if expected != actual {
                return Err(RipError::LengthMismatch { expected, actual });
            }
        }
        debug!(url, bytes = body.len(), "container downloaded");
        Ok(body)
    }
}
