//! Store-URL parsing: maps catalog web URLs onto rip targets.

use amrip_engine::{CollectionKind, CollectionRef, RipError, TrackRef};
use url::Url;

/// What the user asked to rip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RipTarget {
    Song(TrackRef),
    Collection(CollectionRef),
}

/// Parse a `music.apple.com` URL.
///
/// Supported forms (`{sf}` is the storefront path segment):
/// - `/{sf}/song/{slug}/{id}`
/// - `/{sf}/album/{slug}/{id}` and the `?i={song-id}` single-song variant
/// - `/{sf}/playlist/{slug}/{id}`
/// - `/{sf}/artist/{slug}/{id}`
pub fn parse_input(input: &str) -> Result<RipTarget, RipError> {
    let url = Url::parse(input).map_err(|e| RipError::invalid_url(input, e.to_string()))?;
    if url.host_str() != Some("music.apple.com") {
        return Err(RipError::invalid_url(input, "not a music.apple.com URL"));
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let (storefront, kind, id) = match segments.as_slice() {
        [sf, kind, _slug, id] => (*sf, *kind, *id),
        // Slug-less form.
        [sf, kind, id] => (*sf, *kind, *id),
        _ => {
            return Err(RipError::invalid_url(
                input,
                "expected /{storefront}/{kind}/{slug}/{id}",
            ));
        }
    };

    let song_override = url
        .query_pairs()
        .find(|(k, _)| k == "i")
        .map(|(_, v)| v.to_string());

    match kind {
        "song" => Ok(RipTarget::Song(TrackRef::new(id, storefront))),
        "album" => match song_override {
            Some(song_id) => Ok(RipTarget::Song(TrackRef::new(song_id, storefront))),
            None => Ok(RipTarget::Collection(CollectionRef {
                kind: CollectionKind::Album,
                id: id.to_string(),
                storefront: storefront.to_string(),
            })),
        },
        "playlist" => Ok(RipTarget::Collection(CollectionRef {
            kind: CollectionKind::Playlist,
            id: id.to_string(),
            storefront: storefront.to_string(),
        })),
        "artist" => Ok(RipTarget::Collection(CollectionRef {
            kind: CollectionKind::Artist,
            id: id.to_string(),
            storefront: storefront.to_string(),
        })),
        other => Err(RipError::invalid_url(
            input,
            format!("unsupported content kind `{other}`"),
        )),
    }
}
