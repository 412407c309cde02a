//! Per-track acquisition sequencing and collection fan-out.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::assembler::{ContainerInspector, TrackAssembler};
use crate::catalog::{
    CatalogService, CollectionRef, MediaFetcher, StreamUrlOverride, TrackMetadata, TrackRef,
};
use crate::codec::Codec;
use crate::config::RipConfig;
use crate::decrypt::DecryptSession;
use crate::device::FleetScheduler;
use crate::error::RipError;
use crate::manifest::{build_key_set, select_variant};
use crate::post::{Encapsulator, FinishedTrack, IntegrityVerifier, OutputSink};
use crate::retry::{retry_with_backoff, RetryAction};
use crate::status::{CollectionReport, TrackReport, TrackState};

/// External services the pipeline drives. All out-of-scope mechanics (catalog
/// HTTP, media transforms, integrity tooling, filesystem policy) live behind
/// these.
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogService>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub inspector: Arc<dyn ContainerInspector>,
    pub encapsulator: Arc<dyn Encapsulator>,
    pub verifier: Arc<dyn IntegrityVerifier>,
    pub sink: Arc<dyn OutputSink>,
    pub stream_override: Option<Arc<dyn StreamUrlOverride>>,
}

enum Outcome {
    Saved(PathBuf),
    Exists(PathBuf),
}

/// Sequences one track through
/// metadata → variant → download → plan → decrypt → save → verify,
/// under the global concurrency cap, and fans collections out into
/// concurrent per-track tasks.
pub struct AcquisitionOrchestrator {
    config: RipConfig,
    scheduler: FleetScheduler,
    parts: Collaborators,
    slots: Arc<Semaphore>,
}

impl AcquisitionOrchestrator {
    pub fn new(config: RipConfig, scheduler: FleetScheduler, parts: Collaborators) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.concurrency_cap));
        Arc::new(Self {
            config,
            scheduler,
            parts,
            slots,
        })
    }

    fn enter(track: &TrackRef, state: TrackState) {
        info!(track = %track, state = %state, "pipeline state");
    }

    /// Acquire one track end to end. Never panics the caller's task: every
    /// error becomes a `Failed` report.
    ///
    /// A failed final integrity check reruns the whole pipeline exactly once;
    /// a second failure is terminal.
    pub async fn acquire_track(&self, track: &TrackRef, codec: Codec, force: bool) -> TrackReport {
        let first = self.run_pipeline(track, codec, force).await;
        let outcome = match first {
            Err(RipError::IntegrityCheckFailed { reason }) => {
                warn!(track = %track, reason, "integrity check failed, rerunning pipeline once");
                self.run_pipeline(track, codec, true).await
            }
            other => other,
        };
        match outcome {
            Ok(Outcome::Saved(path)) => {
                Self::enter(track, TrackState::Done);
                TrackReport::done(track.clone(), path)
            }
            Ok(Outcome::Exists(path)) => {
                Self::enter(track, TrackState::AlreadyExists);
                TrackReport::already_exists(track.clone(), path)
            }
            Err(err) => {
                error!(track = %track, error = %err, "track acquisition failed");
                Self::enter(track, TrackState::Failed);
                TrackReport::failed(track.clone(), err.to_string())
            }
        }
    }

    /// One full pipeline run. `force` skips the existence short-circuit
    /// (always set on the integrity-retry rerun, which must overwrite the
    /// bad artifact).
    async fn run_pipeline(
        &self,
        track: &TrackRef,
        requested: Codec,
        force: bool,
    ) -> Result<Outcome, RipError> {
        Self::enter(track, TrackState::Waiting);
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| RipError::internal("concurrency gate closed"))?;

        Self::enter(track, TrackState::Processing);
        let metadata = self
            .parts
            .catalog
            .track_metadata(track, &self.config.language)
            .await?;

        let manifest_url = self.resolve_manifest_url(track, &metadata).await?;
        let variants = self.parts.catalog.stream_variants(&manifest_url).await?;
        let (variant, codec) = select_variant(
            &variants,
            requested,
            &self.config.fallback,
            &self.config.caps,
        )?;

        let target = self.parts.sink.path_for(&metadata, codec);
        if !force && self.parts.sink.exists(&metadata, codec).await {
            return Ok(Outcome::Exists(target));
        }

        Self::enter(track, TrackState::Parsing);
        let source = self.parts.catalog.resolve_stream(&variant).await?;
        let keys = build_key_set(&source.key_uris, codec);

        Self::enter(track, TrackState::Downloading);
        let raw = retry_with_backoff(&self.config.download_retry, |_| {
            let url = source.container_url.clone();
            async move {
                match self.parts.fetcher.download(&url).await {
                    Ok(bytes) => RetryAction::Success(bytes),
                    Err(err) if err.is_retryable() => RetryAction::Retry(err),
                    Err(err) => RetryAction::Fail(err),
                }
            }
        })
        .await?;

        let plan = TrackAssembler::new(self.parts.inspector.as_ref()).plan(&raw, codec)?;

        Self::enter(track, TrackState::Decrypting);
        let link = self.scheduler.pick_link(&track.storefront)?;
        let session = DecryptSession::new(link, self.scheduler.ledger(), &self.config.decrypt);
        let plaintext = session.decrypt(&plan, &keys, &track.id).await?;

        Self::enter(track, TrackState::Saving);
        let (lyrics, cover) = self.fetch_extras(track, &metadata).await;
        let finished = FinishedTrack {
            track: track.clone(),
            metadata,
            codec,
            plaintext,
            decoder_config: plan.decoder_config.clone(),
            times: plan.times,
            lyrics,
            cover,
        };
        let bytes = self.parts.encapsulator.encapsulate(&finished).await?;
        let path = self.parts.sink.save(&finished, &bytes).await?;

        self.parts.verifier.verify(&path).await?;
        Ok(Outcome::Saved(path))
    }

    /// Side-channel override first, catalog manifest second.
    async fn resolve_manifest_url(
        &self,
        track: &TrackRef,
        metadata: &TrackMetadata,
    ) -> Result<String, RipError> {
        if let Some(override_source) = &self.parts.stream_override {
            if let Some(url) = override_source.manifest_for(track).await? {
                info!(track = %track, "using stream URL override");
                return Ok(url);
            }
        }
        metadata
            .manifest_url
            .clone()
            .ok_or_else(|| RipError::AudioUnavailable {
                track_id: track.id.clone(),
            })
    }

    /// Lyrics and cover are tagging niceties; failures are warnings, never
    /// fatal.
    async fn fetch_extras(
        &self,
        track: &TrackRef,
        metadata: &TrackMetadata,
    ) -> (Option<String>, Option<Bytes>) {
        let lyrics = match self
            .parts
            .catalog
            .lyrics(track, &self.config.language)
            .await
        {
            Ok(lyrics) => lyrics,
            Err(err) => {
                warn!(track = %track, error = %err, "lyrics fetch failed");
                None
            }
        };
        let cover = match &metadata.artwork_url {
            Some(url) => match self.parts.catalog.cover(url).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(track = %track, error = %err, "cover fetch failed");
                    None
                }
            },
            None => None,
        };
        (lyrics, cover)
    }

    /// Gather every member track of a collection, following `next` cursors.
    pub async fn expand_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<Vec<TrackRef>, RipError> {
        let mut tracks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .parts
                .catalog
                .collection_page(collection, cursor.as_deref(), &self.config.language)
                .await?;
            tracks.extend(page.tracks);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(
            kind = collection.kind.as_str(),
            id = %collection.id,
            tracks = tracks.len(),
            "collection expanded"
        );
        Ok(tracks)
    }

    /// Fan a collection out into one acquisition task per member. Children
    /// run concurrently under the global cap; a failing child never cancels
    /// its siblings, and the call returns only after every child finished.
    pub async fn rip_collection(
        self: &Arc<Self>,
        collection: &CollectionRef,
        codec: Codec,
        force: bool,
    ) -> Result<CollectionReport, RipError> {
        let tracks = self.expand_collection(collection).await?;
        let mut tasks = JoinSet::new();
        for track in tracks {
            let this = Arc::clone(self);
            tasks.spawn(async move { this.acquire_track(&track, codec, force).await });
        }

        let mut report = CollectionReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(track_report) => report.push(track_report),
                Err(err) => error!(error = %err, "acquisition task aborted"),
            }
        }
        report.log_summary();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CollectionKind;
    use crate::config::DecryptRetryConfig;
    use crate::decrypt::testutil::echo_oracle;
    use crate::device::testutil::RecordingAgent;
    use crate::device::DeviceLink;
    use crate::manifest::{StreamSource, Variant};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct FakeCatalog {
        page_size: usize,
        track_count: usize,
    }

    #[async_trait]
    impl CatalogService for FakeCatalog {
        async fn track_metadata(
            &self,
            track: &TrackRef,
            _language: &str,
        ) -> Result<TrackMetadata, RipError> {
            Ok(TrackMetadata {
                title: format!("Track {}", track.id),
                artist: "Artist".to_string(),
                album: "Album".to_string(),
                track_number: 1,
                manifest_url: Some("https://cdn.example.com/master.m3u8".to_string()),
                ..TrackMetadata::default()
            })
        }

        async fn stream_variants(&self, _manifest_url: &str) -> Result<Vec<Variant>, RipError> {
            Ok(vec![Variant {
                group_id: "audio-atmos-2768".to_string(),
                uri: "https://cdn.example.com/atmos/playlist.m3u8".to_string(),
                average_bandwidth: 2_768_000,
            }])
        }

        async fn resolve_stream(&self, variant: &Variant) -> Result<StreamSource, RipError> {
            Ok(StreamSource {
                container_url: "https://cdn.example.com/container.m4a".to_string(),
                key_uris: vec!["skd://itunes.apple.com/key-c24".to_string()],
                group_id: variant.group_id.clone(),
            })
        }

        async fn collection_page(
            &self,
            collection: &CollectionRef,
            cursor: Option<&str>,
            _language: &str,
        ) -> Result<crate::catalog::CollectionPage, RipError> {
            let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (offset + self.page_size).min(self.track_count);
            Ok(crate::catalog::CollectionPage {
                tracks: (offset..end)
                    .map(|i| TrackRef::new(format!("t{i}"), collection.storefront.clone()))
                    .collect(),
                next: (end < self.track_count).then(|| end.to_string()),
            })
        }

        async fn lyrics(
            &self,
            _track: &TrackRef,
            _language: &str,
        ) -> Result<Option<String>, RipError> {
            Ok(None)
        }

        async fn cover(&self, _artwork_url: &str) -> Result<Bytes, RipError> {
            Ok(Bytes::new())
        }
    }

    /// Fetcher double: counts downloads and tracks concurrent callers.
    struct FakeFetcher {
        downloads: AtomicUsize,
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
    }

    impl FakeFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                downloads: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn download(&self, _url: &str) -> Result<Bytes, RipError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"container"))
        }
    }

    struct FakeInspector;

    impl ContainerInspector for FakeInspector {
        fn fragment_headers(
            &self,
            _: &Bytes,
        ) -> Result<Vec<fmp4::FragmentHeader>, RipError> {
            Ok(vec![fmp4::FragmentHeader {
                description_index: 0,
                run_sample_counts: vec![2],
            }])
        }

        fn sample_table(&self, _: &Bytes) -> Result<Vec<fmp4::TableSample>, RipError> {
            Ok(vec![
                fmp4::TableSample {
                    number: 1,
                    duration: 1024,
                    data: Bytes::from_static(&[1; 16]),
                },
                fmp4::TableSample {
                    number: 2,
                    duration: 1024,
                    data: Bytes::from_static(&[2; 16]),
                },
            ])
        }

        fn decoder_config(
            &self,
            _: &Bytes,
            _: fmp4::DecoderConfigKind,
        ) -> Result<Option<Bytes>, RipError> {
            Ok(Some(Bytes::from_static(b"cfg")))
        }

        fn movie_timestamps(
            &self,
            _: &Bytes,
        ) -> Result<Option<fmp4::MacTimestamps>, RipError> {
            Ok(None)
        }
    }

    struct PassEncapsulator;

    #[async_trait]
    impl Encapsulator for PassEncapsulator {
        async fn encapsulate(&self, finished: &FinishedTrack) -> Result<Bytes, RipError> {
            Ok(finished.plaintext.clone())
        }
    }

    /// Verifier double scripted to fail the first `fail_first` calls.
    struct ScriptedVerifier {
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl ScriptedVerifier {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IntegrityVerifier for ScriptedVerifier {
        async fn verify(&self, _path: &Path) -> Result<(), RipError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(RipError::integrity("scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    /// In-memory sink.
    struct MemorySink {
        files: Mutex<HashMap<PathBuf, Bytes>>,
        preexisting: bool,
    }

    impl MemorySink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                files: Mutex::new(HashMap::new()),
                preexisting: false,
            })
        }

        fn preexisting() -> Arc<Self> {
            Arc::new(Self {
                files: Mutex::new(HashMap::new()),
                preexisting: true,
            })
        }
    }

    #[async_trait]
    impl OutputSink for MemorySink {
        fn path_for(&self, metadata: &TrackMetadata, codec: Codec) -> PathBuf {
            PathBuf::from(format!("/out/{}.{}", metadata.title, codec.file_suffix()))
        }

        async fn exists(&self, metadata: &TrackMetadata, codec: Codec) -> bool {
            self.preexisting
                || self
                    .files
                    .lock()
                    .contains_key(&self.path_for(metadata, codec))
        }

        async fn save(
            &self,
            finished: &FinishedTrack,
            bytes: &Bytes,
        ) -> Result<PathBuf, RipError> {
            let path = self.path_for(&finished.metadata, finished.codec);
            self.files.lock().insert(path.clone(), bytes.clone());
            Ok(path)
        }
    }

    async fn start_oracle() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(echo_oracle(stream));
                    }
                    Err(_) => break,
                }
            }
        });
        addr
    }

    struct Harness {
        orchestrator: Arc<AcquisitionOrchestrator>,
        fetcher: Arc<FakeFetcher>,
        verifier: Arc<ScriptedVerifier>,
    }

    async fn harness_with(
        cap: usize,
        fail_verifies: usize,
        sink: Arc<MemorySink>,
        catalog: FakeCatalog,
    ) -> Harness {
        let addr = start_oracle().await;
        let links = (0..4)
            .map(|k| {
                DeviceLink::new(
                    addr.ip().to_string(),
                    addr.port(),
                    format!("emu-{k}"),
                    "us",
                    RecordingAgent::new(),
                )
            })
            .collect();
        let scheduler = FleetScheduler::new(links, "us");

        let fetcher = FakeFetcher::new();
        let verifier = ScriptedVerifier::new(fail_verifies);
        let config = RipConfig {
            concurrency_cap: cap,
            download_retry: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
            decrypt: DecryptRetryConfig {
                backoff: RetryPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    jitter: false,
                },
                ..DecryptRetryConfig::default()
            },
            ..RipConfig::default()
        };
        let parts = Collaborators {
            catalog: Arc::new(catalog),
            fetcher: fetcher.clone(),
            inspector: Arc::new(FakeInspector),
            encapsulator: Arc::new(PassEncapsulator),
            verifier: verifier.clone(),
            sink,
            stream_override: None,
        };
        Harness {
            orchestrator: AcquisitionOrchestrator::new(config, scheduler, parts),
            fetcher,
            verifier,
        }
    }

    fn catalog() -> FakeCatalog {
        FakeCatalog {
            page_size: 100,
            track_count: 0,
        }
    }

    #[tokio::test]
    async fn single_track_reaches_done() {
        let h = harness_with(16, 0, MemorySink::new(), catalog()).await;
        let report = h
            .orchestrator
            .acquire_track(&TrackRef::new("song1", "us"), Codec::Ec3, false)
            .await;
        assert_eq!(report.state, TrackState::Done);
        assert_eq!(h.fetcher.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_output_short_circuits() {
        let h = harness_with(16, 0, MemorySink::preexisting(), catalog()).await;
        let report = h
            .orchestrator
            .acquire_track(&TrackRef::new("song1", "us"), Codec::Ec3, false)
            .await;
        assert_eq!(report.state, TrackState::AlreadyExists);
        assert_eq!(h.fetcher.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn integrity_failure_retries_once_then_succeeds() {
        let h = harness_with(16, 1, MemorySink::new(), catalog()).await;
        let report = h
            .orchestrator
            .acquire_track(&TrackRef::new("song1", "us"), Codec::Ec3, false)
            .await;
        assert_eq!(report.state, TrackState::Done);
        // Whole pipeline ran twice.
        assert_eq!(h.fetcher.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_integrity_failure_is_terminal() {
        let h = harness_with(16, 2, MemorySink::new(), catalog()).await;
        let report = h
            .orchestrator
            .acquire_track(&TrackRef::new("song1", "us"), Codec::Ec3, false)
            .await;
        assert_eq!(report.state, TrackState::Failed);
        // Exactly two runs; no third attempt.
        assert_eq!(h.fetcher.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn collection_fan_out_respects_concurrency_cap() {
        let cap = 3;
        let h = harness_with(
            cap,
            0,
            MemorySink::new(),
            FakeCatalog {
                page_size: 3,
                track_count: 8,
            },
        )
        .await;
        let collection = CollectionRef {
            kind: CollectionKind::Album,
            id: "album1".to_string(),
            storefront: "us".to_string(),
        };
        let report = h
            .orchestrator
            .rip_collection(&collection, Codec::Ec3, false)
            .await
            .unwrap();

        assert_eq!(report.reports.len(), 8);
        assert!(report.all_succeeded());
        assert!(h.fetcher.high_water.load(Ordering::SeqCst) <= cap);
    }
}
