//! The single-item download pass.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, MetadataStore, SingleFlight};
use crate::download::filename;
use crate::download::{ConversionResult, DownloadError, DownloadResult, DownloadTarget};
use crate::download::{ProgressSender, ProgressUpdate};
use crate::ident::TrackId;
use crate::options::ResolvedOptions;
use crate::provider::{MediaProvider, ProviderError, TrackMetadata, choose_audio_format};
use crate::transcode::{ConvertOptions, Transcoder};

/// Slack allowed between a partial file's probed duration and the
/// metadata's expected duration before resume is refused.
const DURATION_TOLERANCE_SECS: f64 = 1.0;

/// Drives one identifier through the download state machine:
/// validate, resolve metadata, choose format, open output, stream,
/// optionally transcode, finalize.
///
/// All collaborators are injected; the downloader owns no network or
/// cache policy beyond sequencing them.
pub struct Downloader {
    provider: Arc<dyn MediaProvider>,
    store: Arc<dyn MetadataStore>,
    transcoder: Arc<dyn Transcoder>,
    flight: SingleFlight,
    cancel: CancellationToken,
    progress: Option<ProgressSender>,
}

impl Downloader {
    /// Creates a downloader over the given collaborators.
    #[must_use]
    pub fn new(
        provider: Arc<dyn MediaProvider>,
        store: Arc<dyn MetadataStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            provider,
            store,
            transcoder,
            flight: SingleFlight::new(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Attaches a cancellation token checked at every suspension point.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attaches a progress sink.
    #[must_use]
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Runs one complete pass for a target. Fails fast on the first
    /// typed error; a partial write left by a fresh-mode stream error is
    /// removed before returning.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for provider, I/O, conversion, or
    /// cancellation failures.
    pub async fn download(
        &self,
        target: &DownloadTarget,
        options: &ResolvedOptions,
    ) -> Result<DownloadResult, DownloadError> {
        let (metadata, used_cache) = self.resolve_metadata(&target.id, options).await?;
        let mut result = self
            .stream_target(target, &metadata, used_cache, options)
            .await?;
        if options.convert_audio {
            result.conversion = Some(self.convert(&result, options).await?);
        }
        self.notify_finished(&result);
        Ok(result)
    }

    /// Resolves an identifier to playable metadata, consulting the cache
    /// per policy when `options.use_cache` is set.
    ///
    /// Returns the metadata and whether it came from the cache. Expired
    /// entries are revalidated with an availability probe first; when the
    /// probe itself fails on the network, the stale entry is served as an
    /// explicit degraded fallback.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on fetch failure or cancellation. Cache
    /// read and write failures degrade to miss / no-op instead.
    pub async fn resolve_metadata(
        &self,
        id: &TrackId,
        options: &ResolvedOptions,
    ) -> Result<(TrackMetadata, bool), DownloadError> {
        // One in-flight fetch per identifier per process; concurrent
        // passes for the same id wait here and then hit the cache.
        let _slot = self.flight.acquire(id).await;

        if !options.use_cache {
            let metadata = self.fetch_playable(id).await?;
            return Ok((metadata, false));
        }

        let entry = match self.store.get(id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(id = %id, error = %e, "cache read failed, treating as miss");
                None
            }
        };

        let Some(entry) = entry else {
            let metadata = self.fetch_playable(id).await?;
            self.store_entry(&metadata).await;
            return Ok((metadata, false));
        };

        if !entry.has_expired(SystemTime::now()) {
            debug!(id = %id, "metadata cache hit");
            return Ok((entry.metadata, true));
        }

        debug!(id = %id, "cache entry expired, revalidating");
        match self.guard(self.provider.probe_available(id)).await {
            Ok(true) => {
                self.drop_entry(id).await;
                let metadata = self.fetch_playable(id).await?;
                self.store_entry(&metadata).await;
                Ok((metadata, false))
            }
            Ok(false) => {
                self.drop_entry(id).await;
                Err(ProviderError::Unavailable {
                    id: id.as_str().to_string(),
                }
                .into())
            }
            Err(DownloadError::Provider(e)) if e.is_network_failure() => {
                warn!(
                    id = %id,
                    error = %e,
                    "revalidation failed, serving stale cached metadata"
                );
                Ok((entry.metadata, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Streams the chosen format variant to disk: choose-format,
    /// open-output, stream. Conversion is a separate step so batch mode
    /// can record its failures independently.
    pub(crate) async fn stream_target(
        &self,
        target: &DownloadTarget,
        metadata: &TrackMetadata,
        used_cache: bool,
        options: &ResolvedOptions,
    ) -> Result<DownloadResult, DownloadError> {
        let format = choose_audio_format(metadata)?;
        let stem = target
            .output_stem
            .clone()
            .unwrap_or_else(|| filename::sanitize_stem(&metadata.title, target.id.as_str()));
        let output_path = options.out_dir.join(format!("{stem}.{}", format.container));

        tokio::fs::create_dir_all(&options.out_dir)
            .await
            .map_err(|e| DownloadError::io(&options.out_dir, e))?;

        let resume_from = if target.resume {
            self.resume_offset(&output_path, metadata).await
        } else {
            0
        };

        // A verified file that already spans the full variant needs no
        // stream; a range request at its end would only earn a 416.
        if resume_from > 0
            && let Some(total) = format.content_length
            && resume_from >= total
        {
            info!(
                id = %target.id,
                path = %output_path.display(),
                "existing file is already complete"
            );
            self.send(ProgressUpdate::Started {
                id: target.id.as_str().to_string(),
                title: metadata.title.clone(),
                total_bytes: format.content_length,
                resumed_from: resume_from,
            });
            return Ok(DownloadResult {
                id: target.id.clone(),
                output_path,
                used_cache,
                title: metadata.title.clone(),
                artist: metadata.artist.clone(),
                duration_seconds: metadata.duration_seconds,
                bytes_written: 0,
                resumed_from: resume_from,
                conversion: None,
            });
        }

        let mut file = if resume_from > 0 {
            info!(
                id = %target.id,
                offset = resume_from,
                path = %output_path.display(),
                "resuming partial download"
            );
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&output_path)
                .await
        } else {
            tokio::fs::File::create(&output_path).await
        }
        .map_err(|e| DownloadError::io(&output_path, e))?;

        self.send(ProgressUpdate::Started {
            id: target.id.as_str().to_string(),
            title: metadata.title.clone(),
            total_bytes: format.content_length,
            resumed_from: resume_from,
        });

        let resume_arg = (resume_from > 0).then_some(resume_from);
        let mut stream = self
            .guard(self.provider.open_stream(metadata, format, resume_arg))
            .await?;

        let mut written = resume_from;
        let mut fresh_bytes: u64 = 0;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Keep the partial file; a later resume pass can
                    // continue it from here. A failed flush means the
                    // file may be shorter than the bytes counted, which
                    // the resume duration check will catch.
                    if let Err(e) = file.flush().await {
                        warn!(
                            path = %output_path.display(),
                            error = %e,
                            "failed to flush partial file on interrupt"
                        );
                    }
                    info!(id = %target.id, "stream interrupted");
                    return Err(DownloadError::Interrupted);
                }
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(bytes)) => {
                        if let Err(e) = file.write_all(&bytes).await {
                            self.discard_partial(&output_path, resume_from).await;
                            return Err(DownloadError::io(&output_path, e));
                        }
                        written += bytes.len() as u64;
                        fresh_bytes += bytes.len() as u64;
                        self.send(ProgressUpdate::Advanced {
                            id: target.id.as_str().to_string(),
                            written,
                        });
                    }
                    Some(Err(e)) => {
                        self.discard_partial(&output_path, resume_from).await;
                        return Err(e.into());
                    }
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(&output_path, e))?;
        debug!(
            id = %target.id,
            bytes = fresh_bytes,
            path = %output_path.display(),
            "stream complete"
        );

        Ok(DownloadResult {
            id: target.id.clone(),
            output_path,
            used_cache,
            title: metadata.title.clone(),
            artist: metadata.artist.clone(),
            duration_seconds: metadata.duration_seconds,
            bytes_written: fresh_bytes,
            resumed_from: resume_from,
            conversion: None,
        })
    }

    /// Converts a completed stream file to the configured format and
    /// removes the original on success.
    pub(crate) async fn convert(
        &self,
        result: &DownloadResult,
        options: &ResolvedOptions,
    ) -> Result<ConversionResult, DownloadError> {
        let converted = result.output_path.with_extension(&options.format);
        if converted == result.output_path {
            debug!(path = %converted.display(), "already in target format, skipping conversion");
            return Ok(ConversionResult {
                output_path: converted,
            });
        }

        self.send(ProgressUpdate::Converting {
            id: result.id.as_str().to_string(),
        });
        let convert_options = ConvertOptions {
            format: options.format.clone(),
            codec: options.codec.clone(),
            channels: options.channels,
            bitrate_kbps: options.bitrate_kbps,
        };
        tokio::select! {
            () = self.cancel.cancelled() => return Err(DownloadError::Interrupted),
            outcome = self.transcoder.transcode(&result.output_path, &converted, &convert_options) => outcome?,
        }

        if let Err(e) = tokio::fs::remove_file(&result.output_path).await {
            warn!(
                path = %result.output_path.display(),
                error = %e,
                "failed to remove original after conversion"
            );
        }
        Ok(ConversionResult {
            output_path: converted,
        })
    }

    /// Emits the final progress event for a completed pass.
    pub(crate) fn notify_finished(&self, result: &DownloadResult) {
        let path = result
            .conversion
            .as_ref()
            .map_or(&result.output_path, |c| &c.output_path);
        self.send(ProgressUpdate::Finished {
            id: result.id.as_str().to_string(),
            output_path: path.clone(),
        });
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Byte offset to resume from: the existing file's length, but only
    /// when its probed duration matches the expected media duration.
    async fn resume_offset(&self, path: &Path, metadata: &TrackMetadata) -> u64 {
        let Ok(file_meta) = tokio::fs::metadata(path).await else {
            return 0;
        };
        if file_meta.len() == 0 {
            return 0;
        }
        match self.transcoder.probe_duration(path).await {
            Ok(duration)
                if (duration - metadata.duration_seconds).abs() <= DURATION_TOLERANCE_SECS =>
            {
                file_meta.len()
            }
            Ok(duration) => {
                debug!(
                    path = %path.display(),
                    probed = duration,
                    expected = metadata.duration_seconds,
                    "existing file duration mismatch, starting fresh"
                );
                0
            }
            Err(e) => {
                debug!(
                    path = %path.display(),
                    error = %e,
                    "could not probe existing file, starting fresh"
                );
                0
            }
        }
    }

    async fn fetch_playable(&self, id: &TrackId) -> Result<TrackMetadata, DownloadError> {
        info!(id = %id, "fetching metadata");
        let metadata = self.guard(self.provider.fetch_metadata(id)).await?;
        if !metadata.playable {
            return Err(ProviderError::Unavailable {
                id: id.as_str().to_string(),
            }
            .into());
        }
        Ok(metadata)
    }

    /// Cache writes are best effort; failure never fails the download.
    async fn store_entry(&self, metadata: &TrackMetadata) {
        let entry = CacheEntry::new(metadata.clone(), SystemTime::now());
        if let Err(e) = self.store.put(&entry).await {
            warn!(id = %entry.id, error = %e, "cache write failed, continuing without");
        }
    }

    async fn drop_entry(&self, id: &TrackId) {
        if let Err(e) = self.store.delete(id).await {
            warn!(id = %id, error = %e, "failed to drop expired cache entry");
        }
    }

    /// Fresh-mode partial writes are destroyed on stream error; resumed
    /// files keep their previously verified prefix.
    async fn discard_partial(&self, path: &Path, resume_from: u64) {
        if resume_from > 0 {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove partial file");
        }
    }

    /// Races a provider call against cancellation.
    async fn guard<T>(
        &self,
        operation: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, DownloadError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(DownloadError::Interrupted),
            outcome = operation => outcome.map_err(DownloadError::from),
        }
    }

    fn send(&self, update: ProgressUpdate) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(update);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::cache::MemoryStore;
    use crate::options::Verbosity;
    use crate::provider::{AudioFormat, MediaByteStream};
    use crate::transcode::ConversionError;

    struct FakeProvider {
        metadata: TrackMetadata,
        fetches: AtomicUsize,
        probes: AtomicUsize,
        probe_network_failure: bool,
        probe_gone: bool,
        chunks: Vec<Vec<u8>>,
        fail_stream: bool,
        hang_stream: bool,
        last_resume: Mutex<Option<Option<u64>>>,
    }

    impl FakeProvider {
        fn new(metadata: TrackMetadata) -> Self {
            Self {
                metadata,
                fetches: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                probe_network_failure: false,
                probe_gone: false,
                chunks: vec![b"hello ".to_vec(), b"world".to_vec()],
                fail_stream: false,
                hang_stream: false,
                last_resume: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl MediaProvider for FakeProvider {
        async fn fetch_metadata(&self, _id: &TrackId) -> Result<TrackMetadata, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.metadata.clone())
        }

        async fn probe_available(&self, _id: &TrackId) -> Result<bool, ProviderError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_network_failure {
                return Err(ProviderError::Timeout {
                    url: "http://fake".to_string(),
                });
            }
            Ok(!self.probe_gone)
        }

        async fn open_stream(
            &self,
            _metadata: &TrackMetadata,
            _format: &AudioFormat,
            resume_from: Option<u64>,
        ) -> Result<MediaByteStream, ProviderError> {
            *self.last_resume.lock().unwrap() = Some(resume_from);
            let mut items: Vec<Result<Vec<u8>, ProviderError>> =
                self.chunks.iter().cloned().map(Ok).collect();
            if self.fail_stream {
                items.push(Err(ProviderError::Timeout {
                    url: "http://fake".to_string(),
                }));
            }
            let base = futures_util::stream::iter(items);
            if self.hang_stream {
                Ok(Box::pin(base.chain(futures_util::stream::pending())))
            } else {
                Ok(Box::pin(base))
            }
        }
    }

    struct FakeTranscoder {
        probe: Option<f64>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeTranscoder {
        fn new() -> Self {
            Self {
                probe: None,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode(
            &self,
            input: &Path,
            output: &Path,
            _options: &ConvertOptions,
        ) -> Result<(), ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConversionError::Failed {
                    tool: "fake".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr_tail: "boom".to_string(),
                });
            }
            tokio::fs::copy(input, output).await.map_err(|e| {
                ConversionError::Spawn {
                    tool: "fake".to_string(),
                    source: e,
                }
            })?;
            Ok(())
        }

        async fn probe_duration(&self, _path: &Path) -> Result<f64, ConversionError> {
            self.probe.ok_or_else(|| ConversionError::BadOutput {
                tool: "fake".to_string(),
                detail: "no probe configured".to_string(),
            })
        }
    }

    fn sample_metadata() -> TrackMetadata {
        TrackMetadata {
            id: "dQw4w9WgXcQ".to_string(),
            title: "Test Title".to_string(),
            artist: Some("Tester".to_string()),
            duration_seconds: 10.0,
            playable: true,
            formats: vec![AudioFormat {
                format_id: "audio-hi".to_string(),
                container: "webm".to_string(),
                audio_only: true,
                bitrate_kbps: 160,
                url: "http://fake/audio-hi".to_string(),
                content_length: Some(11),
            }],
        }
    }

    fn test_options(out_dir: &Path) -> ResolvedOptions {
        ResolvedOptions {
            cwd: out_dir.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            format: "mp3".to_string(),
            codec: None,
            channels: None,
            bitrate_kbps: None,
            convert_audio: false,
            verbosity: Verbosity::Normal,
            use_cache: true,
        }
    }

    fn id() -> TrackId {
        TrackId::parse("dQw4w9WgXcQ").unwrap()
    }

    fn downloader(provider: FakeProvider, transcoder: FakeTranscoder) -> Downloader {
        Downloader::new(
            Arc::new(provider),
            Arc::new(MemoryStore::new()),
            Arc::new(transcoder),
        )
    }

    fn expired_entry() -> CacheEntry {
        CacheEntry {
            id: "dQw4w9WgXcQ".to_string(),
            fetched_at: 1_000,
            ttl_seconds: 7_200,
            metadata: sample_metadata(),
            playable: true,
        }
    }

    #[tokio::test]
    async fn test_download_writes_stream_to_file() {
        let temp = TempDir::new().unwrap();
        let dl = downloader(FakeProvider::new(sample_metadata()), FakeTranscoder::new());
        let options = test_options(temp.path());

        let result = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        assert_eq!(result.output_path, temp.path().join("Test Title.webm"));
        assert_eq!(
            std::fs::read(&result.output_path).unwrap(),
            b"hello world"
        );
        assert_eq!(result.bytes_written, 11);
        assert_eq!(result.resumed_from, 0);
        assert!(!result.used_cache);
        assert!(result.conversion.is_none());
    }

    #[tokio::test]
    async fn test_explicit_output_stem_overrides_title() {
        let temp = TempDir::new().unwrap();
        let dl = downloader(FakeProvider::new(sample_metadata()), FakeTranscoder::new());
        let options = test_options(temp.path());
        let target = DownloadTarget::new(id()).with_output_stem("my-song");

        let result = dl.download(&target, &options).await.unwrap();
        assert_eq!(result.output_path, temp.path().join("my-song.webm"));
    }

    #[tokio::test]
    async fn test_unplayable_fetch_is_error_and_never_cached() {
        let temp = TempDir::new().unwrap();
        let mut metadata = sample_metadata();
        metadata.playable = false;
        let store = Arc::new(MemoryStore::new());
        let dl = Downloader::new(
            Arc::new(FakeProvider::new(metadata)),
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            Arc::new(FakeTranscoder::new()),
        );
        let options = test_options(temp.path());

        let result = dl.download(&DownloadTarget::new(id()), &options).await;
        assert!(matches!(
            result,
            Err(DownloadError::Provider(ProviderError::Unavailable { .. }))
        ));
        assert!(store.get(&id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_download_hits_cache() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new(sample_metadata()));
        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::new(MemoryStore::new()),
            Arc::new(FakeTranscoder::new()),
        );
        let options = test_options(temp.path());

        let first = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();
        let second = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        assert!(!first.used_cache);
        assert!(second.used_cache);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_disabled_always_fetches() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new(sample_metadata()));
        let store = Arc::new(MemoryStore::new());
        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            Arc::new(FakeTranscoder::new()),
        );
        let mut options = test_options(temp.path());
        options.use_cache = false;

        dl.download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();
        dl.download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
        assert!(store.get(&id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_probe_failure_serves_stale() {
        let temp = TempDir::new().unwrap();
        let mut provider = FakeProvider::new(sample_metadata());
        provider.probe_network_failure = true;
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStore::new());
        store.put(&expired_entry()).await.unwrap();

        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            Arc::new(FakeTranscoder::new()),
        );
        let options = test_options(temp.path());

        let result = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        assert!(result.used_cache);
        assert_eq!(provider.probes.load(Ordering::SeqCst), 1);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_probe_ok_refetches() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new(sample_metadata()));
        let store = Arc::new(MemoryStore::new());
        store.put(&expired_entry()).await.unwrap();

        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            Arc::new(FakeTranscoder::new()),
        );
        let options = test_options(temp.path());

        let result = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        assert!(!result.used_cache);
        assert_eq!(provider.probes.load(Ordering::SeqCst), 1);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        let entry = store.get(&id()).await.unwrap().unwrap();
        assert!(!entry.has_expired(SystemTime::now()));
    }

    #[tokio::test]
    async fn test_expired_entry_probe_gone_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let mut provider = FakeProvider::new(sample_metadata());
        provider.probe_gone = true;
        let store = Arc::new(MemoryStore::new());
        store.put(&expired_entry()).await.unwrap();

        let dl = Downloader::new(
            Arc::new(provider),
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            Arc::new(FakeTranscoder::new()),
        );
        let options = test_options(temp.path());

        let result = dl.download(&DownloadTarget::new(id()), &options).await;
        assert!(matches!(
            result,
            Err(DownloadError::Provider(ProviderError::Unavailable { .. }))
        ));
        assert!(store.get(&id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_error_removes_fresh_partial_file() {
        let temp = TempDir::new().unwrap();
        let mut provider = FakeProvider::new(sample_metadata());
        provider.fail_stream = true;
        let dl = downloader(provider, FakeTranscoder::new());
        let options = test_options(temp.path());

        let result = dl.download(&DownloadTarget::new(id()), &options).await;
        assert!(matches!(result, Err(DownloadError::Provider(_))));
        assert!(!temp.path().join("Test Title.webm").exists());
    }

    #[tokio::test]
    async fn test_resume_appends_when_duration_matches() {
        let temp = TempDir::new().unwrap();
        let mut provider = FakeProvider::new(sample_metadata());
        provider.chunks = vec![b"rest".to_vec()];
        let provider = Arc::new(provider);
        let mut transcoder = FakeTranscoder::new();
        transcoder.probe = Some(10.0);

        std::fs::write(temp.path().join("Test Title.webm"), b"part").unwrap();

        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::new(MemoryStore::new()),
            Arc::new(transcoder),
        );
        let options = test_options(temp.path());
        let target = DownloadTarget::new(id()).with_resume(true);

        let result = dl.download(&target, &options).await.unwrap();

        assert_eq!(result.resumed_from, 4);
        assert_eq!(result.bytes_written, 4);
        assert_eq!(*provider.last_resume.lock().unwrap(), Some(Some(4)));
        assert_eq!(
            std::fs::read(temp.path().join("Test Title.webm")).unwrap(),
            b"partrest"
        );
    }

    #[tokio::test]
    async fn test_resume_complete_file_skips_the_stream() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new(sample_metadata()));
        let mut transcoder = FakeTranscoder::new();
        transcoder.probe = Some(10.0);

        // Full length (11 bytes) with a matching duration.
        std::fs::write(temp.path().join("Test Title.webm"), b"hello world").unwrap();

        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::new(MemoryStore::new()),
            Arc::new(transcoder),
        );
        let options = test_options(temp.path());
        let target = DownloadTarget::new(id()).with_resume(true);

        let result = dl.download(&target, &options).await.unwrap();

        assert_eq!(result.resumed_from, 11);
        assert_eq!(result.bytes_written, 0);
        // No stream was ever opened for the completed file.
        assert_eq!(*provider.last_resume.lock().unwrap(), None);
        assert_eq!(
            std::fs::read(temp.path().join("Test Title.webm")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_resume_truncates_on_duration_mismatch() {
        let temp = TempDir::new().unwrap();
        let mut provider = FakeProvider::new(sample_metadata());
        provider.chunks = vec![b"rest".to_vec()];
        let provider = Arc::new(provider);
        let mut transcoder = FakeTranscoder::new();
        transcoder.probe = Some(3.0);

        std::fs::write(temp.path().join("Test Title.webm"), b"part").unwrap();

        let dl = Downloader::new(
            Arc::clone(&provider) as Arc<dyn MediaProvider>,
            Arc::new(MemoryStore::new()),
            Arc::new(transcoder),
        );
        let options = test_options(temp.path());
        let target = DownloadTarget::new(id()).with_resume(true);

        let result = dl.download(&target, &options).await.unwrap();

        assert_eq!(result.resumed_from, 0);
        assert_eq!(*provider.last_resume.lock().unwrap(), Some(None));
        assert_eq!(
            std::fs::read(temp.path().join("Test Title.webm")).unwrap(),
            b"rest"
        );
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream_is_interrupted() {
        let temp = TempDir::new().unwrap();
        let mut provider = FakeProvider::new(sample_metadata());
        provider.hang_stream = true;
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dl = Downloader::new(
            Arc::new(provider),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeTranscoder::new()),
        )
        .with_cancellation(token.clone())
        .with_progress(tx);
        let options = test_options(temp.path());

        let handle = tokio::spawn(async move {
            dl.download(&DownloadTarget::new(id()), &options).await
        });

        // Cancel once all real chunks have landed and the stream hangs.
        while let Some(update) = rx.recv().await {
            if matches!(update, ProgressUpdate::Advanced { written: 11, .. }) {
                break;
            }
        }
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DownloadError::Interrupted)));
        // The partial file survives for a later resume.
        assert_eq!(
            std::fs::read(temp.path().join("Test Title.webm")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_convert_produces_artifact_and_removes_original() {
        let temp = TempDir::new().unwrap();
        let transcoder = Arc::new(FakeTranscoder::new());
        let dl = Downloader::new(
            Arc::new(FakeProvider::new(sample_metadata())),
            Arc::new(MemoryStore::new()),
            Arc::clone(&transcoder) as Arc<dyn Transcoder>,
        );
        let mut options = test_options(temp.path());
        options.convert_audio = true;

        let result = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        let conversion = result.conversion.unwrap();
        assert_eq!(conversion.output_path, temp.path().join("Test Title.mp3"));
        assert!(conversion.output_path.exists());
        assert!(!temp.path().join("Test Title.webm").exists());
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_convert_failure_propagates_in_single_mode() {
        let temp = TempDir::new().unwrap();
        let mut transcoder = FakeTranscoder::new();
        transcoder.fail = true;
        let dl = downloader(FakeProvider::new(sample_metadata()), transcoder);
        let mut options = test_options(temp.path());
        options.convert_audio = true;

        let result = dl.download(&DownloadTarget::new(id()), &options).await;
        assert!(matches!(result, Err(DownloadError::Conversion(_))));
        // The downloaded stream file is kept for a retry.
        assert!(temp.path().join("Test Title.webm").exists());
    }

    #[tokio::test]
    async fn test_convert_skipped_when_already_target_format() {
        let temp = TempDir::new().unwrap();
        let mut metadata = sample_metadata();
        metadata.formats[0].container = "mp3".to_string();
        let transcoder = Arc::new(FakeTranscoder::new());
        let dl = Downloader::new(
            Arc::new(FakeProvider::new(metadata)),
            Arc::new(MemoryStore::new()),
            Arc::clone(&transcoder) as Arc<dyn Transcoder>,
        );
        let mut options = test_options(temp.path());
        options.convert_audio = true;

        let result = dl
            .download(&DownloadTarget::new(id()), &options)
            .await
            .unwrap();

        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            result.conversion.unwrap().output_path,
            temp.path().join("Test Title.mp3")
        );
    }
}
