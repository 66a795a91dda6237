//! Media upload job pipeline
//!
//! An uploaded file lands at `unprocessed_media/{job_id}` with a Ready job.
//! Processing measures and shrinks it, stores the canonical copy and any
//! per-platform variants under a new media id, records the [`UploadedMedia`]
//! and marks the job Success or Failed. Jobs are processed one at a time,
//! whether they arrive through a notification or the periodic sweep. Blob
//! reads and writes are retried per the ingestor's [`RetryPolicy`].

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{MediaError, Result, ThreadcastError};
use crate::resilience::RetryPolicy;
use crate::storage::{media_key, media_variant_key, unprocessed_key, BlobStore};
use crate::transcoder::{image_dimensions, MediaTranscoder};
use crate::types::{MediaJobState, MediaKind, MediaUploadJob, PlatformFlags, SocialPlatform, UploadedMedia};

pub struct MediaIngestor {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    transcoder: MediaTranscoder,
    retry: RetryPolicy,
    permit: Semaphore,
}

impl MediaIngestor {
    pub fn new(db: Database, blobs: Arc<dyn BlobStore>, transcoder: MediaTranscoder) -> Self {
        Self {
            db,
            blobs,
            transcoder,
            retry: RetryPolicy::default(),
            permit: Semaphore::new(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.permit
            .acquire()
            .await
            .map_err(|_| ThreadcastError::InvalidInput("media ingestor is shut down".to_string()))
    }

    /// Process every Ready job. Returns how many were processed.
    pub async fn process_ready_jobs(&self) -> Result<usize> {
        let _permit = self.acquire().await?;
        let jobs = self.db.find_media_jobs_by_state(MediaJobState::Ready).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        info!("Processing {} waiting media job(s)", jobs.len());
        let mut processed = 0;
        for job in jobs {
            let job_id = job.id.clone();
            match self.process_job(job).await {
                Ok(_) => processed += 1,
                Err(e) => error!(job_id = %job_id, "Failed to record media job outcome: {}", e),
            }
        }
        Ok(processed)
    }

    /// Process the job with `job_id` if it is still Ready
    pub async fn process_notified(&self, job_id: &str) -> Result<()> {
        let _permit = self.acquire().await?;
        let job = self
            .db
            .get_media_job(job_id)
            .await?
            .ok_or_else(|| ThreadcastError::NotFound(format!("media job {}", job_id)))?;

        if job.state != MediaJobState::Ready {
            debug!(job_id, "Media job already {}, ignoring notification", job.state.as_str());
            return Ok(());
        }
        self.process_job(job).await?;
        Ok(())
    }

    /// Process job ids as they arrive on `jobs`, one task per id
    pub fn listen(self: Arc<Self>, mut jobs: mpsc::Receiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job_id) = jobs.recv().await {
                let ingestor = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = ingestor.process_notified(&job_id).await {
                        error!(job_id = %job_id, "Media job notification failed: {}", e);
                    }
                });
            }
            debug!("Media job channel closed");
        })
    }

    /// Forward job ids read from connections on `listener` to `jobs`.
    ///
    /// Each connection carries one job id per line. The task ends when the
    /// receiving side of `jobs` is dropped.
    pub fn serve_notifications(listener: TcpListener, jobs: mpsc::Sender<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept media job notification: {}", e);
                            continue;
                        }
                    },
                    _ = jobs.closed() => break,
                };

                let jobs = jobs.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => {
                                let job_id = line.trim();
                                if job_id.is_empty() {
                                    continue;
                                }
                                debug!(%peer, job_id, "Media job ready notification");
                                if jobs.send(job_id.to_string()).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(%peer, "Media job notification stream failed: {}", e);
                                break;
                            }
                        }
                    }
                });
            }
            debug!("Media job notification listener stopped");
        })
    }

    /// Run one job to completion and persist its final state.
    ///
    /// Processing failures are recorded on the job; the error case is
    /// reserved for failing to persist it.
    pub async fn process_job(&self, mut job: MediaUploadJob) -> Result<MediaUploadJob> {
        info!(job_id = %job.id, name = %job.name, "Processing media job");
        let unprocessed = unprocessed_key(&job.id);

        match self.ingest(&job, &unprocessed).await {
            Ok(media) => {
                info!(job_id = %job.id, media_id = %media.id, "Finished processing media job");
                job.state = MediaJobState::Success;
                job.media_id = Some(media.id);
                job.error_detail = None;
            }
            Err(e) => {
                error!(job_id = %job.id, "Media job failed: {}", e);
                job.state = MediaJobState::Failed;
                job.error_detail = Some(format!("failed to process the media: {}", e));
            }
        }

        let deleted = self
            .retry
            .run("unprocessed media delete", || self.blobs.delete(&unprocessed))
            .await;
        if let Err(e) = deleted {
            warn!(job_id = %job.id, "Failed to delete unprocessed media: {}", e);
            if let Some(detail) = job.error_detail.as_mut() {
                detail.push_str(&format!(
                    " (additionally, deleting the unprocessed media failed: {})",
                    e
                ));
            }
        }

        self.db.replace_media_job(&job).await?;
        Ok(job)
    }

    async fn ingest(&self, job: &MediaUploadJob, unprocessed: &str) -> Result<UploadedMedia> {
        let data = self
            .retry
            .run("unprocessed media download", || self.blobs.get(unprocessed))
            .await?;
        let kind = MediaKind::from_mime_str(&job.mime_type)
            .ok_or_else(|| MediaError::UnsupportedMimeType(job.mime_type.clone()))?;

        let mut media = UploadedMedia {
            id: Uuid::new_v4().to_string(),
            name: job.name.clone(),
            alt_text: job.alt_text.clone(),
            mime_type: job.mime_type.clone(),
            width: 0,
            height: 0,
            optimized: PlatformFlags::default(),
        };

        let (canonical, variants, variant_type): (Vec<u8>, BTreeMap<SocialPlatform, Vec<u8>>, &str) =
            match kind {
                // Re-encoding would drop the animation
                MediaKind::Gif => {
                    (media.width, media.height) = image_dimensions(&data)?;
                    (data, BTreeMap::new(), "image/gif")
                }
                MediaKind::Image => {
                    let output = self.transcoder.optimize_image(data.clone()).await?;
                    media.width = output.width;
                    media.height = output.height;
                    (data, output.variants, "image/jpeg")
                }
                MediaKind::Video => {
                    let output = self.transcoder.process_video(&data).await?;
                    for (platform, reason) in &output.failures {
                        warn!(job_id = %job.id, platform = %platform, "No video variant: {}", reason);
                    }
                    media.mime_type = "video/mp4".to_string();
                    media.width = output.info.width;
                    media.height = output.info.height;
                    (output.canonical, output.variants, "video/mp4")
                }
            };

        let key = media_key(&media.id);
        self.retry
            .run("media upload", || self.blobs.put(&key, &canonical, &media.mime_type))
            .await?;
        for (platform, bytes) in &variants {
            let key = media_variant_key(&media.id, *platform);
            self.retry
                .run("media variant upload", || self.blobs.put(&key, bytes, variant_type))
                .await?;
            media.optimized.set(*platform, true);
            debug!(
                media_id = %media.id,
                platform = %platform,
                "Stored {} byte variant",
                bytes.len()
            );
        }

        self.db.insert_media(&media).await?;
        Ok(media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::storage::test_support::FlakyBlobStore;
    use crate::storage::MemoryBlobStore;
    use crate::transcoder::tests::noisy_png;
    use crate::transcoder::PlatformBudgets;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    struct Harness {
        _dir: TempDir,
        db: Database,
        blobs: Arc<MemoryBlobStore>,
        ingestor: Arc<MediaIngestor>,
    }

    async fn harness(budgets: PlatformBudgets) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("ingest.db").to_str().unwrap())
            .await
            .unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let ingestor = Arc::new(MediaIngestor::new(
            db.clone(),
            blobs.clone(),
            MediaTranscoder::with_budgets(&MediaConfig::default(), budgets),
        ));
        Harness {
            _dir: dir,
            db,
            blobs,
            ingestor,
        }
    }

    async fn upload(h: &Harness, mime: &str, data: &[u8]) -> MediaUploadJob {
        let mut job = MediaUploadJob::new("upload", mime);
        job.alt_text = "a cat".to_string();
        h.blobs
            .put(&unprocessed_key(&job.id), data, mime)
            .await
            .unwrap();
        h.db.insert_media_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_small_image_has_no_variants() {
        let h = harness(PlatformBudgets::default()).await;
        let png = noisy_png(8, 6);
        let job = upload(&h, "image/png", &png).await;

        let done = h.ingestor.process_job(job.clone()).await.unwrap();
        assert_eq!(done.state, MediaJobState::Success);

        let media = h
            .db
            .get_media(done.media_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((media.width, media.height), (8, 6));
        assert_eq!(media.alt_text, "a cat");
        assert_eq!(media.optimized, PlatformFlags::default());
        assert_eq!(h.blobs.get(&media_key(&media.id)).await.unwrap(), png);
        assert!(!h.blobs.exists(&unprocessed_key(&job.id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_image_gets_jpeg_variants() {
        let png = noisy_png(96, 96);
        let mut budgets = PlatformBudgets::uniform(u64::MAX, u64::MAX);
        budgets.bluesky.image = (png.len() / 2) as u64;
        let h = harness(budgets).await;
        let job = upload(&h, "image/png", &png).await;

        let done = h.ingestor.process_job(job).await.unwrap();
        let media = h
            .db
            .get_media(done.media_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();

        assert!(media.optimized.bluesky);
        assert!(!media.optimized.twitter);
        let variant_key = media_variant_key(&media.id, SocialPlatform::Bluesky);
        let variant = h.blobs.get(&variant_key).await.unwrap();
        assert!(variant.len() <= png.len() / 2);
        assert_eq!(
            h.blobs.content_type(&variant_key).await.as_deref(),
            Some("image/jpeg")
        );
    }

    #[tokio::test]
    async fn test_unsupported_mime_fails_job_and_cleans_up() {
        let h = harness(PlatformBudgets::default()).await;
        let job = upload(&h, "application/pdf", b"%PDF-1.7").await;

        let done = h.ingestor.process_job(job.clone()).await.unwrap();
        assert_eq!(done.state, MediaJobState::Failed);
        assert!(done
            .error_detail
            .as_deref()
            .unwrap()
            .contains("Unsupported mime type: application/pdf"));
        assert!(done.media_id.is_none());
        assert!(!h.blobs.exists(&unprocessed_key(&job.id)).await.unwrap());

        let stored = h.db.get_media_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MediaJobState::Failed);
    }

    #[tokio::test]
    async fn test_missing_upload_fails_job() {
        let h = harness(PlatformBudgets::default()).await;
        let job = MediaUploadJob::new("lost", "image/png");
        h.db.insert_media_job(&job).await.unwrap();

        let done = h.ingestor.process_job(job).await.unwrap();
        assert_eq!(done.state, MediaJobState::Failed);
    }

    #[tokio::test]
    async fn test_process_ready_jobs_skips_finished() {
        let h = harness(PlatformBudgets::default()).await;
        upload(&h, "image/png", &noisy_png(4, 4)).await;
        upload(&h, "image/png", &noisy_png(5, 5)).await;
        let mut finished = MediaUploadJob::new("done", "image/png");
        finished.state = MediaJobState::Success;
        h.db.insert_media_job(&finished).await.unwrap();

        assert_eq!(h.ingestor.process_ready_jobs().await.unwrap(), 2);
        assert_eq!(h.ingestor.process_ready_jobs().await.unwrap(), 0);
        assert_eq!(
            h.db.find_media_jobs_by_state(MediaJobState::Success)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_transient_storage_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("ingest.db").to_str().unwrap())
            .await
            .unwrap();
        let blobs = Arc::new(FlakyBlobStore::new(1, 1));
        let ingestor = MediaIngestor::new(
            db.clone(),
            blobs.clone(),
            MediaTranscoder::new(&MediaConfig::default()),
        )
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)));

        let png = noisy_png(4, 4);
        let job = MediaUploadJob::new("upload", "image/png");
        blobs
            .inner
            .put(&unprocessed_key(&job.id), &png, "image/png")
            .await
            .unwrap();
        db.insert_media_job(&job).await.unwrap();

        let done = ingestor.process_job(job).await.unwrap();
        assert_eq!(done.state, MediaJobState::Success, "{:?}", done.error_detail);
        let media_id = done.media_id.unwrap();
        assert_eq!(blobs.inner.get(&media_key(&media_id)).await.unwrap(), png);
    }

    #[tokio::test]
    async fn test_serve_notifications_forwards_job_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let server = MediaIngestor::serve_notifications(listener, tx);

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"job-1\n\n  job-2  \n").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("job-1"));
        assert_eq!(rx.recv().await.as_deref(), Some("job-2"));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_listen_processes_notified_jobs() {
        let h = harness(PlatformBudgets::default()).await;
        let job = upload(&h, "image/png", &noisy_png(4, 4)).await;

        let (tx, rx) = mpsc::channel(8);
        let listener = h.ingestor.clone().listen(rx);
        tx.send(job.id.clone()).await.unwrap();
        // A duplicate notification is ignored once the job is done
        tx.send(job.id.clone()).await.unwrap();

        let mut state = MediaJobState::Ready;
        for _ in 0..100 {
            state = h.db.get_media_job(&job.id).await.unwrap().unwrap().state;
            if state != MediaJobState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, MediaJobState::Success);

        drop(tx);
        listener.await.unwrap();
    }
}
