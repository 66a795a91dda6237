//! Per-thread cache of media bytes and resolved quoted posts
//!
//! Built fresh for every thread publication and populated up front, so every
//! platform leg reads the same bytes without touching storage again. Storage,
//! AppView and browser calls made while populating go through the
//! [`RetryPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::db::Database;
use crate::error::{Result, ThreadcastError};
use crate::quote::{parse_quoted_url, PostResolver, QuoteOrigin, QuoteRenderer, QuotedPost, Screenshot};
use crate::resilience::RetryPolicy;
use crate::storage::{media_key, media_variant_key, quoted_post_key, BlobStore, PresignMethod};
use crate::types::{PostThread, SocialPlatform, UploadedMedia};

struct CachedMedia {
    media: UploadedMedia,
    canonical: Vec<u8>,
    variants: HashMap<SocialPlatform, Vec<u8>>,
}

pub struct AttachmentCache {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn QuoteRenderer>,
    resolver: Arc<dyn PostResolver>,
    presign_ttl: Duration,
    retry: RetryPolicy,
    media: HashMap<String, CachedMedia>,
    quoted_posts: HashMap<String, QuotedPost>,
}

impl AttachmentCache {
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        renderer: Arc<dyn QuoteRenderer>,
        resolver: Arc<dyn PostResolver>,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            db,
            blobs,
            renderer,
            resolver,
            presign_ttl,
            retry: RetryPolicy::default(),
            media: HashMap::new(),
            quoted_posts: HashMap::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load everything `thread` references for publishing to `platforms`
    pub async fn populate(&mut self, thread: &PostThread, platforms: &[SocialPlatform]) -> Result<()> {
        for item in &thread.items {
            for media_id in &item.media {
                self.load_media(media_id, platforms).await?;
            }
            if let Some(url) = &item.quoted_post_url {
                self.load_quoted_post(url, platforms).await?;
            }
        }
        debug!(
            thread_id = %thread.id,
            media = self.media.len(),
            quoted_posts = self.quoted_posts.len(),
            "Attachment cache populated"
        );
        Ok(())
    }

    async fn load_media(&mut self, media_id: &str, platforms: &[SocialPlatform]) -> Result<()> {
        if self.media.contains_key(media_id) {
            return Ok(());
        }

        let media = self
            .db
            .get_media(media_id)
            .await?
            .ok_or_else(|| ThreadcastError::NotFound(format!("media {}", media_id)))?;
        let key = media_key(media_id);
        let canonical = self
            .retry
            .run("media download", || self.blobs.get(&key))
            .await?;

        let mut variants = HashMap::new();
        for platform in platforms {
            if media.optimized.get(*platform) {
                let key = media_variant_key(media_id, *platform);
                let data = self
                    .retry
                    .run("media variant download", || self.blobs.get(&key))
                    .await?;
                variants.insert(*platform, data);
            }
        }

        self.media.insert(
            media_id.to_string(),
            CachedMedia {
                media,
                canonical,
                variants,
            },
        );
        Ok(())
    }

    async fn load_quoted_post(&mut self, url: &str, platforms: &[SocialPlatform]) -> Result<()> {
        if self.quoted_posts.contains_key(url) {
            return Ok(());
        }

        let mut quote = QuotedPost::new(parse_quoted_url(url)?);
        if let QuoteOrigin::Bluesky { actor, rkey } = &quote.origin {
            let resolved = self
                .retry
                .run("Bluesky post lookup", || {
                    self.resolver.resolve_bluesky_post(actor, rkey)
                })
                .await?;
            quote.bluesky_ref = Some(resolved);
        }

        if let Some(native_id) = quote.origin_native_id() {
            if let Some(item) = self
                .db
                .find_item_by_native_id(quote.origin.platform(), &native_id)
                .await?
            {
                debug!(url = %quote.sanitized_url, "Quoted post was published by us");
                quote.merge_known_ids(&item);
            }
        }

        if quote.needs_screenshot(platforms) {
            let key = quoted_post_key(&quote.sanitized_url);
            let stored = self
                .retry
                .run("screenshot lookup", || self.blobs.exists(&key))
                .await?;
            let data = if stored {
                self.retry
                    .run("screenshot download", || self.blobs.get(&key))
                    .await?
            } else {
                debug!(url = %quote.sanitized_url, "Rendering quoted post screenshot");
                let target = quote.preview_target()?;
                let png = self
                    .retry
                    .run("quoted post screenshot", || self.renderer.render(&target))
                    .await?;
                self.retry
                    .run("screenshot upload", || self.blobs.put(&key, &png, "image/png"))
                    .await?;
                png
            };
            let url = self
                .blobs
                .presigned_url(&key, PresignMethod::Get, self.presign_ttl)?;
            quote.screenshot = Some(Screenshot {
                data,
                mime_type: "image/png".to_string(),
                url,
            });
        }

        self.quoted_posts.insert(url.to_string(), quote);
        Ok(())
    }

    fn cached(&self, media_id: &str) -> Result<&CachedMedia> {
        self.media
            .get(media_id)
            .ok_or_else(|| ThreadcastError::NotFound(format!("media {} is not cached", media_id)))
    }

    pub fn media(&self, media_id: &str) -> Result<&UploadedMedia> {
        Ok(&self.cached(media_id)?.media)
    }

    /// Bytes to upload to `platform`: its optimized variant, else the canonical copy
    pub fn media_data(&self, media_id: &str, platform: SocialPlatform) -> Result<&[u8]> {
        let cached = self.cached(media_id)?;
        Ok(cached
            .variants
            .get(&platform)
            .unwrap_or(&cached.canonical)
            .as_slice())
    }

    pub fn media_mime_type(&self, media_id: &str, platform: SocialPlatform) -> Result<&str> {
        let cached = self.cached(media_id)?;
        if cached.variants.contains_key(&platform) {
            Ok(if cached.media.is_video() {
                "video/mp4"
            } else {
                "image/jpeg"
            })
        } else {
            Ok(&cached.media.mime_type)
        }
    }

    /// Presigned GET URL for the bytes [`Self::media_data`] returns
    pub fn media_url(&self, media_id: &str, platform: SocialPlatform) -> Result<String> {
        let cached = self.cached(media_id)?;
        let key = if cached.variants.contains_key(&platform) {
            media_variant_key(media_id, platform)
        } else {
            media_key(media_id)
        };
        self.blobs
            .presigned_url(&key, PresignMethod::Get, self.presign_ttl)
    }

    /// The resolved quoted post for the URL exactly as it appears on an item
    pub fn quoted_post(&self, url: &str) -> Result<&QuotedPost> {
        self.quoted_posts
            .get(url)
            .ok_or_else(|| ThreadcastError::NotFound(format!("quoted post {} is not cached", url)))
    }
}
