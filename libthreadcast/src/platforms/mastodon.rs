//! Mastodon publisher
//!
//! Talks to any server implementing the Mastodon client API through the
//! megalodon library. Mastodon has no native quote posts, so quoted posts are
//! always attached as screenshots.

use async_trait::async_trait;
use megalodon::entities::{StatusVisibility, UploadMedia};
use megalodon::megalodon::{PostStatusInputOptions, PostStatusOutput, UploadMediaInputOptions};
use megalodon::{Megalodon, SNS};
use secrecy::ExposeSecret;
use std::io::Cursor;
use tracing::debug;

use crate::attachments::AttachmentCache;
use crate::error::{PlatformError, Result};
use crate::platforms::{append_link, previous_id, screenshot_alt_text, HttpSettings, PlatformPublisher};
use crate::resilience::{poll_until, PollStatus};
use crate::types::{MastodonCredentials, PostRef, PostThreadItem, SocialPlatform};

const PLATFORM: SocialPlatform = SocialPlatform::Mastodon;

/// 206 Partial Content while the server is still processing an attachment
const STILL_PROCESSING: u16 = 206;

pub struct MastodonPublisher {
    client: Box<dyn Megalodon + Send + Sync>,
    settings: HttpSettings,
}

impl MastodonPublisher {
    pub fn new(settings: HttpSettings, credentials: &MastodonCredentials) -> Result<Self> {
        let client = megalodon::generator(
            SNS::Mastodon,
            normalize_instance_url(&credentials.instance),
            Some(credentials.access_token.expose_secret().to_string()),
            None,
        )
        .map_err(|e| {
            PlatformError::Authentication(format!("Failed to create Mastodon client: {:?}", e))
        })?;

        Ok(Self { client, settings })
    }

    async fn upload_media(&self, data: &[u8], description: &str) -> Result<String> {
        let options = UploadMediaInputOptions {
            description: (!description.trim().is_empty()).then(|| description.to_string()),
            ..Default::default()
        };
        let response = self
            .client
            .upload_media_reader(Box::new(Cursor::new(data.to_vec())), Some(&options))
            .await
            .map_err(|e| map_megalodon_error(e, "media upload"))?;

        let (id, ready) = match response.json {
            UploadMedia::Attachment(attachment) => (attachment.id, true),
            UploadMedia::AsyncAttachment(attachment) => {
                let ready = attachment.url.is_some();
                (attachment.id, ready)
            }
        };

        if !ready {
            debug!("Mastodon is processing media {}", id);
            poll_until(
                "Mastodon media processing",
                self.settings.poll_interval,
                self.settings.poll_timeout,
                || self.media_status(&id),
            )
            .await?;
        }
        Ok(id)
    }

    async fn media_status(&self, media_id: &str) -> Result<PollStatus<()>> {
        match self.client.get_media(media_id.to_string()).await {
            Ok(response) if response.status == STILL_PROCESSING => Ok(PollStatus::Pending(None)),
            Ok(_) => Ok(PollStatus::Ready(())),
            Err(e) => match map_megalodon_error(e, "media status") {
                // A processing attachment has no url yet and does not decode
                PlatformError::Posting(_) => Ok(PollStatus::Pending(None)),
                other => Err(other.into()),
            },
        }
    }
}

/// Ensure an https scheme and drop any trailing slash
fn normalize_instance_url(instance: &str) -> String {
    let instance = instance.trim().trim_end_matches('/');
    if instance.starts_with("http://") || instance.starts_with("https://") {
        instance.to_string()
    } else {
        format!("https://{}", instance)
    }
}

#[async_trait]
impl PlatformPublisher for MastodonPublisher {
    fn platform(&self) -> SocialPlatform {
        PLATFORM
    }

    async fn publish(
        &self,
        item: &PostThreadItem,
        previous: Option<&PostRef>,
        attachments: &AttachmentCache,
    ) -> Result<PostRef> {
        let reply_to = previous_id(PLATFORM, previous)?;
        let mut text = item.text.clone();
        let mut media_ids = Vec::with_capacity(item.media.len() + 1);

        for media_id in &item.media {
            let media = attachments.media(media_id)?;
            media_ids.push(
                self.upload_media(attachments.media_data(media_id, PLATFORM)?, &media.alt_text)
                    .await?,
            );
        }

        if let Some(url) = &item.quoted_post_url {
            let quote = attachments.quoted_post(url)?;
            let screenshot = quote.screenshot.as_ref().ok_or_else(|| {
                PlatformError::Processing(format!("no screenshot for {}", quote.sanitized_url))
            })?;
            media_ids.push(
                self.upload_media(&screenshot.data, &screenshot_alt_text(&quote.sanitized_url))
                    .await?,
            );
            text = append_link(&text, &quote.sanitized_url);
        }

        let options = PostStatusInputOptions {
            media_ids: (!media_ids.is_empty()).then_some(media_ids),
            in_reply_to_id: reply_to.map(str::to_string),
            visibility: Some(StatusVisibility::Public),
            ..Default::default()
        };
        let response = self
            .client
            .post_status(text, Some(&options))
            .await
            .map_err(|e| map_megalodon_error(e, "post status"))?;

        let id = match response.json {
            PostStatusOutput::Status(status) => status.id,
            PostStatusOutput::ScheduledStatus(scheduled) => {
                return Err(PlatformError::Posting(format!(
                    "Mastodon scheduled status {} instead of posting it",
                    scheduled.id
                ))
                .into())
            }
        };

        debug!("Posted Mastodon status {}", id);
        Ok(PostRef::Mastodon(id))
    }
}

/// Map megalodon errors to PlatformError
///
/// - HTTP 401/403 → `PlatformError::Authentication`
/// - HTTP 422 → `PlatformError::Validation`
/// - HTTP 429 → `PlatformError::RateLimit`
/// - HTTP 5xx and connection failures → `PlatformError::Network`
/// - Undecodable responses → `PlatformError::Posting`
fn map_megalodon_error(error: megalodon::error::Error, context: &str) -> PlatformError {
    let error_str = error.to_string();
    let error_lower = error_str.to_lowercase();

    match extract_http_status(&error_str) {
        Some(401) | Some(403) => PlatformError::Authentication(format!(
            "Mastodon rejected the access token ({}): {}",
            context, error_str
        )),
        Some(422) => PlatformError::Validation(format!(
            "Mastodon validation failed ({}): {}",
            context, error_str
        )),
        Some(429) => PlatformError::RateLimit(format!(
            "Mastodon rate limit exceeded ({}): {}",
            context, error_str
        )),
        Some(500..=599) => PlatformError::Network(format!(
            "Mastodon server error ({}): {}",
            context, error_str
        )),
        Some(_) => PlatformError::Posting(format!("Mastodon HTTP error ({}): {}", context, error_str)),
        None => {
            if error_lower.contains("unauthorized") || error_lower.contains("forbidden") {
                PlatformError::Authentication(format!(
                    "Mastodon rejected the access token ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("parse")
                || error_lower.contains("json")
                || error_lower.contains("decod")
            {
                PlatformError::Posting(format!(
                    "Mastodon response parse error ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("rate limit") || error_lower.contains("too many requests") {
                PlatformError::RateLimit(format!(
                    "Mastodon rate limit exceeded ({}): {}",
                    context, error_str
                ))
            } else {
                PlatformError::Network(format!("Mastodon error ({}): {}", context, error_str))
            }
        }
    }
}

/// HTTP status code mentioned in a megalodon error message, if any
fn extract_http_status(error_str: &str) -> Option<u16> {
    let prefixes = ["HTTP ", "status ", "status: ", "code: ", "status_code: "];
    for prefix in &prefixes {
        if let Some(pos) = error_str.find(prefix) {
            if let Some(code) = error_str[pos + prefix.len()..]
                .get(0..3)
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|code| (100..=599).contains(code))
            {
                return Some(code);
            }
        }
    }

    // A standalone three-digit code followed by a colon or space
    let bytes = error_str.as_bytes();
    for (i, window) in bytes.windows(4).enumerate() {
        let standalone = i == 0 || !bytes[i - 1].is_ascii_digit();
        if standalone
            && window[..3].iter().all(u8::is_ascii_digit)
            && (window[3] == b':' || window[3] == b' ')
        {
            if let Some(code) = std::str::from_utf8(&window[..3])
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|code| (100..=599).contains(code))
            {
                return Some(code);
            }
        }
    }
    None
}
