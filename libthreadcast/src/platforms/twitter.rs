//! Twitter (X) publisher over the v2 API

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::attachments::AttachmentCache;
use crate::error::{PlatformError, Result};
use crate::platforms::{
    append_link, previous_id, screenshot_alt_text, send, send_json, HttpSettings,
    PlatformPublisher,
};
use crate::resilience::{poll_until, PollStatus};
use crate::types::{MediaKind, PostRef, PostThreadItem, SocialPlatform, TwitterCredentials};

/// Append chunk size; the API maximum is 5 MiB
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const PLATFORM: SocialPlatform = SocialPlatform::Twitter;

#[derive(Serialize)]
struct InitializeRequest<'a> {
    media_category: &'a str,
    media_type: &'a str,
    total_bytes: usize,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct MediaUpload {
    id: String,
    #[serde(default)]
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct ProcessingInfo {
    state: String,
    #[serde(default)]
    check_after_secs: Option<u64>,
    #[serde(default)]
    error: Option<ProcessingFailure>,
}

#[derive(Debug, Deserialize)]
struct ProcessingFailure {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct TweetRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media: Option<TweetMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<TweetReply<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote_tweet_id: Option<&'a str>,
}

#[derive(Serialize)]
struct TweetMedia {
    media_ids: Vec<String>,
}

#[derive(Serialize)]
struct TweetReply<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[derive(Deserialize)]
struct CreatedTweet {
    id: String,
}

/// v2 media category for a mime type
pub fn media_category(mime_type: &str) -> Result<&'static str> {
    match MediaKind::from_mime_str(mime_type) {
        Some(MediaKind::Image) => Ok("tweet_image"),
        Some(MediaKind::Gif) => Ok("tweet_gif"),
        Some(MediaKind::Video) => Ok("amplify_video"),
        None => Err(PlatformError::Validation(format!(
            "Twitter does not accept {} media",
            mime_type
        ))
        .into()),
    }
}

pub struct TwitterPublisher {
    settings: HttpSettings,
    api_base: String,
    access_token: SecretString,
}

impl TwitterPublisher {
    pub fn new(settings: HttpSettings, api_base: &str, credentials: &TwitterCredentials) -> Self {
        Self {
            settings,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: credentials.access_token.clone(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.settings
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(self.access_token.expose_secret())
    }

    /// Chunked upload of one media file; returns the media id
    async fn upload_media(&self, data: &[u8], mime_type: &str, alt_text: &str) -> Result<String> {
        let category = media_category(mime_type)?;
        let initialized: DataEnvelope<MediaUpload> = send_json(
            PLATFORM,
            "media initialize",
            self.post("/2/media/upload/initialize").json(&InitializeRequest {
                media_category: category,
                media_type: mime_type,
                total_bytes: data.len(),
            }),
        )
        .await?;
        let media_id = initialized.data.id;

        for (segment, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let form = Form::new()
                .text("segment_index", segment.to_string())
                .part("media", Part::bytes(chunk.to_vec()).file_name("data.bin"));
            send(
                PLATFORM,
                "media append",
                self.post(&format!("/2/media/upload/{}/append", media_id))
                    .multipart(form),
            )
            .await?;
        }

        let finalized: DataEnvelope<MediaUpload> = send_json(
            PLATFORM,
            "media finalize",
            self.post(&format!("/2/media/upload/{}/finalize", media_id)),
        )
        .await?;

        if category == "amplify_video" || finalized.data.processing_info.is_some() {
            self.wait_for_processing(&media_id).await?;
        }

        if !alt_text.trim().is_empty() {
            send(
                PLATFORM,
                "media metadata",
                self.post("/2/media/metadata").json(&serde_json::json!({
                    "id": media_id,
                    "metadata": { "alt_text": { "text": alt_text } }
                })),
            )
            .await?;
        }

        debug!("Uploaded Twitter media {} ({})", media_id, category);
        Ok(media_id)
    }

    async fn processing_status(&self, media_id: &str) -> Result<PollStatus<()>> {
        let status: DataEnvelope<MediaUpload> = send_json(
            PLATFORM,
            "media status",
            self.settings
                .http
                .get(format!("{}/2/media/upload", self.api_base))
                .query(&[("command", "STATUS"), ("media_id", media_id)])
                .bearer_auth(self.access_token.expose_secret()),
        )
        .await?;

        let Some(info) = status.data.processing_info else {
            return Ok(PollStatus::Ready(()));
        };
        Ok(match info.state.as_str() {
            "succeeded" => PollStatus::Ready(()),
            "failed" => PollStatus::Failed(
                PlatformError::Processing(format!(
                    "Twitter failed to process media {}: {}",
                    media_id,
                    info.error.map(|e| e.message).unwrap_or_default()
                ))
                .into(),
            ),
            _ => PollStatus::Pending(info.check_after_secs.map(Duration::from_secs)),
        })
    }

    async fn wait_for_processing(&self, media_id: &str) -> Result<()> {
        poll_until(
            "Twitter media processing",
            self.settings.poll_interval,
            self.settings.poll_timeout,
            || self.processing_status(media_id),
        )
        .await
    }
}

#[async_trait]
impl PlatformPublisher for TwitterPublisher {
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
            let uploaded = self
                .upload_media(
                    attachments.media_data(media_id, PLATFORM)?,
                    attachments.media_mime_type(media_id, PLATFORM)?,
                    &media.alt_text,
                )
                .await?;
            media_ids.push(uploaded);
        }

        let mut quote_tweet_id = None;
        if let Some(url) = &item.quoted_post_url {
            let quote = attachments.quoted_post(url)?;
            match &quote.twitter_id {
                Some(id) => quote_tweet_id = Some(id.as_str()),
                None => {
                    let screenshot = quote.screenshot.as_ref().ok_or_else(|| {
                        PlatformError::Processing(format!("no screenshot for {}", quote.sanitized_url))
                    })?;
                    let uploaded = self
                        .upload_media(
                            &screenshot.data,
                            &screenshot.mime_type,
                            &screenshot_alt_text(&quote.sanitized_url),
                        )
                        .await?;
                    media_ids.push(uploaded);
                    text = append_link(&text, &quote.sanitized_url);
                }
            }
        }

        let request = TweetRequest {
            text: &text,
            media: (!media_ids.is_empty()).then_some(TweetMedia { media_ids }),
            reply: reply_to.map(|id| TweetReply {
                in_reply_to_tweet_id: id,
            }),
            quote_tweet_id,
        };
        let created: DataEnvelope<CreatedTweet> =
            send_json(PLATFORM, "create tweet", self.post("/2/tweets").json(&request)).await?;

        debug!("Posted tweet {}", created.data.id);
        Ok(PostRef::Twitter(created.data.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::test_support::Fixture;
    use crate::types::PostThread;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher(server: &MockServer) -> TwitterPublisher {
        TwitterPublisher::new(
            HttpSettings {
                http: reqwest::Client::new(),
                poll_interval: Duration::from_millis(10),
                poll_timeout: Duration::from_secs(5),
            },
            &server.uri(),
            &TwitterCredentials {
                access_token: SecretString::from("tw-token".to_string()),
            },
        )
    }

    #[test]
    fn test_media_categories() {
        assert_eq!(media_category("image/png").unwrap(), "tweet_image");
        assert_eq!(media_category("image/gif").unwrap(), "tweet_gif");
        assert_eq!(media_category("video/mp4").unwrap(), "amplify_video");
        assert!(media_category("application/pdf").is_err());
    }

    #[tokio::test]
    async fn test_reply_with_native_quote() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(header("authorization", "Bearer tw-token"))
            .and(body_json(json!({
                "text": "second",
                "reply": {"in_reply_to_tweet_id": "100"},
                "quote_tweet_id": "42"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"id": "101", "text": "second"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let url = "https://x.com/a/status/42";
        let mut item = PostThreadItem::new("second");
        item.quoted_post_url = Some(url.to_string());
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();

        let previous = PostRef::Twitter("100".to_string());
        let posted = publisher(&server)
            .publish(&item, Some(&previous), &cache)
            .await
            .unwrap();
        assert_eq!(posted, PostRef::Twitter("101".to_string()));
    }

    #[tokio::test]
    async fn test_video_upload_polls_until_succeeded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/initialize"))
            .and(body_partial_json(json!({"media_category": "amplify_video"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "m1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m1/append"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "pending", "check_after_secs": 0}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/media/upload"))
            .and(query_param("command", "STATUS"))
            .and(query_param("media_id", "m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "in_progress", "check_after_secs": 0}}
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/media/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "succeeded"}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/metadata"))
            .and(body_json(json!({"id": "m1", "metadata": {"alt_text": {"text": "alt"}}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(body_partial_json(json!({"media": {"media_ids": ["m1"]}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "7"}})))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let media = fx.add_media("video/mp4", b"not really a video", &[]).await;
        let mut item = PostThreadItem::new("clip");
        item.media = vec![media.id.clone()];
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();

        let posted = publisher(&server).publish(&item, None, &cache).await.unwrap();
        assert_eq!(posted.native_id(), "7");
    }

    #[tokio::test]
    async fn test_failed_processing_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/initialize"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "m2"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m2/append"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m2/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "m2"}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/media/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m2", "processing_info": {
                    "state": "failed", "error": {"message": "InvalidMedia"}
                }}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "x"}})))
            .expect(0)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let media = fx.add_media("video/mp4", b"bad", &[]).await;
        let mut item = PostThreadItem::new("clip");
        item.media = vec![media.id.clone()];
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();

        let err = publisher(&server).publish(&item, None, &cache).await.unwrap_err();
        assert!(err.to_string().contains("InvalidMedia"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let cache = fx.cache();
        let err = publisher(&server)
            .publish(&PostThreadItem::new("hi"), None, &cache)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
