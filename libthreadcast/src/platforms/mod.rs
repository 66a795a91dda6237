//! Platform publishers
//!
//! Each supported platform has a [`PlatformPublisher`] that turns one
//! [`PostThreadItem`] into a published post, chained to the previous item's
//! [`PostRef`]. Publishers are created per thread leg by a [`PublisherFactory`]
//! from the account group's credentials.
//!
//! # Examples
//!
//! ```no_run
//! use libthreadcast::platforms::{PlatformPublisher, PublisherFactory};
//! use libthreadcast::attachments::AttachmentCache;
//! use libthreadcast::types::{AccountGroup, PostThreadItem, SocialPlatform};
//!
//! # async fn example(
//! #     factory: &dyn PublisherFactory,
//! #     group: &AccountGroup,
//! #     attachments: &AttachmentCache,
//! # ) -> libthreadcast::error::Result<()> {
//! let mut publisher = factory.create(SocialPlatform::Mastodon, group)?;
//! publisher.authenticate().await?;
//!
//! let first = publisher
//!     .publish(&PostThreadItem::new("1/2"), None, attachments)
//!     .await?;
//! publisher
//!     .publish(&PostThreadItem::new("2/2"), Some(&first), attachments)
//!     .await?;
//!
//! publisher.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::attachments::AttachmentCache;
use crate::config::PlatformsConfig;
use crate::error::{PlatformError, Result};
use crate::text::{HttpTextAnalyzer, RegexTextAnalyzer, TextAnalyzer};
use crate::types::{AccountGroup, PostRef, PostThreadItem, SocialPlatform};

pub mod bluesky;
pub mod mastodon;
pub mod threads;
pub mod twitter;

// Available in all builds so integration tests can drive the coordinator
pub mod mock;

/// Publishes thread items to one platform for one account
#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    fn platform(&self) -> SocialPlatform;

    /// Open a session if the platform needs one. Called once before the first publish.
    async fn authenticate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Publish `item` as a reply to `previous` (or as a new root when `None`)
    ///
    /// # Errors
    ///
    /// - `PlatformError::Authentication` when credentials are rejected
    /// - `PlatformError::Network` / `PlatformError::RateLimit` for transient failures
    /// - `PlatformError::Processing` when the platform fails to process media
    /// - `ThreadcastError::Timeout` when platform-side processing takes too long
    async fn publish(
        &self,
        item: &PostThreadItem,
        previous: Option<&PostRef>,
        attachments: &AttachmentCache,
    ) -> Result<PostRef>;

    /// Release the session. Called once after the leg, whatever its outcome.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates publishers for an account group
pub trait PublisherFactory: Send + Sync {
    fn create(
        &self,
        platform: SocialPlatform,
        group: &AccountGroup,
    ) -> Result<Box<dyn PlatformPublisher>>;
}

/// Settings shared by the HTTP publishers
#[derive(Clone)]
pub struct HttpSettings {
    pub http: reqwest::Client,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

/// Builds the real reqwest-backed publishers
pub struct HttpPublisherFactory {
    settings: HttpSettings,
    twitter_api_base: String,
    threads_api_base: String,
    text_analyzer: Arc<dyn TextAnalyzer>,
}

impl HttpPublisherFactory {
    pub fn new(config: &PlatformsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("threadcast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Network(format!("failed to build HTTP client: {}", e)))?;

        let text_analyzer: Arc<dyn TextAnalyzer> = match &config.text_analyzer_url {
            Some(url) => Arc::new(HttpTextAnalyzer::new(http.clone(), url)),
            None => Arc::new(RegexTextAnalyzer),
        };

        Ok(Self {
            settings: HttpSettings {
                http,
                poll_interval: config.poll_interval(),
                poll_timeout: config.poll_timeout(),
            },
            twitter_api_base: config.twitter_api_base.clone(),
            threads_api_base: config.threads_api_base.clone(),
            text_analyzer,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.settings.http
    }
}

fn missing_credentials(platform: SocialPlatform, group: &AccountGroup) -> PlatformError {
    PlatformError::Authentication(format!(
        "account group {} has no {} credentials",
        group.name, platform
    ))
}

impl PublisherFactory for HttpPublisherFactory {
    fn create(
        &self,
        platform: SocialPlatform,
        group: &AccountGroup,
    ) -> Result<Box<dyn PlatformPublisher>> {
        let settings = self.settings.clone();
        Ok(match platform {
            SocialPlatform::Twitter => {
                let credentials = group
                    .twitter
                    .as_ref()
                    .ok_or_else(|| missing_credentials(platform, group))?;
                Box::new(twitter::TwitterPublisher::new(
                    settings,
                    &self.twitter_api_base,
                    credentials,
                ))
            }
            SocialPlatform::Bluesky => {
                let credentials = group
                    .bluesky
                    .as_ref()
                    .ok_or_else(|| missing_credentials(platform, group))?;
                Box::new(bluesky::BlueskyPublisher::new(
                    settings,
                    credentials,
                    self.text_analyzer.clone(),
                ))
            }
            SocialPlatform::Mastodon => {
                let credentials = group
                    .mastodon
                    .as_ref()
                    .ok_or_else(|| missing_credentials(platform, group))?;
                Box::new(mastodon::MastodonPublisher::new(settings, credentials)?)
            }
            SocialPlatform::Threads => {
                let credentials = group
                    .threads
                    .as_ref()
                    .ok_or_else(|| missing_credentials(platform, group))?;
                Box::new(threads::ThreadsPublisher::new(
                    settings,
                    &self.threads_api_base,
                    credentials,
                ))
            }
        })
    }
}

// ============================================================================
// Shared HTTP helpers
// ============================================================================

/// Map a non-success HTTP status to the error kind the retry policy understands
pub fn map_http_status(
    platform: SocialPlatform,
    context: &str,
    status: StatusCode,
    body: &str,
) -> PlatformError {
    let message = format!("{} {} returned {}: {}", platform, context, status, body.trim());
    match status.as_u16() {
        401 | 403 => PlatformError::Authentication(message),
        400 | 413 | 422 => PlatformError::Validation(message),
        429 => PlatformError::RateLimit(message),
        500..=599 => PlatformError::Network(message),
        _ => PlatformError::Posting(message),
    }
}

pub(crate) fn transport_error(
    platform: SocialPlatform,
    context: &str,
    error: reqwest::Error,
) -> PlatformError {
    PlatformError::Network(format!("{} {}: {}", platform, context, error))
}

/// Send a request, failing on non-success statuses
pub(crate) async fn send(
    platform: SocialPlatform,
    context: &str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(platform, context, e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_http_status(platform, context, status, &body).into())
}

/// Send a request and decode its JSON body
pub(crate) async fn send_json<T: DeserializeOwned>(
    platform: SocialPlatform,
    context: &str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send(platform, context, request).await?;
    decode_json(platform, context, response).await
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    platform: SocialPlatform,
    context: &str,
    response: reqwest::Response,
) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(platform, context, e))?;
    Ok(serde_json::from_str(&body).map_err(|e| {
        PlatformError::Posting(format!(
            "{} {} returned an unexpected body: {}",
            platform, context, e
        ))
    })?)
}

/// The previous item's id on `platform`, rejecting refs from other platforms
pub(crate) fn previous_id(platform: SocialPlatform, previous: Option<&PostRef>) -> Result<Option<&str>> {
    match previous {
        None => Ok(None),
        Some(post_ref) if post_ref.platform() == platform => Ok(Some(post_ref.native_id())),
        Some(post_ref) => Err(PlatformError::Validation(format!(
            "cannot reply on {} to a {} post",
            platform,
            post_ref.platform()
        ))
        .into()),
    }
}

/// Post text with a link to the quoted post on its own paragraph
pub(crate) fn append_link(text: &str, url: &str) -> String {
    if text.trim().is_empty() {
        url.to_string()
    } else {
        format!("{}\n\n{}", text.trim_end(), url)
    }
}

pub(crate) fn screenshot_alt_text(url: &str) -> String {
    format!("Screenshot of {}", url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MastodonCredentials, StrongRef};
    use secrecy::SecretString;

    #[test]
    fn test_status_mapping() {
        let map = |code: u16| {
            map_http_status(
                SocialPlatform::Twitter,
                "post",
                StatusCode::from_u16(code).unwrap(),
                "",
            )
        };
        assert!(matches!(map(401), PlatformError::Authentication(_)));
        assert!(matches!(map(403), PlatformError::Authentication(_)));
        assert!(matches!(map(400), PlatformError::Validation(_)));
        assert!(matches!(map(413), PlatformError::Validation(_)));
        assert!(matches!(map(422), PlatformError::Validation(_)));
        assert!(matches!(map(429), PlatformError::RateLimit(_)));
        assert!(matches!(map(502), PlatformError::Network(_)));
        assert!(matches!(map(404), PlatformError::Posting(_)));
        assert!(map(503).is_transient());
        assert!(!map(400).is_transient());
    }

    #[test]
    fn test_previous_id_rejects_other_platforms() {
        let tweet = PostRef::Twitter("1".to_string());
        assert_eq!(
            previous_id(SocialPlatform::Twitter, Some(&tweet)).unwrap(),
            Some("1")
        );
        assert!(previous_id(SocialPlatform::Mastodon, Some(&tweet)).is_err());

        let skeet = PostRef::Bluesky {
            root: StrongRef {
                uri: "at://a/r".to_string(),
                cid: "c1".to_string(),
            },
            this: StrongRef {
                uri: "at://a/t".to_string(),
                cid: "c2".to_string(),
            },
        };
        assert_eq!(
            previous_id(SocialPlatform::Bluesky, Some(&skeet)).unwrap(),
            Some("at://a/t")
        );
    }

    #[test]
    fn test_append_link() {
        assert_eq!(append_link("look ", "https://x"), "look\n\nhttps://x");
        assert_eq!(append_link("", "https://x"), "https://x");
    }

    #[test]
    fn test_factory_requires_credentials() {
        let factory = HttpPublisherFactory::new(&PlatformsConfig::default()).unwrap();
        let mut group = AccountGroup::new("main");
        assert!(factory.create(SocialPlatform::Mastodon, &group).is_err());

        group.mastodon = Some(MastodonCredentials {
            instance: "https://mastodon.example".to_string(),
            access_token: SecretString::from("token".to_string()),
        });
        let publisher = factory.create(SocialPlatform::Mastodon, &group).unwrap();
        assert_eq!(publisher.platform(), SocialPlatform::Mastodon);
    }
}
