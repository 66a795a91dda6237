//! Threads publisher over the Graph API
//!
//! Publishing is two-step: create a media container, wait for Threads to
//! finish processing it, then publish the container. Media is passed by URL,
//! so attachments are served through presigned blob store links.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::attachments::AttachmentCache;
use crate::error::{PlatformError, Result};
use crate::platforms::{append_link, previous_id, send_json, HttpSettings, PlatformPublisher};
use crate::resilience::{poll_until, PollStatus};
use crate::types::{PostRef, PostThreadItem, SocialPlatform, ThreadsCredentials};

const PLATFORM: SocialPlatform = SocialPlatform::Threads;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attachment {
    Image(String),
    Video(String),
}

impl Attachment {
    fn media_type(&self) -> &'static str {
        match self {
            Attachment::Image(_) => "IMAGE",
            Attachment::Video(_) => "VIDEO",
        }
    }

    fn url_param(&self) -> (&'static str, String) {
        match self {
            Attachment::Image(url) => ("image_url", url.clone()),
            Attachment::Video(url) => ("video_url", url.clone()),
        }
    }
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

/// Processing state of a container, as reported by `?fields=status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    InProgress,
    Finished,
    Published,
    Failed(String),
}

impl ContainerState {
    fn from_status(status: &ContainerStatus) -> Self {
        match status.status.as_str() {
            "FINISHED" => ContainerState::Finished,
            "PUBLISHED" => ContainerState::Published,
            "ERROR" | "EXPIRED" => ContainerState::Failed(format!(
                "{}: {}",
                status.status,
                status.error_message.as_deref().unwrap_or("no details")
            )),
            _ => ContainerState::InProgress,
        }
    }
}

pub struct ThreadsPublisher {
    settings: HttpSettings,
    api_base: String,
    user_id: String,
    access_token: SecretString,
}

impl ThreadsPublisher {
    pub fn new(settings: HttpSettings, api_base: &str, credentials: &ThreadsCredentials) -> Self {
        Self {
            settings,
            api_base: api_base.trim_end_matches('/').to_string(),
            user_id: credentials.user_id.clone(),
            access_token: credentials.access_token.clone(),
        }
    }

    async fn create_container(&self, mut params: Vec<(&'static str, String)>) -> Result<String> {
        params.push(("access_token", self.access_token.expose_secret().to_string()));
        let created: Created = send_json(
            PLATFORM,
            "create container",
            self.settings
                .http
                .post(format!("{}/{}/threads", self.api_base, self.user_id))
                .form(&params),
        )
        .await?;
        Ok(created.id)
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        let status: ContainerStatus = send_json(
            PLATFORM,
            "container status",
            self.settings
                .http
                .get(format!("{}/{}", self.api_base, container_id))
                .query(&[
                    ("fields", "status,error_message"),
                    ("access_token", self.access_token.expose_secret()),
                ]),
        )
        .await?;
        Ok(ContainerState::from_status(&status))
    }

    /// Wait until every container has finished processing.
    ///
    /// All pending containers are probed each round; finished ones drop out of
    /// the pending set. Any container in ERROR or EXPIRED fails the wait.
    async fn wait_until_finished(&self, container_ids: &[String]) -> Result<()> {
        let pending = Mutex::new(container_ids.to_vec());
        let pending = &pending;
        poll_until(
            "Threads container processing",
            self.settings.poll_interval,
            self.settings.poll_timeout,
            move || async move {
                let mut pending = pending.lock().await;
                let mut still_pending = Vec::with_capacity(pending.len());
                for id in pending.iter() {
                    match self.container_state(id).await? {
                        ContainerState::Finished | ContainerState::Published => {}
                        ContainerState::InProgress => still_pending.push(id.clone()),
                        ContainerState::Failed(detail) => {
                            return Ok(PollStatus::Failed(
                                PlatformError::Processing(format!(
                                    "Threads container {} failed: {}",
                                    id, detail
                                ))
                                .into(),
                            ))
                        }
                    }
                }
                *pending = still_pending;
                Ok(if pending.is_empty() {
                    PollStatus::Ready(())
                } else {
                    PollStatus::Pending(None)
                })
            },
        )
        .await
    }

    async fn wait_until_published(&self, container_id: &str) -> Result<()> {
        poll_until(
            "Threads publish",
            self.settings.poll_interval,
            self.settings.poll_timeout,
            move || async move {
                Ok(match self.container_state(container_id).await? {
                    ContainerState::Published => PollStatus::Ready(()),
                    ContainerState::Failed(detail) => PollStatus::Failed(
                        PlatformError::Processing(format!(
                            "Threads publish of {} failed: {}",
                            container_id, detail
                        ))
                        .into(),
                    ),
                    _ => PollStatus::Pending(None),
                })
            },
        )
        .await
    }

    /// Build the top-level container for an item and return its id
    async fn build_container(
        &self,
        text: &str,
        attachments: &[Attachment],
        mut extra: Vec<(&'static str, String)>,
    ) -> Result<String> {
        let mut params = vec![("text", text.to_string())];

        match attachments {
            [] => params.push(("media_type", "TEXT".to_string())),
            [single] => {
                params.push(("media_type", single.media_type().to_string()));
                params.push(single.url_param());
            }
            many => {
                let mut children = Vec::with_capacity(many.len());
                for attachment in many {
                    children.push(
                        self.create_container(vec![
                            ("media_type", attachment.media_type().to_string()),
                            attachment.url_param(),
                            ("is_carousel_item", "true".to_string()),
                        ])
                        .await?,
                    );
                }
                self.wait_until_finished(&children).await?;
                params.push(("media_type", "CAROUSEL".to_string()));
                params.push(("children", children.join(",")));
            }
        }

        params.append(&mut extra);
        self.create_container(params).await
    }
}

#[async_trait]
impl PlatformPublisher for ThreadsPublisher {
    fn platform(&self) -> SocialPlatform {
        PLATFORM
    }

    async fn publish(
        &self,
        item: &PostThreadItem,
        previous: Option<&PostRef>,
        cache: &AttachmentCache,
    ) -> Result<PostRef> {
        let mut text = item.text.clone();
        let mut extra = Vec::new();
        if let Some(reply_to) = previous_id(PLATFORM, previous)? {
            extra.push(("reply_to_id", reply_to.to_string()));
        }

        let mut attachments = Vec::with_capacity(item.media.len() + 1);
        for media_id in &item.media {
            let url = cache.media_url(media_id, PLATFORM)?;
            attachments.push(if cache.media(media_id)?.is_video() {
                Attachment::Video(url)
            } else {
                Attachment::Image(url)
            });
        }

        if let Some(url) = &item.quoted_post_url {
            let quote = cache.quoted_post(url)?;
            match &quote.threads_id {
                Some(id) => extra.push(("quote_post_id", id.clone())),
                None => {
                    let screenshot = quote.screenshot.as_ref().ok_or_else(|| {
                        PlatformError::Processing(format!("no screenshot for {}", quote.sanitized_url))
                    })?;
                    attachments.push(Attachment::Image(screenshot.url.clone()));
                    text = append_link(&text, &quote.sanitized_url);
                }
            }
        }

        let container_id = self.build_container(&text, &attachments, extra).await?;
        self.wait_until_finished(std::slice::from_ref(&container_id))
            .await?;

        let published: Created = send_json(
            PLATFORM,
            "publish",
            self.settings
                .http
                .post(format!("{}/{}/threads_publish", self.api_base, self.user_id))
                .form(&[
                    ("creation_id", container_id.as_str()),
                    ("access_token", self.access_token.expose_secret()),
                ]),
        )
        .await?;
        self.wait_until_published(&container_id).await?;

        debug!("Published Threads post {}", published.id);
        Ok(PostRef::Threads(published.id))
    }
}
