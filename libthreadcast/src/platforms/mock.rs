//! Mock publishers for testing
//!
//! A configurable publisher and factory that simulate successes, permanent
//! failures and transient failures, and record every call. Used by the
//! coordinator's integration tests to exercise multi-platform publishing
//! without credentials or network access.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::attachments::AttachmentCache;
use crate::error::{PlatformError, Result};
use crate::platforms::{PlatformPublisher, PublisherFactory};
use crate::types::{AccountGroup, PostRef, PostThreadItem, SocialPlatform, StrongRef};

/// How a mock publisher behaves
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Error returned by `authenticate`
    pub auth_error: Option<PlatformError>,

    /// Error returned by every `publish`
    pub publish_error: Option<PlatformError>,

    /// Once this many items have been published, every further publish fails
    pub fail_from_item: Option<(usize, PlatformError)>,

    /// Number of initial publish attempts that fail with a network error
    pub transient_failures: usize,
}

impl MockBehavior {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn auth_failure(message: &str) -> Self {
        Self {
            auth_error: Some(PlatformError::Authentication(message.to_string())),
            ..Default::default()
        }
    }

    pub fn publish_failure(error: PlatformError) -> Self {
        Self {
            publish_error: Some(error),
            ..Default::default()
        }
    }

    pub fn fail_from_item(index: usize, error: PlatformError) -> Self {
        Self {
            fail_from_item: Some((index, error)),
            ..Default::default()
        }
    }

    pub fn flaky(transient_failures: usize) -> Self {
        Self {
            transient_failures,
            ..Default::default()
        }
    }
}

/// A call made to a mock publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Authenticate(SocialPlatform),
    Publish {
        platform: SocialPlatform,
        text: String,
        /// Native id of the post this one replies to
        previous: Option<String>,
    },
    Close(SocialPlatform),
}

type CallLog = Arc<Mutex<Vec<MockCall>>>;

fn record(log: &CallLog, call: MockCall) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(call);
}

pub struct MockPublisher {
    platform: SocialPlatform,
    behavior: MockBehavior,
    log: CallLog,
    next_id: Arc<AtomicUsize>,
    attempts: AtomicUsize,
    published: AtomicUsize,
    authenticated: bool,
}

impl MockPublisher {
    pub fn new(platform: SocialPlatform, behavior: MockBehavior) -> Self {
        Self {
            platform,
            behavior,
            log: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicUsize::new(1)),
            attempts: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
            authenticated: false,
        }
    }

    fn make_ref(&self, previous: Option<&PostRef>) -> PostRef {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", self.platform, n);
        match self.platform {
            SocialPlatform::Twitter => PostRef::Twitter(id),
            SocialPlatform::Mastodon => PostRef::Mastodon(id),
            SocialPlatform::Threads => PostRef::Threads(id),
            SocialPlatform::Bluesky => {
                let this = StrongRef {
                    uri: format!("at://did:plc:mock/app.bsky.feed.post/{}", id),
                    cid: format!("cid-{}", id),
                };
                let root = match previous {
                    Some(PostRef::Bluesky { root, .. }) => root.clone(),
                    _ => this.clone(),
                };
                PostRef::Bluesky { root, this }
            }
        }
    }
}

#[async_trait]
impl PlatformPublisher for MockPublisher {
    fn platform(&self) -> SocialPlatform {
        self.platform
    }

    async fn authenticate(&mut self) -> Result<()> {
        record(&self.log, MockCall::Authenticate(self.platform));
        if let Some(error) = &self.behavior.auth_error {
            return Err(error.clone().into());
        }
        self.authenticated = true;
        Ok(())
    }

    async fn publish(
        &self,
        item: &PostThreadItem,
        previous: Option<&PostRef>,
        _attachments: &AttachmentCache,
    ) -> Result<PostRef> {
        record(
            &self.log,
            MockCall::Publish {
                platform: self.platform,
                text: item.text.clone(),
                previous: previous.map(|p| p.native_id().to_string()),
            },
        );

        if !self.authenticated {
            return Err(PlatformError::Authentication(format!(
                "mock {} publisher used before authenticate",
                self.platform
            ))
            .into());
        }
        if let Some(error) = &self.behavior.publish_error {
            return Err(error.clone().into());
        }
        if let Some((index, error)) = &self.behavior.fail_from_item {
            if self.published.load(Ordering::SeqCst) >= *index {
                return Err(error.clone().into());
            }
        }
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.behavior.transient_failures {
            return Err(PlatformError::Network(format!("mock {} connection reset", self.platform)).into());
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(self.make_ref(previous))
    }

    async fn close(&mut self) -> Result<()> {
        record(&self.log, MockCall::Close(self.platform));
        self.authenticated = false;
        Ok(())
    }
}

/// Factory handing out [`MockPublisher`]s that share one call log
#[derive(Clone, Default)]
pub struct MockPublisherFactory {
    behaviors: HashMap<SocialPlatform, MockBehavior>,
    log: CallLog,
    next_id: Arc<AtomicUsize>,
}

impl MockPublisherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, platform: SocialPlatform, behavior: MockBehavior) -> Self {
        self.behaviors.insert(platform, behavior);
        self
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Texts published on `platform` with the id each replied to
    pub fn published(&self, platform: SocialPlatform) -> Vec<(String, Option<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Publish {
                    platform: p,
                    text,
                    previous,
                } if p == platform => Some((text, previous)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl PublisherFactory for MockPublisherFactory {
    fn create(
        &self,
        platform: SocialPlatform,
        _group: &AccountGroup,
    ) -> Result<Box<dyn PlatformPublisher>> {
        let mut publisher =
            MockPublisher::new(platform, self.behaviors.get(&platform).cloned().unwrap_or_default());
        publisher.log = self.log.clone();
        publisher.next_id = self.next_id.clone();
        Ok(Box::new(publisher))
    }
}
