//! Thread publication
//!
//! A thread moves `Draft → Enqueued → {Sent | Error}`. Each sweep picks up the
//! enqueued threads that are due and publishes them, one after another, to
//! every platform that is enabled on the thread and credentialed on its
//! account group. The outcome of every platform leg is folded into the
//! thread's state, which is persisted once per thread.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::attachments::AttachmentCache;
use crate::db::Database;
use crate::error::{Result, ThreadcastError};
use crate::platforms::{PlatformPublisher, PublisherFactory};
use crate::quote::{PostResolver, QuoteRenderer};
use crate::resilience::RetryPolicy;
use crate::storage::BlobStore;
use crate::types::{AccountGroup, PostRef, PostThread, SocialPlatform, ThreadState};

/// Default tolerance for threads picked up after their scheduled time
pub const DEFAULT_GRACE_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    NotDue,
    Due,
    /// Past the grace window; the thread is failed without publishing
    Missed,
}

/// Decide what a sweep at `now` does with a thread scheduled at `scheduled_at`
pub fn schedule_decision(
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> ScheduleDecision {
    if scheduled_at > now {
        ScheduleDecision::NotDue
    } else if now - scheduled_at <= grace {
        ScheduleDecision::Due
    } else {
        ScheduleDecision::Missed
    }
}

/// Counts of what one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub sent: usize,
    pub failed: usize,
    pub missed: usize,
    pub not_due: usize,
}

/// Fold per-platform leg outcomes into the thread's error text.
///
/// `Ok` only when every leg succeeded; otherwise one `"{platform}: {error}"`
/// entry per failed leg, joined by `" | "`.
pub fn fold_leg_outcomes(outcomes: &[(SocialPlatform, Result<()>)]) -> std::result::Result<(), String> {
    let failures: Vec<String> = outcomes
        .iter()
        .filter_map(|(platform, outcome)| {
            outcome
                .as_ref()
                .err()
                .map(|e| format!("{}: {}", platform, e))
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join(" | "))
    }
}

/// What a thread needs before any platform leg can run
struct PreparedThread {
    group: AccountGroup,
    parent: Option<PostThread>,
    platforms: Vec<SocialPlatform>,
    attachments: AttachmentCache,
}

pub struct ThreadPublicationCoordinator {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn QuoteRenderer>,
    resolver: Arc<dyn PostResolver>,
    publishers: Arc<dyn PublisherFactory>,
    retry: RetryPolicy,
    grace_window: chrono::Duration,
    presign_ttl: Duration,
}

impl ThreadPublicationCoordinator {
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        renderer: Arc<dyn QuoteRenderer>,
        resolver: Arc<dyn PostResolver>,
        publishers: Arc<dyn PublisherFactory>,
    ) -> Self {
        Self {
            db,
            blobs,
            renderer,
            resolver,
            publishers,
            retry: RetryPolicy::default(),
            grace_window: chrono::Duration::seconds(DEFAULT_GRACE_WINDOW_SECS),
            presign_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_grace_window(mut self, grace_window: chrono::Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    pub fn with_presign_ttl(mut self, presign_ttl: Duration) -> Self {
        self.presign_ttl = presign_ttl;
        self
    }

    /// Publish every enqueued thread that is due now
    pub async fn process_due_threads(&self) -> Result<SweepSummary> {
        self.process_due_threads_at(Utc::now()).await
    }

    /// Publish every enqueued thread that is due at `now`.
    ///
    /// Only loading the candidate threads can fail the sweep. Failures while
    /// processing or persisting one thread are logged and the sweep moves on.
    pub async fn process_due_threads_at(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let threads = self.db.find_threads_by_state(ThreadState::Enqueued).await?;
        let mut summary = SweepSummary::default();

        for mut thread in threads {
            match schedule_decision(thread.scheduled_at, now, self.grace_window) {
                ScheduleDecision::NotDue => summary.not_due += 1,
                ScheduleDecision::Missed => {
                    summary.missed += 1;
                    let missed = ThreadcastError::ScheduleMissed {
                        scheduled_at: thread.scheduled_at,
                        grace_secs: self.grace_window.num_seconds(),
                    };
                    warn!(thread_id = %thread.id, "{}", missed);
                    thread.state = ThreadState::Error;
                    thread.error = Some(missed.to_string());
                    if let Err(e) = self.db.replace_thread(&thread).await {
                        error!(thread_id = %thread.id, "Failed to persist missed thread: {}", e);
                    }
                }
                ScheduleDecision::Due => match self.process_thread(&mut thread).await {
                    Ok(ThreadState::Sent) => summary.sent += 1,
                    Ok(_) => summary.failed += 1,
                    Err(e) => {
                        summary.failed += 1;
                        error!(thread_id = %thread.id, "Failed to persist thread: {}", e);
                    }
                },
            }
        }

        if summary != SweepSummary::default() {
            info!(
                sent = summary.sent,
                failed = summary.failed,
                missed = summary.missed,
                not_due = summary.not_due,
                "Thread sweep finished"
            );
        }
        Ok(summary)
    }

    /// Publish one thread and persist its final state.
    ///
    /// Returns the state the thread was left in. The error case is reserved
    /// for failing to persist it.
    pub async fn process_thread(&self, thread: &mut PostThread) -> Result<ThreadState> {
        info!(thread_id = %thread.id, name = %thread.name, "Publishing thread");

        match self.publish_thread(thread).await {
            Ok(()) => {
                thread.state = ThreadState::Sent;
                thread.error = None;
                info!(thread_id = %thread.id, "Thread sent");
            }
            Err(message) => {
                thread.state = ThreadState::Error;
                error!(thread_id = %thread.id, "Thread failed: {}", message);
                thread.error = Some(message);
            }
        }

        self.db.replace_thread(thread).await?;
        Ok(thread.state)
    }

    async fn publish_thread(&self, thread: &mut PostThread) -> std::result::Result<(), String> {
        let PreparedThread {
            group,
            parent,
            platforms,
            attachments,
        } = self.prepare(thread).await.map_err(|e| e.to_string())?;

        let mut outcomes = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let parent_tail = parent
                .as_ref()
                .and_then(|p| p.items.last())
                .and_then(|item| item.post_ref(platform));

            let outcome = self
                .run_leg(platform, &group, thread, parent_tail, &attachments)
                .await;
            if let Err(e) = &outcome {
                error!(thread_id = %thread.id, platform = %platform, "Publishing failed: {}", e);
            }
            outcomes.push((platform, outcome));
        }

        fold_leg_outcomes(&outcomes)
    }

    async fn prepare(&self, thread: &PostThread) -> Result<PreparedThread> {
        let group = self
            .db
            .get_account_group(&thread.account_group_id)
            .await?
            .ok_or_else(|| {
                ThreadcastError::NotFound(format!("account group {}", thread.account_group_id))
            })?;

        let parent = match &thread.parent_thread_id {
            Some(parent_id) => Some(
                self.db
                    .get_thread(parent_id)
                    .await?
                    .ok_or_else(|| ThreadcastError::NotFound(format!("parent thread {}", parent_id)))?,
            ),
            None => None,
        };

        let mut platforms = Vec::new();
        for platform in SocialPlatform::ALL {
            if !thread.enabled.get(platform) {
                continue;
            }
            if group.has_credentials(platform) {
                platforms.push(platform);
            } else {
                warn!(
                    thread_id = %thread.id,
                    platform = %platform,
                    "Platform enabled but account group {} has no credentials, skipping",
                    group.id
                );
            }
        }

        let mut attachments = AttachmentCache::new(
            self.db.clone(),
            self.blobs.clone(),
            self.renderer.clone(),
            self.resolver.clone(),
            self.presign_ttl,
        )
        .with_retry_policy(self.retry);
        attachments.populate(thread, &platforms).await?;

        Ok(PreparedThread {
            group,
            parent,
            platforms,
            attachments,
        })
    }

    /// Publish the whole thread on one platform
    async fn run_leg(
        &self,
        platform: SocialPlatform,
        group: &AccountGroup,
        thread: &mut PostThread,
        parent_tail: Option<PostRef>,
        attachments: &AttachmentCache,
    ) -> Result<()> {
        let mut publisher = self.publishers.create(platform, group)?;
        let outcome = self
            .publish_items(publisher.as_mut(), thread, parent_tail, attachments)
            .await;

        if let Err(e) = publisher.close().await {
            warn!(thread_id = %thread.id, platform = %platform, "Failed to close session: {}", e);
        }
        outcome
    }

    async fn publish_items(
        &self,
        publisher: &mut dyn PlatformPublisher,
        thread: &mut PostThread,
        mut previous: Option<PostRef>,
        attachments: &AttachmentCache,
    ) -> Result<()> {
        let platform = publisher.platform();
        self.retry
            .run_mut(
                &format!("{} authentication", platform),
                &mut *publisher,
                |p| p.authenticate(),
            )
            .await?;

        let publisher: &dyn PlatformPublisher = publisher;
        for index in 0..thread.items.len() {
            if let Some(existing) = thread.items[index].post_ref(platform) {
                debug!(
                    thread_id = %thread.id,
                    platform = %platform,
                    "Item {} already published as {}, skipping",
                    index,
                    existing.native_id()
                );
                previous = Some(existing);
                continue;
            }

            let item = &thread.items[index];
            let posted = self
                .retry
                .run(&format!("{} publish of item {}", platform, index), || {
                    publisher.publish(item, previous.as_ref(), attachments)
                })
                .await?;

            info!(
                thread_id = %thread.id,
                platform = %platform,
                "Published item {} as {}",
                index,
                posted.native_id()
            );
            thread.items[index].set_post_ref(posted.clone());
            previous = Some(posted);
        }
        Ok(())
    }
}
