//! Core types for Threadcast

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// The closed set of platforms a thread can be published to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SocialPlatform {
    Twitter,
    Bluesky,
    Mastodon,
    Threads,
}

impl SocialPlatform {
    /// Every platform, in the order publish legs run
    pub const ALL: [SocialPlatform; 4] = [
        SocialPlatform::Twitter,
        SocialPlatform::Bluesky,
        SocialPlatform::Mastodon,
        SocialPlatform::Threads,
    ];

    /// Lowercase name used in storage keys and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Bluesky => "bluesky",
            Self::Mastodon => "mastodon",
            Self::Threads => "threads",
        }
    }

    /// Whether the platform can embed a quoted post by its native id.
    ///
    /// Mastodon has no quote primitive, so quoted posts are always rendered
    /// as a screenshot there.
    pub fn supports_native_quote(&self) -> bool {
        !matches!(self, Self::Mastodon)
    }
}

impl std::fmt::Display for SocialPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SocialPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twitter" | "x" => Ok(Self::Twitter),
            "bluesky" | "bsky" => Ok(Self::Bluesky),
            "mastodon" => Ok(Self::Mastodon),
            "threads" => Ok(Self::Threads),
            _ => Err(format!(
                "Invalid platform: '{}'. Valid options: twitter, bluesky, mastodon, threads",
                s
            )),
        }
    }
}

/// One boolean per platform
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformFlags {
    pub twitter: bool,
    pub bluesky: bool,
    pub mastodon: bool,
    pub threads: bool,
}

impl PlatformFlags {
    pub fn all() -> Self {
        Self {
            twitter: true,
            bluesky: true,
            mastodon: true,
            threads: true,
        }
    }

    pub fn only(platforms: &[SocialPlatform]) -> Self {
        let mut flags = Self::default();
        for platform in platforms {
            flags.set(*platform, true);
        }
        flags
    }

    pub fn get(&self, platform: SocialPlatform) -> bool {
        match platform {
            SocialPlatform::Twitter => self.twitter,
            SocialPlatform::Bluesky => self.bluesky,
            SocialPlatform::Mastodon => self.mastodon,
            SocialPlatform::Threads => self.threads,
        }
    }

    pub fn set(&mut self, platform: SocialPlatform, value: bool) {
        match platform {
            SocialPlatform::Twitter => self.twitter = value,
            SocialPlatform::Bluesky => self.bluesky = value,
            SocialPlatform::Mastodon => self.mastodon = value,
            SocialPlatform::Threads => self.threads = value,
        }
    }
}

// ============================================================================
// Threads
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Draft,
    Enqueued,
    Sent,
    Error,
}

impl ThreadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Enqueued => "enqueued",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

/// An AT-Protocol strong reference to a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

/// The id one platform assigned to one published item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostRef {
    Twitter(String),
    Bluesky { root: StrongRef, this: StrongRef },
    Mastodon(String),
    Threads(String),
}

impl PostRef {
    pub fn platform(&self) -> SocialPlatform {
        match self {
            PostRef::Twitter(_) => SocialPlatform::Twitter,
            PostRef::Bluesky { .. } => SocialPlatform::Bluesky,
            PostRef::Mastodon(_) => SocialPlatform::Mastodon,
            PostRef::Threads(_) => SocialPlatform::Threads,
        }
    }

    /// The platform-native identifier as a plain string
    pub fn native_id(&self) -> &str {
        match self {
            PostRef::Twitter(id) | PostRef::Mastodon(id) | PostRef::Threads(id) => id,
            PostRef::Bluesky { this, .. } => &this.uri,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostThreadItem {
    pub text: String,
    /// Attached media ids, in display order
    pub media: Vec<String>,
    pub quoted_post_url: Option<String>,
    pub twitter_id: Option<String>,
    pub bluesky_root: Option<StrongRef>,
    pub bluesky_this: Option<StrongRef>,
    pub mastodon_id: Option<String>,
    pub threads_id: Option<String>,
}

impl PostThreadItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// The id this item was published under on `platform`, if any
    pub fn post_ref(&self, platform: SocialPlatform) -> Option<PostRef> {
        match platform {
            SocialPlatform::Twitter => self.twitter_id.clone().map(PostRef::Twitter),
            SocialPlatform::Bluesky => match (&self.bluesky_root, &self.bluesky_this) {
                (Some(root), Some(this)) => Some(PostRef::Bluesky {
                    root: root.clone(),
                    this: this.clone(),
                }),
                _ => None,
            },
            SocialPlatform::Mastodon => self.mastodon_id.clone().map(PostRef::Mastodon),
            SocialPlatform::Threads => self.threads_id.clone().map(PostRef::Threads),
        }
    }

    pub fn set_post_ref(&mut self, post_ref: PostRef) {
        match post_ref {
            PostRef::Twitter(id) => self.twitter_id = Some(id),
            PostRef::Bluesky { root, this } => {
                self.bluesky_root = Some(root);
                self.bluesky_this = Some(this);
            }
            PostRef::Mastodon(id) => self.mastodon_id = Some(id),
            PostRef::Threads(id) => self.threads_id = Some(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostThread {
    pub id: String,
    pub name: String,
    pub account_group_id: String,
    #[serde(default)]
    pub enabled: PlatformFlags,
    #[serde(default)]
    pub parent_thread_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub state: ThreadState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub items: Vec<PostThreadItem>,
}

impl PostThread {
    pub fn new(name: impl Into<String>, account_group_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            account_group_id: account_group_id.into(),
            enabled: PlatformFlags::default(),
            parent_thread_id: None,
            scheduled_at: Utc::now(),
            state: ThreadState::Draft,
            error: None,
            items: Vec::new(),
        }
    }
}

// ============================================================================
// Media
// ============================================================================

/// Broad category of a media mime type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Gif,
    Video,
}

impl MediaKind {
    pub fn from_mime_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/png" | "image/webp" => Some(Self::Image),
            "image/gif" => Some(Self::Gif),
            "video/mp4" | "video/quicktime" | "video/webm" | "video/x-matroska" => {
                Some(Self::Video)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedMedia {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alt_text: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    /// Which platforms have a size-optimized variant in storage
    #[serde(default)]
    pub optimized: PlatformFlags,
}

impl UploadedMedia {
    pub fn is_video(&self) -> bool {
        self.mime_type.to_lowercase().starts_with("video/")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaJobState {
    Ready,
    Success,
    Failed,
}

impl MediaJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// A freshly uploaded file waiting to become an [`UploadedMedia`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaUploadJob {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub alt_text: String,
    pub created_at: DateTime<Utc>,
    pub state: MediaJobState,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub media_id: Option<String>,
}

impl MediaUploadJob {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            mime_type: mime_type.into(),
            alt_text: String::new(),
            created_at: Utc::now(),
            state: MediaJobState::Ready,
            error_detail: None,
            media_id: None,
        }
    }
}

// ============================================================================
// Account groups
// ============================================================================

fn serialize_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterCredentials {
    /// OAuth 2.0 user-context access token
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub access_token: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyCredentials {
    /// PDS base URL, e.g. `https://bsky.social`
    pub service: String,
    pub identifier: String,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub app_password: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonCredentials {
    pub instance: String,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub access_token: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsCredentials {
    pub user_id: String,
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub access_token: SecretString,
}

/// One logical account's credentials across every platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub twitter: Option<TwitterCredentials>,
    #[serde(default)]
    pub bluesky: Option<BlueskyCredentials>,
    #[serde(default)]
    pub mastodon: Option<MastodonCredentials>,
    #[serde(default)]
    pub threads: Option<ThreadsCredentials>,
}

impl AccountGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            twitter: None,
            bluesky: None,
            mastodon: None,
            threads: None,
        }
    }

    pub fn has_credentials(&self, platform: SocialPlatform) -> bool {
        match platform {
            SocialPlatform::Twitter => self.twitter.is_some(),
            SocialPlatform::Bluesky => self.bluesky.is_some(),
            SocialPlatform::Mastodon => self.mastodon.is_some(),
            SocialPlatform::Threads => self.threads.is_some(),
        }
    }
}
