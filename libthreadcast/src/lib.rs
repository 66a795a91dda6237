//! Threadcast - scheduled thread publishing across social platforms
//!
//! This library holds the publication pipeline: the scheduler, the thread
//! coordinator and its state machine, per-thread attachment preparation,
//! media transcoding, and publishers for Twitter, Bluesky, Mastodon and
//! Threads.

pub mod attachments;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod platforms;
pub mod quote;
pub mod resilience;
pub mod scheduler;
pub mod storage;
pub mod text;
pub mod transcoder;
pub mod types;
pub mod webdriver;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{SweepSummary, ThreadPublicationCoordinator};
pub use db::Database;
pub use error::{Result, ThreadcastError};
pub use types::{
    AccountGroup, MediaUploadJob, PostRef, PostThread, PostThreadItem, SocialPlatform, ThreadState,
    UploadedMedia,
};
