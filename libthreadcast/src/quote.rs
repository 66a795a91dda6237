//! Quoted posts: URL recognition, cross-platform ids and screenshot rendering

use async_trait::async_trait;
use url::Url;

use crate::error::{Result, ThreadcastError};
use crate::types::{PostThreadItem, SocialPlatform, StrongRef};

/// Where a quoted post lives, with the identifying parts of its URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteOrigin {
    Twitter { user: String, status_id: String },
    Bluesky { actor: String, rkey: String },
}

impl QuoteOrigin {
    pub fn platform(&self) -> SocialPlatform {
        match self {
            QuoteOrigin::Twitter { .. } => SocialPlatform::Twitter,
            QuoteOrigin::Bluesky { .. } => SocialPlatform::Bluesky,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuote {
    pub sanitized_url: String,
    pub origin: QuoteOrigin,
}

fn unsupported(url: &str, reason: &str) -> ThreadcastError {
    ThreadcastError::InvalidInput(format!("unsupported quoted post URL {}: {}", url, reason))
}

/// Recognize a quoted post URL and reduce it to its canonical form.
///
/// `x.com` and the `www.`/`mobile.` aliases are normalized to `twitter.com`;
/// query strings and fragments (tracking parameters) are dropped.
pub fn parse_quoted_url(raw: &str) -> Result<ParsedQuote> {
    let url = Url::parse(raw.trim()).map_err(|e| unsupported(raw, &e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| unsupported(raw, "missing host"))?
        .to_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("mobile."))
        .unwrap_or(&host);
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match host {
        "twitter.com" | "x.com" => match segments.as_slice() {
            [user, "status", status_id, ..]
                if !status_id.is_empty() && status_id.chars().all(|c| c.is_ascii_digit()) =>
            {
                Ok(ParsedQuote {
                    sanitized_url: format!("https://twitter.com/{}/status/{}", user, status_id),
                    origin: QuoteOrigin::Twitter {
                        user: user.to_string(),
                        status_id: status_id.to_string(),
                    },
                })
            }
            _ => Err(unsupported(raw, "not a status URL")),
        },
        "bsky.app" => match segments.as_slice() {
            ["profile", actor, "post", rkey] => Ok(ParsedQuote {
                sanitized_url: format!("https://bsky.app/profile/{}/post/{}", actor, rkey),
                origin: QuoteOrigin::Bluesky {
                    actor: actor.to_string(),
                    rkey: rkey.to_string(),
                },
            }),
            _ => Err(unsupported(raw, "not a post URL")),
        },
        other => Err(unsupported(raw, &format!("host {} is not supported", other))),
    }
}

/// A rendered quoted-post image and where it can be fetched from
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub data: Vec<u8>,
    pub mime_type: String,
    /// Presigned URL for platforms that fetch media themselves
    pub url: String,
}

/// A quoted post resolved for one thread
#[derive(Debug, Clone)]
pub struct QuotedPost {
    pub sanitized_url: String,
    pub origin: QuoteOrigin,
    pub twitter_id: Option<String>,
    pub bluesky_ref: Option<StrongRef>,
    pub mastodon_id: Option<String>,
    pub threads_id: Option<String>,
    pub screenshot: Option<Screenshot>,
}

impl QuotedPost {
    pub fn new(parsed: ParsedQuote) -> Self {
        let twitter_id = match &parsed.origin {
            QuoteOrigin::Twitter { status_id, .. } => Some(status_id.clone()),
            QuoteOrigin::Bluesky { .. } => None,
        };
        Self {
            sanitized_url: parsed.sanitized_url,
            origin: parsed.origin,
            twitter_id,
            bluesky_ref: None,
            mastodon_id: None,
            threads_id: None,
            screenshot: None,
        }
    }

    /// The id identifying this post on its origin platform
    pub fn origin_native_id(&self) -> Option<String> {
        match self.origin {
            QuoteOrigin::Twitter { .. } => self.twitter_id.clone(),
            QuoteOrigin::Bluesky { .. } => self.bluesky_ref.as_ref().map(|r| r.uri.clone()),
        }
    }

    /// The id this post is known by on `platform`; a Bluesky post is known by its record uri
    pub fn native_id(&self, platform: SocialPlatform) -> Option<&str> {
        match platform {
            SocialPlatform::Twitter => self.twitter_id.as_deref(),
            SocialPlatform::Bluesky => self.bluesky_ref.as_ref().map(|r| r.uri.as_str()),
            SocialPlatform::Mastodon => self.mastodon_id.as_deref(),
            SocialPlatform::Threads => self.threads_id.as_deref(),
        }
    }

    pub fn has_native_id(&self, platform: SocialPlatform) -> bool {
        self.native_id(platform).is_some()
    }

    /// Whether `platform` can embed this post natively instead of a screenshot
    pub fn embeddable_on(&self, platform: SocialPlatform) -> bool {
        platform.supports_native_quote() && self.has_native_id(platform)
    }

    pub fn needs_screenshot(&self, platforms: &[SocialPlatform]) -> bool {
        platforms.iter().any(|p| !self.embeddable_on(*p))
    }

    /// Fill in ids from an item this system published for the same post
    pub fn merge_known_ids(&mut self, item: &PostThreadItem) {
        if self.twitter_id.is_none() {
            self.twitter_id = item.twitter_id.clone();
        }
        if self.bluesky_ref.is_none() {
            self.bluesky_ref = item.bluesky_this.clone();
        }
        if self.mastodon_id.is_none() {
            self.mastodon_id = item.mastodon_id.clone();
        }
        if self.threads_id.is_none() {
            self.threads_id = item.threads_id.clone();
        }
    }

    /// The preview page parameters for rendering this post
    pub fn preview_target(&self) -> Result<PreviewTarget> {
        let query = match (&self.origin, &self.bluesky_ref) {
            (QuoteOrigin::Twitter { .. }, _) => vec![("url".to_string(), self.sanitized_url.clone())],
            (QuoteOrigin::Bluesky { .. }, Some(strong_ref)) => vec![
                ("uri".to_string(), strong_ref.uri.clone()),
                ("cid".to_string(), strong_ref.cid.clone()),
            ],
            (QuoteOrigin::Bluesky { .. }, None) => {
                return Err(ThreadcastError::NotFound(format!(
                    "Bluesky record for {}",
                    self.sanitized_url
                )))
            }
        };
        Ok(PreviewTarget {
            platform: self.origin.platform(),
            query,
        })
    }
}

/// Internal preview page: `/quote/{platform}?{query}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewTarget {
    pub platform: SocialPlatform,
    pub query: Vec<(String, String)>,
}

impl PreviewTarget {
    pub fn url(&self, base_url: &str) -> Result<String> {
        let mut url = Url::parse(&format!(
            "{}/quote/{}",
            base_url.trim_end_matches('/'),
            self.platform
        ))
        .map_err(|e| ThreadcastError::InvalidInput(format!("preview base URL: {}", e)))?;
        url.query_pairs_mut().extend_pairs(self.query.iter());
        Ok(url.to_string())
    }
}

/// Renders a quoted post to PNG bytes
#[async_trait]
pub trait QuoteRenderer: Send + Sync {
    async fn render(&self, target: &PreviewTarget) -> Result<Vec<u8>>;
}

/// Resolves a Bluesky post URL to the strong reference needed to embed it
#[async_trait]
pub trait PostResolver: Send + Sync {
    async fn resolve_bluesky_post(&self, actor: &str, rkey: &str) -> Result<StrongRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twitter_urls_are_normalized() {
        for raw in [
            "https://x.com/jack/status/20?s=20&t=abc",
            "https://twitter.com/jack/status/20",
            "https://mobile.twitter.com/jack/status/20#frag",
            "http://www.x.com/jack/status/20/photo/1",
        ] {
            let parsed = parse_quoted_url(raw).unwrap();
            assert_eq!(parsed.sanitized_url, "https://twitter.com/jack/status/20");
            assert_eq!(
                parsed.origin,
                QuoteOrigin::Twitter {
                    user: "jack".to_string(),
                    status_id: "20".to_string()
                }
            );
        }
    }

    #[test]
    fn test_bluesky_urls() {
        let parsed =
            parse_quoted_url("https://bsky.app/profile/alice.bsky.social/post/3kabc?ref=share")
                .unwrap();
        assert_eq!(
            parsed.sanitized_url,
            "https://bsky.app/profile/alice.bsky.social/post/3kabc"
        );
        assert_eq!(parsed.origin.platform(), SocialPlatform::Bluesky);
    }

    #[test]
    fn test_unsupported_hosts_are_rejected() {
        for raw in [
            "https://mastodon.social/@alice/1",
            "https://twitter.com/jack",
            "https://twitter.com/jack/status/not-a-number",
            "not a url",
        ] {
            assert!(
                matches!(parse_quoted_url(raw), Err(ThreadcastError::InvalidInput(_))),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_screenshot_needed_for_mastodon_even_with_ids() {
        let mut quote = QuotedPost::new(parse_quoted_url("https://x.com/a/status/1").unwrap());
        quote.mastodon_id = Some("99".to_string());

        assert!(!quote.needs_screenshot(&[SocialPlatform::Twitter]));
        assert!(quote.needs_screenshot(&[SocialPlatform::Twitter, SocialPlatform::Mastodon]));
        assert!(quote.needs_screenshot(&[SocialPlatform::Threads]));
    }

    #[test]
    fn test_merge_known_ids_keeps_existing() {
        let mut quote = QuotedPost::new(parse_quoted_url("https://x.com/a/status/1").unwrap());
        let mut item = PostThreadItem::new("earlier");
        item.twitter_id = Some("1".to_string());
        item.threads_id = Some("t-1".to_string());
        item.bluesky_this = Some(StrongRef {
            uri: "at://did:plc:me/app.bsky.feed.post/x".to_string(),
            cid: "bafyx".to_string(),
        });

        quote.merge_known_ids(&item);
        assert_eq!(quote.twitter_id.as_deref(), Some("1"));
        assert_eq!(quote.threads_id.as_deref(), Some("t-1"));
        assert_eq!(
            quote.native_id(SocialPlatform::Bluesky),
            Some("at://did:plc:me/app.bsky.feed.post/x")
        );
        assert_eq!(quote.native_id(SocialPlatform::Mastodon), None);
        assert!(quote.embeddable_on(SocialPlatform::Bluesky));
        assert!(!quote.needs_screenshot(&[
            SocialPlatform::Twitter,
            SocialPlatform::Bluesky,
            SocialPlatform::Threads
        ]));
    }

    #[test]
    fn test_preview_urls() {
        let quote = QuotedPost::new(parse_quoted_url("https://x.com/a/status/1?s=1").unwrap());
        let url = quote
            .preview_target()
            .unwrap()
            .url("http://preview.local/")
            .unwrap();
        assert_eq!(
            url,
            "http://preview.local/quote/twitter?url=https%3A%2F%2Ftwitter.com%2Fa%2Fstatus%2F1"
        );

        let mut bsky =
            QuotedPost::new(parse_quoted_url("https://bsky.app/profile/a.b/post/xyz").unwrap());
        assert!(bsky.preview_target().is_err());
        bsky.bluesky_ref = Some(StrongRef {
            uri: "at://did:plc:a/app.bsky.feed.post/xyz".to_string(),
            cid: "bafy".to_string(),
        });
        let url = bsky.preview_target().unwrap().url("http://preview.local").unwrap();
        assert!(url.starts_with("http://preview.local/quote/bluesky?uri=at%3A%2F%2F"));
        assert!(url.ends_with("&cid=bafy"));
    }
}
