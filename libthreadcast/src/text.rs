//! URL and hashtag detection in post text
//!
//! Spans are reported the way the text-analysis service reports them:
//! `[start, end)` in UTF-16 code units. Callers that need UTF-8 byte offsets
//! (Bluesky facets) convert with [`utf16_to_byte_offset`].

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{PlatformError, Result};

/// A detected entity and its `[start, end)` position in UTF-16 code units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    /// The URL, or the hashtag without its leading `#`
    pub text: String,
    pub start: usize,
    pub end: usize,
}

#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    async fn extract_urls(&self, text: &str) -> Result<Vec<TextSpan>>;

    /// Hashtag spans cover the `#`; `TextSpan::text` does not
    async fn extract_hashtags(&self, text: &str) -> Result<Vec<TextSpan>>;
}

/// Byte offset of the UTF-16 index `utf16_index` in `text`.
///
/// `None` if the index is past the end or splits a surrogate pair.
pub fn utf16_to_byte_offset(text: &str, utf16_index: usize) -> Option<usize> {
    let mut units = 0;
    for (byte_index, ch) in text.char_indices() {
        if units == utf16_index {
            return Some(byte_index);
        }
        if units > utf16_index {
            return None;
        }
        units += ch.len_utf16();
    }
    (units == utf16_index).then_some(text.len())
}

/// UTF-16 index of the byte offset `byte_index` in `text`
pub fn byte_to_utf16_offset(text: &str, byte_index: usize) -> usize {
    text[..byte_index].encode_utf16().count()
}

// ============================================================================
// Remote service
// ============================================================================

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct UrlEntity {
    url: String,
    indices: [usize; 2],
}

#[derive(Deserialize)]
struct HashtagEntity {
    hashtag: String,
    indices: [usize; 2],
}

/// Client for the text-analysis service (`/api/extract-urls`, `/api/extract-hashtags`)
pub struct HttpTextAnalyzer {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTextAnalyzer {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, path: &str, text: &str) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&AnalyzeRequest { text })
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("text analyzer: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("text analyzer returned {}", status);
            return Err(if status.is_server_error() {
                PlatformError::Network(message)
            } else {
                PlatformError::Validation(message)
            }
            .into());
        }

        Ok(response
            .json()
            .await
            .map_err(|e| PlatformError::Network(format!("text analyzer response: {}", e)))?)
    }
}

#[async_trait]
impl TextAnalyzer for HttpTextAnalyzer {
    async fn extract_urls(&self, text: &str) -> Result<Vec<TextSpan>> {
        let entities: Vec<UrlEntity> = self.call("/api/extract-urls", text).await?;
        Ok(entities
            .into_iter()
            .map(|e| TextSpan {
                text: e.url,
                start: e.indices[0],
                end: e.indices[1],
            })
            .collect())
    }

    async fn extract_hashtags(&self, text: &str) -> Result<Vec<TextSpan>> {
        let entities: Vec<HashtagEntity> = self.call("/api/extract-hashtags", text).await?;
        Ok(entities
            .into_iter()
            .map(|e| TextSpan {
                text: e.hashtag,
                start: e.indices[0],
                end: e.indices[1],
            })
            .collect())
    }
}

// ============================================================================
// Built-in extractor
// ============================================================================

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https?://[^\s<>()\[\]{}]+").expect("URL pattern is valid")
    })
}

fn hashtag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^\w&/])(#(\w*\p{L}\w*))").expect("hashtag pattern is valid"))
}

/// Regex-based extractor used when no text-analysis service is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexTextAnalyzer;

impl RegexTextAnalyzer {
    pub fn urls(text: &str) -> Vec<TextSpan> {
        url_regex()
            .find_iter(text)
            .map(|m| {
                // Sentence punctuation directly after a link is not part of it
                let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', '"', '\'']);
                let start = m.start();
                TextSpan {
                    text: url.to_string(),
                    start: byte_to_utf16_offset(text, start),
                    end: byte_to_utf16_offset(text, start + url.len()),
                }
            })
            .collect()
    }

    pub fn hashtags(text: &str) -> Vec<TextSpan> {
        hashtag_regex()
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(1)?;
                let tag = caps.get(2)?;
                Some(TextSpan {
                    text: tag.as_str().to_string(),
                    start: byte_to_utf16_offset(text, whole.start()),
                    end: byte_to_utf16_offset(text, whole.end()),
                })
            })
            .collect()
    }
}

#[async_trait]
impl TextAnalyzer for RegexTextAnalyzer {
    async fn extract_urls(&self, text: &str) -> Result<Vec<TextSpan>> {
        Ok(Self::urls(text))
    }

    async fn extract_hashtags(&self, text: &str) -> Result<Vec<TextSpan>> {
        Ok(Self::hashtags(text))
    }
}
