//! Bluesky publisher over AT Protocol XRPC

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::attachments::AttachmentCache;
use crate::error::{PlatformError, Result};
use crate::platforms::{send, send_json, HttpSettings, PlatformPublisher};
use crate::quote::PostResolver;
use crate::text::{utf16_to_byte_offset, TextAnalyzer, TextSpan};
use crate::transcoder::image_dimensions;
use crate::types::{BlueskyCredentials, PostRef, PostThreadItem, SocialPlatform, StrongRef};

const PLATFORM: SocialPlatform = SocialPlatform::Bluesky;

const MAX_LINK_LABEL: usize = 30;
const QUOTE_LINK_TEXT: &str = "Original post";

// ============================================================================
// Rich text
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteSlice {
    pub byte_start: usize,
    pub byte_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
    #[serde(rename = "app.bsky.richtext.facet#tag")]
    Tag { tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Facet {
    pub index: ByteSlice,
    pub features: Vec<FacetFeature>,
}

/// Post text after link shortening, with facets indexing into it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RichText {
    pub text: String,
    pub facets: Vec<Facet>,
}

impl RichText {
    /// Append a paragraph that is entirely a link to `uri`
    pub fn push_link_paragraph(&mut self, label: &str, uri: &str) {
        let trimmed = self.text.trim_end().len();
        self.text.truncate(trimmed);
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        let byte_start = self.text.len();
        self.text.push_str(label);
        self.facets.push(Facet {
            index: ByteSlice {
                byte_start,
                byte_end: self.text.len(),
            },
            features: vec![FacetFeature::Link {
                uri: uri.to_string(),
            }],
        });
    }
}

/// Display label for a link: no scheme, no `www.`, at most 30 characters
pub fn link_label(url: &str) -> String {
    let bare = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let bare = bare.strip_prefix("www.").unwrap_or(bare);

    if bare.chars().count() > MAX_LINK_LABEL {
        let cut: String = bare.chars().take(MAX_LINK_LABEL - 3).collect();
        format!("{}...", cut)
    } else {
        bare.to_string()
    }
}

fn link_target(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

enum Entity<'a> {
    Link(&'a TextSpan),
    Tag(&'a TextSpan),
}

impl Entity<'_> {
    fn span(&self) -> &TextSpan {
        match self {
            Entity::Link(span) | Entity::Tag(span) => span,
        }
    }
}

/// Rewrite `text` with shortened link labels and compute byte-offset facets.
///
/// `urls` and `hashtags` carry UTF-16 spans into `text`. Spans that overlap an
/// earlier span, or do not fall on character boundaries, are left as plain text.
pub fn build_rich_text(text: &str, urls: &[TextSpan], hashtags: &[TextSpan]) -> RichText {
    let mut entities: Vec<Entity> = urls
        .iter()
        .map(Entity::Link)
        .chain(hashtags.iter().map(Entity::Tag))
        .collect();
    entities.sort_by_key(|e| e.span().start);

    let mut out = RichText::default();
    let mut cursor = 0;

    for entity in &entities {
        let span = entity.span();
        let (Some(start), Some(end)) = (
            utf16_to_byte_offset(text, span.start),
            utf16_to_byte_offset(text, span.end),
        ) else {
            continue;
        };
        if start < cursor || end <= start {
            continue;
        }

        out.text.push_str(&text[cursor..start]);
        let byte_start = out.text.len();
        let feature = match entity {
            Entity::Link(span) => {
                out.text.push_str(&link_label(&span.text));
                FacetFeature::Link {
                    uri: link_target(&span.text),
                }
            }
            Entity::Tag(span) => {
                out.text.push_str(&text[start..end]);
                FacetFeature::Tag {
                    tag: span.text.clone(),
                }
            }
        };
        out.facets.push(Facet {
            index: ByteSlice {
                byte_start,
                byte_end: out.text.len(),
            },
            features: vec![feature],
        });
        cursor = end;
    }

    out.text.push_str(&text[cursor..]);
    out
}

// ============================================================================
// XRPC
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
    handle: String,
}

#[derive(Deserialize)]
struct UploadBlobResponse {
    blob: Value,
}

#[derive(Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    record: Value,
}

fn xrpc(base: &str, method: &str) -> String {
    format!("{}/xrpc/{}", base.trim_end_matches('/'), method)
}

fn strong_ref_json(strong_ref: &StrongRef) -> Value {
    json!({ "uri": strong_ref.uri, "cid": strong_ref.cid })
}

fn aspect_ratio(width: u32, height: u32) -> Option<Value> {
    (width > 0 && height > 0).then(|| json!({ "width": width, "height": height }))
}

pub struct BlueskyPublisher {
    settings: HttpSettings,
    service: String,
    identifier: String,
    app_password: SecretString,
    text_analyzer: Arc<dyn TextAnalyzer>,
    session: Option<Session>,
}

impl BlueskyPublisher {
    pub fn new(
        settings: HttpSettings,
        credentials: &BlueskyCredentials,
        text_analyzer: Arc<dyn TextAnalyzer>,
    ) -> Self {
        Self {
            settings,
            service: credentials.service.trim_end_matches('/').to_string(),
            identifier: credentials.identifier.clone(),
            app_password: credentials.app_password.clone(),
            text_analyzer,
            session: None,
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(|| {
            PlatformError::Authentication("Bluesky session is not open".to_string()).into()
        })
    }

    async fn upload_blob(&self, data: &[u8], mime_type: &str) -> Result<Value> {
        let session = self.session()?;
        let uploaded: UploadBlobResponse = send_json(
            PLATFORM,
            "upload blob",
            self.settings
                .http
                .post(xrpc(&self.service, "com.atproto.repo.uploadBlob"))
                .bearer_auth(&session.access_jwt)
                .header(reqwest::header::CONTENT_TYPE, mime_type)
                .body(data.to_vec()),
        )
        .await?;
        Ok(uploaded.blob)
    }

    async fn rich_text(&self, text: &str) -> Result<RichText> {
        if text.is_empty() {
            return Ok(RichText::default());
        }
        let urls = self.text_analyzer.extract_urls(text).await?;
        let hashtags = self.text_analyzer.extract_hashtags(text).await?;
        Ok(build_rich_text(text, &urls, &hashtags))
    }

    /// Media embed for the item: images, or a single video.
    ///
    /// A video cannot share an embed with images, so a video item with other
    /// media is rejected, and a quoted-post screenshot is dropped in favour of
    /// the link paragraph the caller already appended.
    async fn media_embed(
        &self,
        item: &PostThreadItem,
        attachments: &AttachmentCache,
        extra_image: Option<(Vec<u8>, &str, String)>,
    ) -> Result<Option<Value>> {
        let videos = item
            .media
            .iter()
            .map(|id| attachments.media(id).map(|m| m.is_video()))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|is_video| *is_video)
            .count();

        if videos > 0 {
            if item.media.len() > 1 {
                return Err(PlatformError::Validation(
                    "Bluesky posts carry either one video or up to four images".to_string(),
                )
                .into());
            }
            if extra_image.is_some() {
                debug!("Video item quotes a post; linking the quoted post without its screenshot");
            }

            let media_id = &item.media[0];
            let media = attachments.media(media_id)?;
            let data = attachments.media_data(media_id, PLATFORM)?;
            let mime_type = attachments.media_mime_type(media_id, PLATFORM)?;
            let blob = self.upload_blob(data, mime_type).await?;
            let mut video = json!({
                "$type": "app.bsky.embed.video",
                "video": blob,
                "alt": media.alt_text,
            });
            if let Some(ratio) = aspect_ratio(media.width, media.height) {
                video["aspectRatio"] = ratio;
            }
            return Ok(Some(video));
        }

        let mut images = Vec::new();
        for media_id in &item.media {
            let media = attachments.media(media_id)?;
            let data = attachments.media_data(media_id, PLATFORM)?;
            let mime_type = attachments.media_mime_type(media_id, PLATFORM)?;
            let blob = self.upload_blob(data, mime_type).await?;

            let mut image = json!({ "alt": media.alt_text, "image": blob });
            if let Some(ratio) = aspect_ratio(media.width, media.height) {
                image["aspectRatio"] = ratio;
            }
            images.push(image);
        }

        if let Some((data, mime_type, alt)) = extra_image {
            let blob = self.upload_blob(&data, mime_type).await?;
            let mut image = json!({ "alt": alt, "image": blob });
            if let Some(ratio) = image_dimensions(&data)
                .ok()
                .and_then(|(w, h)| aspect_ratio(w, h))
            {
                image["aspectRatio"] = ratio;
            }
            images.push(image);
        }

        Ok((!images.is_empty()).then(|| {
            json!({
                "$type": "app.bsky.embed.images",
                "images": images,
            })
        }))
    }
}

#[async_trait]
impl PlatformPublisher for BlueskyPublisher {
    fn platform(&self) -> SocialPlatform {
        PLATFORM
    }

    async fn authenticate(&mut self) -> Result<()> {
        let session: Session = send_json(
            PLATFORM,
            "create session",
            self.settings
                .http
                .post(xrpc(&self.service, "com.atproto.server.createSession"))
                .json(&json!({
                    "identifier": self.identifier,
                    "password": self.app_password.expose_secret(),
                })),
        )
        .await?;
        debug!(did = %session.did, handle = %session.handle, "Opened Bluesky session");
        self.session = Some(session);
        Ok(())
    }

    async fn publish(
        &self,
        item: &PostThreadItem,
        previous: Option<&PostRef>,
        attachments: &AttachmentCache,
    ) -> Result<PostRef> {
        let reply = match previous {
            None => None,
            Some(PostRef::Bluesky { root, this }) => Some((root.clone(), this.clone())),
            Some(other) => {
                return Err(PlatformError::Validation(format!(
                    "cannot reply on Bluesky to a {} post",
                    other.platform()
                ))
                .into())
            }
        };

        let mut rich_text = self.rich_text(&item.text).await?;
        let mut record_embed = None;
        let mut screenshot = None;

        if let Some(url) = &item.quoted_post_url {
            let quote = attachments.quoted_post(url)?;
            match &quote.bluesky_ref {
                Some(strong_ref) => {
                    record_embed = Some(json!({
                        "$type": "app.bsky.embed.record",
                        "record": strong_ref_json(strong_ref),
                    }));
                }
                None => {
                    let shot = quote.screenshot.as_ref().ok_or_else(|| {
                        PlatformError::Processing(format!("no screenshot for {}", quote.sanitized_url))
                    })?;
                    screenshot = Some((
                        shot.data.clone(),
                        shot.mime_type.as_str(),
                        format!("Screenshot of {}", quote.sanitized_url),
                    ));
                    rich_text.push_link_paragraph(QUOTE_LINK_TEXT, &quote.sanitized_url);
                }
            }
        }

        let media_embed = self.media_embed(item, attachments, screenshot).await?;
        let embed = match (record_embed, media_embed) {
            (Some(record), Some(media)) => Some(json!({
                "$type": "app.bsky.embed.recordWithMedia",
                "record": record,
                "media": media,
            })),
            (record, media) => record.or(media),
        };

        let mut record = json!({
            "$type": "app.bsky.feed.post",
            "text": rich_text.text,
            "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if !rich_text.facets.is_empty() {
            record["facets"] = serde_json::to_value(&rich_text.facets).map_err(|e| {
                PlatformError::Posting(format!("failed to encode facets: {}", e))
            })?;
        }
        if let Some((root, parent)) = &reply {
            record["reply"] = json!({
                "root": strong_ref_json(root),
                "parent": strong_ref_json(parent),
            });
        }
        if let Some(embed) = embed {
            record["embed"] = embed;
        }

        let session = self.session()?;
        let created: StrongRef = send_json(
            PLATFORM,
            "create record",
            self.settings
                .http
                .post(xrpc(&self.service, "com.atproto.repo.createRecord"))
                .bearer_auth(&session.access_jwt)
                .json(&CreateRecordRequest {
                    repo: &session.did,
                    collection: "app.bsky.feed.post",
                    record,
                }),
        )
        .await?;

        debug!("Posted Bluesky record {}", created.uri);
        let root = reply.map(|(root, _)| root).unwrap_or_else(|| created.clone());
        Ok(PostRef::Bluesky {
            root,
            this: created,
        })
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        if let Err(e) = send(
            PLATFORM,
            "delete session",
            self.settings
                .http
                .post(xrpc(&self.service, "com.atproto.server.deleteSession"))
                .bearer_auth(&session.refresh_jwt),
        )
        .await
        {
            warn!("Failed to close Bluesky session: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

// ============================================================================
// Quoted post resolution
// ============================================================================

#[derive(Deserialize)]
struct ResolvedHandle {
    did: String,
}

/// Resolves `bsky.app` post URLs through a public AppView
pub struct BlueskyPostResolver {
    http: reqwest::Client,
    appview: String,
}

impl BlueskyPostResolver {
    pub fn new(http: reqwest::Client, appview: &str) -> Self {
        Self {
            http,
            appview: appview.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PostResolver for BlueskyPostResolver {
    async fn resolve_bluesky_post(&self, actor: &str, rkey: &str) -> Result<StrongRef> {
        let did = if actor.starts_with("did:") {
            actor.to_string()
        } else {
            let resolved: ResolvedHandle = send_json(
                PLATFORM,
                "resolve handle",
                self.http
                    .get(xrpc(&self.appview, "com.atproto.identity.resolveHandle"))
                    .query(&[("handle", actor)]),
            )
            .await?;
            resolved.did
        };

        send_json(
            PLATFORM,
            "get record",
            self.http
                .get(xrpc(&self.appview, "com.atproto.repo.getRecord"))
                .query(&[
                    ("repo", did.as_str()),
                    ("collection", "app.bsky.feed.post"),
                    ("rkey", rkey),
                ]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::test_support::Fixture;
    use crate::text::RegexTextAnalyzer;
    use crate::types::PostThread;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn span(text: &str, start: usize, end: usize) -> TextSpan {
        TextSpan {
            text: text.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn test_link_label() {
        assert_eq!(link_label("https://www.example.com/a"), "example.com/a");
        assert_eq!(link_label("http://example.com"), "example.com");
        assert_eq!(
            link_label("https://example.com/a/very/long/path/that/goes/on"),
            "example.com/a/very/long/pat..."
        );
        assert_eq!(link_label("https://example.com/a/very/long/pat...").chars().count(), 30);
    }

    #[test]
    fn test_facet_offsets_are_utf8_bytes_into_rewritten_text() {
        let text = "héllo 🎉 https://www.example.com/some/really/long/path #rust";
        let urls = RegexTextAnalyzer::urls(text);
        let tags = RegexTextAnalyzer::hashtags(text);
        let rich = build_rich_text(text, &urls, &tags);

        let label = "example.com/some/really/lon...";
        assert_eq!(rich.text, format!("héllo 🎉 {} #rust", label));

        let link = &rich.facets[0];
        // "héllo 🎉 " is 6 + 1 + 4 + 1 bytes
        assert_eq!(link.index.byte_start, "héllo 🎉 ".len());
        assert_eq!(link.index.byte_end - link.index.byte_start, label.len());
        assert_eq!(
            link.features,
            vec![FacetFeature::Link {
                uri: "https://www.example.com/some/really/long/path".to_string()
            }]
        );

        let tag = &rich.facets[1];
        assert_eq!(&rich.text[tag.index.byte_start..tag.index.byte_end], "#rust");
        assert_eq!(
            tag.features,
            vec![FacetFeature::Tag {
                tag: "rust".to_string()
            }]
        );
    }

    #[test]
    fn test_overlapping_spans_are_skipped() {
        let text = "see example.com/#tag now";
        let urls = vec![span("example.com/#tag", 4, 20)];
        let tags = vec![span("tag", 16, 20)];
        let rich = build_rich_text(text, &urls, &tags);
        assert_eq!(rich.facets.len(), 1);
        assert_eq!(rich.text, text);
        assert_eq!(
            rich.facets[0].features,
            vec![FacetFeature::Link {
                uri: "https://example.com/#tag".to_string()
            }]
        );
    }

    #[test]
    fn test_quote_link_paragraph() {
        let mut rich = build_rich_text("look at this  ", &[], &[]);
        rich.push_link_paragraph(QUOTE_LINK_TEXT, "https://twitter.com/a/status/1");
        assert_eq!(rich.text, "look at this\n\nOriginal post");
        let facet = &rich.facets[0];
        assert_eq!(&rich.text[facet.index.byte_start..facet.index.byte_end], "Original post");
    }

    #[test]
    fn test_facet_serialization() {
        let facet = Facet {
            index: ByteSlice {
                byte_start: 0,
                byte_end: 4,
            },
            features: vec![FacetFeature::Tag {
                tag: "rust".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&facet).unwrap(),
            json!({
                "index": {"byteStart": 0, "byteEnd": 4},
                "features": [{"$type": "app.bsky.richtext.facet#tag", "tag": "rust"}]
            })
        );
    }

    fn publisher(server: &MockServer) -> BlueskyPublisher {
        BlueskyPublisher::new(
            HttpSettings {
                http: reqwest::Client::new(),
                poll_interval: Duration::from_millis(10),
                poll_timeout: Duration::from_secs(5),
            },
            &BlueskyCredentials {
                service: server.uri(),
                identifier: "alice.test".to_string(),
                app_password: SecretString::from("app-pass".to_string()),
            },
            Arc::new(RegexTextAnalyzer),
        )
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .and(body_partial_json(json!({"identifier": "alice.test", "password": "app-pass"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": "access", "refreshJwt": "refresh",
                "did": "did:plc:alice", "handle": "alice.test"
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.deleteSession"))
            .and(header("authorization", "Bearer refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_publish_chains_root_and_parent() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "Bearer access"))
            .and(body_partial_json(json!({
                "repo": "did:plc:alice",
                "collection": "app.bsky.feed.post",
                "record": {
                    "text": "second",
                    "reply": {
                        "root": {"uri": "at://root", "cid": "root-cid"},
                        "parent": {"uri": "at://first", "cid": "first-cid"}
                    }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://second", "cid": "second-cid"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let cache = fx.cache();
        let mut bsky = publisher(&server);
        bsky.authenticate().await.unwrap();

        let previous = PostRef::Bluesky {
            root: StrongRef {
                uri: "at://root".to_string(),
                cid: "root-cid".to_string(),
            },
            this: StrongRef {
                uri: "at://first".to_string(),
                cid: "first-cid".to_string(),
            },
        };
        let posted = bsky
            .publish(&PostThreadItem::new("second"), Some(&previous), &cache)
            .await
            .unwrap();
        bsky.close().await.unwrap();

        match posted {
            PostRef::Bluesky { root, this } => {
                assert_eq!(root.uri, "at://root");
                assert_eq!(this.uri, "at://second");
            }
            other => panic!("unexpected ref {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_post_is_its_own_root() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://first", "cid": "c1"
            })))
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let cache = fx.cache();
        let mut bsky = publisher(&server);
        bsky.authenticate().await.unwrap();
        let posted = bsky
            .publish(&PostThreadItem::new("hello"), None, &cache)
            .await
            .unwrap();
        bsky.close().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let create: &Request = requests
            .iter()
            .find(|r| r.url.path().ends_with("createRecord"))
            .unwrap();
        let body: Value = serde_json::from_slice(&create.body).unwrap();
        assert!(body["record"].get("reply").is_none());

        assert_eq!(
            posted,
            PostRef::Bluesky {
                root: StrongRef {
                    uri: "at://first".to_string(),
                    cid: "c1".to_string()
                },
                this: StrongRef {
                    uri: "at://first".to_string(),
                    cid: "c1".to_string()
                },
            }
        );
    }

    #[tokio::test]
    async fn test_record_quote_with_images_uses_record_with_media() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .and(header("content-type", "image/jpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "blob": {"$type": "blob", "ref": {"$link": "bafkimg"}, "mimeType": "image/jpeg", "size": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "record": {"embed": {
                    "$type": "app.bsky.embed.recordWithMedia",
                    "record": {
                        "$type": "app.bsky.embed.record",
                        "record": {"uri": "at://did:plc:bob.test/app.bsky.feed.post/xyz", "cid": "cid-xyz"}
                    },
                    "media": {"$type": "app.bsky.embed.images"}
                }}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://q", "cid": "cq"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let media = fx
            .add_media("image/png", b"big", &[(PLATFORM, "jpg")])
            .await;
        let mut item = PostThreadItem::new("quote + pic");
        item.media = vec![media.id.clone()];
        item.quoted_post_url = Some("https://bsky.app/profile/bob.test/post/xyz".to_string());
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();

        let mut bsky = publisher(&server);
        bsky.authenticate().await.unwrap();
        bsky.publish(&item, None, &cache).await.unwrap();
        bsky.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_screenshot_quote_appends_original_post_link() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "blob": {"$type": "blob", "ref": {"$link": "bafkshot"}, "mimeType": "image/png", "size": 12}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "record": {
                    "text": "so true\n\nOriginal post",
                    "facets": [{
                        "index": {"byteStart": 9, "byteEnd": 22},
                        "features": [{
                            "$type": "app.bsky.richtext.facet#link",
                            "uri": "https://twitter.com/a/status/5"
                        }]
                    }],
                    "embed": {"$type": "app.bsky.embed.images"}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://s", "cid": "cs"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let mut item = PostThreadItem::new("so true");
        item.quoted_post_url = Some("https://x.com/a/status/5".to_string());
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();

        let mut bsky = publisher(&server);
        bsky.authenticate().await.unwrap();
        bsky.publish(&item, None, &cache).await.unwrap();
        bsky.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_video_with_screenshot_quote_keeps_video_and_link_only() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .and(header("content-type", "video/mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "blob": {"$type": "blob", "ref": {"$link": "bafkvid"}, "mimeType": "video/mp4", "size": 4}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "record": {
                    "text": "clip\n\nOriginal post",
                    "facets": [{
                        "features": [{
                            "$type": "app.bsky.richtext.facet#link",
                            "uri": "https://twitter.com/a/status/6"
                        }]
                    }],
                    "embed": {
                        "$type": "app.bsky.embed.video",
                        "video": {"ref": {"$link": "bafkvid"}}
                    }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://v", "cid": "cv"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let video = fx.add_media("video/mp4", b"mp4!", &[]).await;
        let mut item = PostThreadItem::new("clip");
        item.media = vec![video.id.clone()];
        item.quoted_post_url = Some("https://x.com/a/status/6".to_string());
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();
        assert!(cache
            .quoted_post("https://x.com/a/status/6")
            .unwrap()
            .screenshot
            .is_some());

        let mut bsky = publisher(&server);
        bsky.authenticate().await.unwrap();
        bsky.publish(&item, None, &cache).await.unwrap();
        bsky.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_video_mixed_with_images_is_rejected_before_upload() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let fx = Fixture::new().await;
        let image = fx.add_media("image/jpeg", b"jpg", &[]).await;
        let video = fx.add_media("video/mp4", b"mp4!", &[]).await;
        let mut item = PostThreadItem::new("both");
        item.media = vec![image.id.clone(), video.id.clone()];
        let mut thread = PostThread::new("t", "g");
        thread.items.push(item.clone());
        let mut cache = fx.cache();
        cache.populate(&thread, &[PLATFORM]).await.unwrap();

        let mut bsky = publisher(&server);
        bsky.authenticate().await.unwrap();
        let err = bsky.publish(&item, None, &cache).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::ThreadcastError::Platform(PlatformError::Validation(_))
        ));
        bsky.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_without_session_fails() {
        let server = MockServer::start().await;
        let fx = Fixture::new().await;
        let cache = fx.cache();
        let err = publisher(&server)
            .publish(&PostThreadItem::new("x"), None, &cache)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("session is not open"));
    }

    #[tokio::test]
    async fn test_resolver_resolves_handle_then_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.identity.resolveHandle"))
            .and(query_param("handle", "bob.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"did": "did:plc:bob"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.getRecord"))
            .and(query_param("repo", "did:plc:bob"))
            .and(query_param("rkey", "3k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:bob/app.bsky.feed.post/3k",
                "cid": "bafyrec",
                "value": {"text": "hi"}
            })))
            .mount(&server)
            .await;

        let resolver = BlueskyPostResolver::new(reqwest::Client::new(), &server.uri());
        let strong_ref = resolver.resolve_bluesky_post("bob.test", "3k").await.unwrap();
        assert_eq!(strong_ref.cid, "bafyrec");
    }
}
