//! Reconciliation of extension-local links with the link store.
//!
//! `push` folds a batch of client links into the store, one item at a time;
//! an item that fails is reported and the batch carries on. `pull` hands back
//! what changed since the client last looked.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::database::Db;
use crate::models::{Link, LinkInput, Time};
use crate::{Error, Result};

/// Counters for one push.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub created : u32,
    pub skipped : u32,
    pub errors :  Vec<String>,
}

/// A push item that didn't decode. `url` is whatever the item had under
/// `url`, rendered as text.
struct Undecodable {
    url :    Option<String>,
    reason : String,
}

/// A push item is either a bare URL or a link object with metadata.
fn decode_item(item : Value) -> std::result::Result<LinkInput, Undecodable> {
    let url = match &item {
        Value::String(url) => return Ok(LinkInput::from_url(url.as_str())),
        Value::Object(fields) => match fields.get("url") {
            None | Some(Value::Null) => None,
            Some(Value::String(url)) => Some(url.clone()),
            Some(other) => Some(other.to_string()),
        },
        _ => None,
    };

    serde_json::from_value(item).map_err(|err| Undecodable {
        url,
        reason : err.to_string(),
    })
}

enum Outcome {
    Created,
    Skipped,
}

/// Parses a user supplied URL. Only URLs with a host can be saved, since
/// the host becomes the link's domain.
pub fn parse_link_url(raw : &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|err| Error::InvalidUrl(err.to_string()))?;

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(Error::InvalidUrl("url has no host".into())),
    }
}

pub async fn push<I>(db : &Db, user_id : u32, items : I) -> SyncReport
where
    I : IntoIterator<Item = LinkInput>,
{
    push_decoded(db, user_id, items.into_iter().map(Ok)).await
}

/// [`push`] for items straight off the wire. An item that doesn't decode is
/// reported against its url, or as missing one.
pub async fn push_json<I>(db : &Db, user_id : u32, items : I) -> SyncReport
where
    I : IntoIterator<Item = Value>,
{
    push_decoded(db, user_id, items.into_iter().map(decode_item)).await
}

async fn push_decoded<I>(db : &Db, user_id : u32, items : I) -> SyncReport
where
    I : IntoIterator<Item = std::result::Result<LinkInput, Undecodable>>,
{
    let mut report = SyncReport::default();

    for item in items {
        let (raw, res) = match item {
            Ok(input) => {
                let raw = input.url.clone().unwrap_or_default();
                (raw, push_one(db, user_id, input).await)
            },
            Err(Undecodable { url : Some(url), reason })
                if !url.trim().is_empty() =>
            {
                (url, Err(Error::BadRequest(reason)))
            },
            Err(_) => (String::new(), Err(Error::MissingUrl)),
        };

        match res {
            Ok(Outcome::Created) => report.created += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Err(Error::MissingUrl) => {
                report.errors.push(Error::MissingUrl.to_string())
            },
            Err(err) => {
                tracing::warn!(user_id, url = %raw, error = %err, "sync item failed");
                report.errors.push(format!(
                    "Error processing {}: {}",
                    raw,
                    err.public_message()
                ));
            },
        }
    }

    tracing::info!(
        user_id,
        created = report.created,
        skipped = report.skipped,
        errors = report.errors.len(),
        "sync push"
    );

    report
}

async fn push_one(db : &Db, user_id : u32, input : LinkInput) -> Result<Outcome> {
    let raw = match input.url.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw.to_string(),
        _ => return Err(Error::MissingUrl),
    };

    let url = parse_link_url(&raw)?;

    if db.find_link_by_url(user_id, url.as_str()).await?.is_some() {
        return Ok(Outcome::Skipped)
    }

    db.insert_link(user_id, &input.into_new_link(url)).await?;

    Ok(Outcome::Created)
}

/// Links of `user_id` updated at or after `since`, most recent first.
pub async fn pull(
    db : &Db,
    user_id : u32,
    since : Option<Time>,
) -> Result<Vec<Link>> {
    let links = db.links_updated_since(user_id, since).await?;

    tracing::debug!(user_id, since = ?since, count = links.len(), "sync pull");

    Ok(links)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{Identity, LinkPatch};

    async fn setup() -> (Db, u32) {
        let db = Db::open_in_memory().unwrap();
        let user = db
            .upsert_user(&Identity {
                email : "sync@example.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (db, user.id)
    }

    fn urls(urls : &[&str]) -> Vec<LinkInput> {
        urls.iter().map(|u| LinkInput::from_url(*u)).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replay_is_idempotent() {
        let (db, user) = setup().await;

        let first = push(&db, user, urls(&["https://example.com/a"])).await;
        assert_eq!(first.created, 1);
        assert_eq!(first.skipped, 0);

        let second = push(&db, user, urls(&["https://example.com/a"])).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);
        assert!(second.errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn equivalent_urls_dedupe() {
        let (db, user) = setup().await;

        let report = push(
            &db,
            user,
            urls(&["https://Example.com", "https://example.com/", " https://example.com "]),
        )
        .await;

        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_items_do_not_disturb_siblings() {
        let (db, user) = setup().await;
        push(&db, user, urls(&["https://seen.example.com/"])).await;

        let mut items = urls(&[
            "https://new.example.com/",
            "not a url",
            "https://seen.example.com/",
            "mailto:someone@example.com",
        ]);
        items.push(LinkInput::default());

        let report = push(&db, user, items).await;

        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].starts_with("Error processing not a url: "));
        assert!(report.errors[1].contains("mailto:someone@example.com"));
        assert_eq!(report.errors[2], "URL is required");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_is_kept() {
        let (db, user) = setup().await;

        let items = vec![LinkInput {
            url :         Some("https://blog.example.com/post".into()),
            title :       Some("A post".into()),
            description : None,
            tags :        Some(vec!["reading".to_string()].into()),
            is_favorite : Some(true),
        }];
        push(&db, user, items).await;

        let links = pull(&db, user, None).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].title, "A post");
        assert_eq!(links[0].description, "");
        assert_eq!(links[0].domain, "blog.example.com");
        assert!(links[0].tags.contains("reading"));
        assert!(links[0].is_favorite);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_since_returns_recent_changes() {
        let (db, user) = setup().await;
        push(&db, user, urls(&["https://a.example.com", "https://b.example.com"]))
            .await;

        let all = pull(&db, user, None).await.unwrap();
        let a = all.iter().find(|l| l.domain == "a.example.com").unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let since = Time::now();

        let touched = db
            .update_link(user, a.id, &LinkPatch {
                is_favorite : Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        let recent = pull(&db, user, Some(since)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, touched.id);
        assert!(recent.iter().all(|l| l.updated_at >= since));
    }

    #[test]
    fn domain_is_host() {
        for (raw, host) in [
            ("https://example.com", "example.com"),
            ("http://sub.example.co.uk:8080/path?q=1#frag", "sub.example.co.uk"),
            ("https://user:pw@EXAMPLE.org/", "example.org"),
            ("http://127.0.0.1:3000/", "127.0.0.1"),
            ("http://[::1]/", "[::1]"),
        ] {
            let url = parse_link_url(raw).unwrap();
            assert_eq!(url.host_str(), Some(host));
            assert_eq!(crate::models::NewLink::new(url).domain(), host);
        }
    }

    #[test]
    fn rejects_hostless() {
        assert!(matches!(parse_link_url(""), Err(Error::InvalidUrl(_))));
        assert!(matches!(
            parse_link_url("/relative/path"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_link_url("data:text/plain,hi"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn json_items_accept_strings_and_objects() {
        let (db, user) = setup().await;

        let items : Vec<Value> = serde_json::from_str(
            r#"["https://a.com", {"url": "https://b.com", "isFavorite": true}]"#,
        )
        .unwrap();
        let report = push_json(&db, user, items).await;
        assert_eq!(report.created, 2);

        let links = pull(&db, user, None).await.unwrap();
        let b = links.iter().find(|l| l.domain == "b.com").unwrap();
        assert!(b.is_favorite);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undecodable_items_report_their_url() {
        let (db, user) = setup().await;

        let items : Vec<Value> = serde_json::from_str(
            r#"[
                {"url": "https://a.example.com/", "tags": "reading"},
                {"url": 42},
                {"url": "  ", "isFavorite": "yes"},
                {"title": "no url"},
                7,
                null
            ]"#,
        )
        .unwrap();
        let report = push_json(&db, user, items).await;

        assert_eq!(report.created, 0);
        assert_eq!(report.errors.len(), 6);
        assert!(report.errors[0]
            .starts_with("Error processing https://a.example.com/: invalid type"));
        assert!(report.errors[1].starts_with("Error processing 42: "));
        assert!(report.errors[2..].iter().all(|e| e == "URL is required"));
        assert!(pull(&db, user, None).await.unwrap().is_empty());
    }
}
