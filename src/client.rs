//! The extension side of sync.
//!
//! [`LocalStore`] is the extension's persisted key-value document holding
//! the saved URLs, the API key and the time of the last pull. [`SyncClient`]
//! talks to `/api/sync`, and [`reconcile`] runs one full round: push the
//! local list, pull what changed remotely, merge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::models::{Link, LinkInput, Time};
use crate::sync::SyncReport;
use crate::{api, Error, Result};

pub const SAVED_LINKS_KEY : &str = "savedLinks";
pub const API_KEY_KEY : &str = "apiKey";
pub const LAST_SYNC_KEY : &str = "lastSync";

const REQUEST_TIMEOUT : Duration = Duration::from_secs(10);

pub struct LocalStore {
    path : PathBuf,
    data : Map<String, Value>,
}

impl LocalStore {
    /// Loads the store at `path`. A missing file is an empty store.
    pub fn open<P : AsRef<Path>>(path : P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(LocalStore { path, data })
    }

    /// Writes the store back, replacing the file atomically.
    pub fn save(&self) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");

        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.data)?)?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    pub fn saved_links(&self) -> Vec<String> {
        self.data
            .get(SAVED_LINKS_KEY)
            .and_then(Value::as_array)
            .map(|links| {
                links
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_saved_links(&mut self, links : Vec<String>) {
        self.data.insert(
            SAVED_LINKS_KEY.to_string(),
            Value::Array(links.into_iter().map(Value::String).collect()),
        );
    }

    /// Appends `url` unless it's already saved.
    pub fn add_link(&mut self, url : &str) -> bool {
        let mut links = self.saved_links();
        if links.iter().any(|l| l == url) {
            return false
        }

        links.push(url.to_string());
        self.set_saved_links(links);
        true
    }

    pub fn remove_link(&mut self, url : &str) -> bool {
        let mut links = self.saved_links();
        let before = links.len();
        links.retain(|l| l != url);

        let removed = links.len() != before;
        if removed {
            self.set_saved_links(links);
        }
        removed
    }

    pub fn api_key(&self) -> Option<&str> {
        self.data
            .get(API_KEY_KEY)
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
    }

    pub fn set_api_key(&mut self, api_key : &str) {
        self.data
            .insert(API_KEY_KEY.to_string(), Value::String(api_key.to_string()));
    }

    /// A malformed stored timestamp counts as never synced.
    pub fn last_sync(&self) -> Option<Time> {
        self.data
            .get(LAST_SYNC_KEY)
            .and_then(Value::as_str)
            .and_then(|s| Time::parse(s).ok())
    }

    pub fn set_last_sync(&mut self, t : Time) {
        self.data
            .insert(LAST_SYNC_KEY.to_string(), Value::String(t.format()));
    }
}

/// Union of `local` and `remote`. Local order is kept, remote-only URLs are
/// appended in the order given. Returns the merged list and how many URLs
/// were appended.
pub fn merge_urls<'a, I>(local : &[String], remote : I) -> (Vec<String>, usize)
where
    I : IntoIterator<Item = &'a str>,
{
    let mut seen : HashSet<String> = HashSet::new();
    let mut merged = Vec::with_capacity(local.len());

    for url in local {
        if seen.insert(normalize(url)) {
            merged.push(url.clone());
        }
    }

    let mut added = 0;
    for url in remote {
        if seen.insert(normalize(url)) {
            merged.push(url.to_string());
            added += 1;
        }
    }

    (merged, added)
}

// the server stores URLs in parsed form, so compare that way
fn normalize(url : &str) -> String {
    Url::parse(url.trim())
        .map(String::from)
        .unwrap_or_else(|_| url.trim().to_string())
}

pub struct SyncClient {
    http :     reqwest::Client,
    endpoint : Url,
    api_key :  String,
}

impl SyncClient {
    pub fn new(base_url : &str, api_key : &str) -> Result<Self> {
        let base =
            Url::parse(base_url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let endpoint = base
            .join("/api/sync")
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(SyncClient {
            http,
            endpoint,
            api_key : api_key.to_string(),
        })
    }

    pub async fn push(&self, urls : &[String]) -> Result<SyncReport> {
        #[derive(serde::Serialize)]
        struct Req {
            links : Vec<LinkInput>,
        }

        let body = Req {
            links : urls.iter().map(|u| LinkInput::from_url(u.as_str())).collect(),
        };

        let res = self
            .http
            .post(self.endpoint.clone())
            .header(api::API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;

        Ok(check_status(res).await?.json().await?)
    }

    pub async fn pull(&self, since : Option<Time>) -> Result<Vec<Link>> {
        #[derive(Deserialize)]
        struct Res {
            links : Vec<Link>,
        }

        let mut req = self
            .http
            .get(self.endpoint.clone())
            .header(api::API_KEY_HEADER, &self.api_key);

        if let Some(since) = since {
            req = req.query(&[("lastSync", since.format())]);
        }

        let res : Res = check_status(req.send().await?).await?.json().await?;

        Ok(res.links)
    }
}

async fn check_status(res : reqwest::Response) -> Result<reqwest::Response> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error : String,
    }

    let status = res.status();
    if status.is_success() {
        return Ok(res)
    }

    let message = res
        .json::<ErrorBody>()
        .await
        .map(|b| b.error)
        .unwrap_or_else(|_| status.to_string());

    Err(match status.as_u16() {
        401 => Error::InvalidApiKey,
        400 => Error::BadRequest(message),
        _ => {
            tracing::error!(status = status.as_u16(), %message, "sync request failed");
            Error::Internal
        },
    })
}

/// Outcome of one [`reconcile`] round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created : u32,
    pub skipped : u32,
    pub errors :  Vec<String>,
    /// links the server reported as changed
    pub pulled :  usize,
    /// URLs that were new to the local store
    pub added :   usize,
}

/// One full sync round. The store is only written once both requests
/// succeeded.
pub async fn reconcile(
    store : &mut LocalStore,
    client : &SyncClient,
) -> Result<ReconcileSummary> {
    let local = store.saved_links();

    let report = client.push(&local).await?;

    let started = Time::now();
    let remote = client.pull(store.last_sync()).await?;

    let (merged, added) =
        merge_urls(&local, remote.iter().map(|l| l.url.as_str()));

    store.set_saved_links(merged);
    store.set_last_sync(started);
    store.save()?;

    tracing::info!(
        created = report.created,
        skipped = report.skipped,
        errors = report.errors.len(),
        pulled = remote.len(),
        added,
        "reconciled"
    );

    Ok(ReconcileSummary {
        created : report.created,
        skipped : report.skipped,
        errors : report.errors,
        pulled : remote.len(),
        added,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v : &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_keeps_local_order_and_appends() {
        let local = strings(&["https://b.com/", "https://a.com/"]);
        let (merged, added) = merge_urls(
            &local,
            ["https://c.com/", "https://a.com/", "https://d.com/"],
        );

        assert_eq!(
            merged,
            strings(&[
                "https://b.com/",
                "https://a.com/",
                "https://c.com/",
                "https://d.com/"
            ])
        );
        assert_eq!(added, 2);
    }

    #[test]
    fn merge_never_duplicates() {
        let local = strings(&["https://a.com", "https://a.com/", "not a url"]);
        let (merged, added) =
            merge_urls(&local, ["https://a.com/", "https://A.com", "not a url"]);

        assert_eq!(merged, strings(&["https://a.com", "not a url"]));
        assert_eq!(added, 0);
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let mut store = LocalStore::open(&path).unwrap();
        assert!(store.saved_links().is_empty());
        assert!(store.api_key().is_none());
        assert!(store.last_sync().is_none());

        assert!(store.add_link("https://a.com/"));
        assert!(!store.add_link("https://a.com/"));
        assert!(store.add_link("https://b.com/"));
        store.set_api_key("kiroku_abc");
        let now = Time::now();
        store.set_last_sync(now);
        store.save().unwrap();

        let mut store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.saved_links(),
            strings(&["https://a.com/", "https://b.com/"])
        );
        assert_eq!(store.api_key(), Some("kiroku_abc"));
        assert_eq!(store.last_sync(), Some(now));

        assert!(store.remove_link("https://a.com/"));
        assert!(!store.remove_link("https://a.com/"));
        assert_eq!(store.saved_links(), strings(&["https://b.com/"]));
    }

    #[test]
    fn store_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(
            &path,
            r#"{"savedLinks": ["https://a.com/", 7], "theme": "dark"}"#,
        )
        .unwrap();

        let mut store = LocalStore::open(&path).unwrap();
        // entries that aren't strings are ignored
        assert_eq!(store.saved_links(), strings(&["https://a.com/"]));

        store.add_link("https://b.com/");
        store.save().unwrap();

        let raw : Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
    }

    async fn serve() -> (String, api::Server) {
        let config = crate::config::Config::from_lookup(|key| match key {
            "KIROKU_TOKEN_SECRET" => {
                Some("client-tests-signing-secret-0123456789".to_string())
            },
            _ => None,
        })
        .unwrap();
        let db = crate::database::Db::open_in_memory().unwrap();
        let server = api::ServerInner::new(&config, db);

        let (addr, fut) = warp::serve(api::routes(&server))
            .bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);

        (format!("http://{}", addr), server)
    }

    async fn user_with_key(server : &api::Server) -> (u32, String) {
        let user = server
            .db
            .upsert_user(&crate::models::Identity {
                email : "ext@example.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let key = crate::crypto::generate_api_key();
        server.db.set_api_key(user.id, &key).await.unwrap();

        (user.id, key)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_converges_to_the_union() {
        let (base, server) = serve().await;
        let (user_id, key) = user_with_key(&server).await;

        let remote = Url::parse("https://remote.example.com/").unwrap();
        server
            .db
            .insert_link(user_id, &crate::models::NewLink::new(remote))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let mut store = LocalStore::open(&path).unwrap();
        store.add_link("https://local.example.com/");
        store.set_api_key(&key);
        store.save().unwrap();

        let client = SyncClient::new(&base, &key).unwrap();

        let first = reconcile(&mut store, &client).await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.pulled, 2);
        assert_eq!(first.added, 1);
        assert!(first.errors.is_empty());

        let mut store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.saved_links(),
            strings(&["https://local.example.com/", "https://remote.example.com/"])
        );
        let synced_at = store.last_sync().unwrap();

        let second = reconcile(&mut store, &client).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.pulled, 0);
        assert_eq!(second.added, 0);

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.saved_links().len(), 2);
        assert!(store.last_sync().unwrap() >= synced_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_reconcile_leaves_the_store_alone() {
        let (base, _server) = serve().await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let mut store = LocalStore::open(&path).unwrap();
        store.add_link("https://local.example.com/");
        store.set_api_key("kiroku_wrong");
        store.save().unwrap();
        let before = std::fs::read(&path).unwrap();

        let client = SyncClient::new(&base, "kiroku_wrong").unwrap();
        let res = reconcile(&mut store, &client).await;

        assert!(matches!(res, Err(Error::InvalidApiKey)));
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(store.last_sync().is_none());
    }

    #[test]
    fn client_endpoint() {
        let client = SyncClient::new("http://localhost:3000/dashboard", "k").unwrap();
        assert_eq!(client.endpoint.as_str(), "http://localhost:3000/api/sync");

        assert!(SyncClient::new("localhost", "k").is_err());
    }
}
