//! Profile resolution with specificity backoff.
//!
//! The lookup key is the ordered tuple `[manufacturer, device,
//! revision, $version]`. Levels are tried from most to least specific
//! (the empty path is the site default); a level whose keys are
//! incomplete is skipped. Fresh local copies win, upstream fetches
//! refresh the cache, a 404 invalidates the level, and a transiently
//! unreachable upstream falls back to the most specific stale copy.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use autopolicy_common::{Identity, Profile};
use thiserror::Error;

use crate::db::{esc, mkdir_all, write_file_atomic, Db};

/// Only plain HTTP upstreams are accepted.
const PF_PROTO: &str = "http://";
/// Local profile copies are fresh for 15 minutes.
const PF_CACHE: Duration = Duration::from_secs(60 * 15);
/// Upstream fetch budget.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const QUERY_KEYS: [&str; 4] = ["manufacturer", "device", "revision", "$version"];

/// Errors surfaced to the caller; upstream fetch failures are not
/// errors here, they only steer the backoff.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("profile read: {0}")]
    Io(#[from] io::Error),
    #[error("profile read: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored profile is not an object")]
    NotAnObject,
}

enum Fetch {
    Hit(Profile),
    NotFound,
    Failed(String),
}

/// Resolves traffic profiles for verified identities.
pub struct Resolver {
    db: Arc<Db>,
    http: reqwest::Client,
}

impl Resolver {
    pub fn new(db: Arc<Db>) -> Result<Resolver, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Resolver { db, http })
    }

    /// Resolve the profile for a verified identity.
    pub async fn resolve(&self, id: &Identity) -> Result<Profile, ResolveError> {
        let tag = Db::tag(id);

        let url = id.get("url").and_then(|raw| {
            let trimmed = raw.trim_end_matches('/');
            if trimmed.len() > PF_PROTO.len() && trimmed.starts_with(PF_PROTO) {
                Some(trimmed.to_string())
            } else {
                tracing::debug!("{tag}: invalid url in identity: {raw}");
                None
            }
        });

        // the most specific stale local copy seen so far; once set and
        // not invalidated by a 404, more general levels are not probed
        let mut fallback: Option<PathBuf> = None;

        for level in (0..=QUERY_KEYS.len()).rev() {
            if fallback.is_some() {
                break;
            }

            let Some(qstring) = self.qstring(id, level) else {
                continue; // incomplete key tuple, try a more general level
            };
            let pfpath = self.db.profile_path(&qstring);

            match fs::metadata(&pfpath) {
                Ok(meta) => {
                    fallback = Some(pfpath.clone());
                    if is_fresh(&meta) {
                        break;
                    }
                }
                Err(_) => {
                    let _ = mkdir_all(&self.db.profile_dir(&qstring));
                }
            }

            let Some(url) = &url else { continue };
            let src = format!("{url}/.autopolicy/{qstring}/profile.json");

            match self.fetch(&src).await {
                Fetch::Hit(mut pf) => {
                    pf.stamp(&src);
                    if let Err(err) = write_file_atomic(&pfpath, &pf.to_json_bytes(), 0o640) {
                        tracing::warn!("{tag}: storing profile failed: {err}");
                    }
                    tracing::debug!("{tag}: fetched new profile from {src}");
                    return Ok(pf);
                }
                Fetch::NotFound => {
                    // the upstream says this level no longer exists
                    if let Some(stale) = fallback.take() {
                        tracing::debug!(
                            "{tag}: removing local copy of profile, {}",
                            stale.display()
                        );
                        let _ = fs::remove_file(stale);
                    }
                }
                Fetch::Failed(err) => {
                    tracing::debug!("{tag}: profile fetch from {src} failed: {err}");
                }
            }
        }

        if let Some(path) = fallback {
            tracing::debug!("{tag}: reading profile from {}", path.display());
            let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
            return Profile::from_value(raw).ok_or(ResolveError::NotAnObject);
        }

        tracing::debug!("{tag}: using empty profile");
        Ok(Profile::empty())
    }

    /// Build the query string for one specificity level, `None` when
    /// any of its keys is absent or empty.
    fn qstring(&self, id: &Identity, level: usize) -> Option<String> {
        let mut parts = Vec::with_capacity(level);
        for key in &QUERY_KEYS[..level] {
            match id.get(key) {
                Some(v) if !v.is_empty() => parts.push(esc(v)),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }

    async fn fetch(&self, src: &str) -> Fetch {
        let resp = match self.http.get(src).send().await {
            Ok(resp) => resp,
            Err(err) => return Fetch::Failed(err.to_string()),
        };

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Fetch::NotFound;
        }
        if status != reqwest::StatusCode::OK {
            return Fetch::Failed(format!("HTTP status {}", status.as_u16()));
        }

        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return Fetch::Failed(err.to_string()),
        };
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => match Profile::from_value(value) {
                Some(pf) => Fetch::Hit(pf),
                None => Fetch::Failed("profile is not an object".into()),
            },
            Err(err) => Fetch::Failed(format!("JSON error: {err}")),
        }
    }
}

fn is_fresh(meta: &fs::Metadata) -> bool {
    meta.modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|age| age < PF_CACHE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tempfile::TempDir;

    fn identity(v: serde_json::Value) -> Identity {
        Identity::from_value(&v).unwrap()
    }

    fn setup(dir: &TempDir) -> (Arc<Db>, Resolver) {
        let db = Arc::new(Db::open(dir.path().join("db"), true, true).unwrap());
        let resolver = Resolver::new(db.clone()).unwrap();
        (db, resolver)
    }

    fn seed_profile(db: &Db, qstring: &str, body: serde_json::Value) {
        let path = db.profile_path(qstring);
        mkdir_all(&db.profile_dir(qstring)).unwrap();
        fs::write(&path, serde_json::to_vec_pretty(&body).unwrap()).unwrap();
    }

    fn make_stale(db: &Db, qstring: &str) {
        // push the mtime an hour into the past
        let path = db.profile_path(qstring);
        let old = SystemTime::now() - Duration::from_secs(3600);
        let file = fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_specificity_backoff_uses_most_specific_present() {
        let dir = TempDir::new().unwrap();
        let (db, resolver) = setup(&dir);
        seed_profile(&db, "acme", json!({ "from_device": { "rate": 5 } }));

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
            "manufacturer": "acme", "device": "widget",
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert_eq!(pf.get("from_device").unwrap()["rate"], 5);
        assert!(!pf.is_marked_empty());
    }

    #[tokio::test]
    async fn test_stale_served_when_upstream_unreachable() {
        let dir = TempDir::new().unwrap();
        let (db, resolver) = setup(&dir);
        seed_profile(&db, "acme/widget", json!({ "marker": "stale-copy" }));
        make_stale(&db, "acme/widget");

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
            "manufacturer": "acme", "device": "widget",
            "url": "http://127.0.0.1:1",
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert_eq!(pf.get("marker").unwrap(), "stale-copy");
    }

    #[tokio::test]
    async fn test_stale_served_without_url() {
        let dir = TempDir::new().unwrap();
        let (db, resolver) = setup(&dir);
        seed_profile(&db, "acme", json!({ "marker": "old-but-usable" }));
        make_stale(&db, "acme");

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
            "manufacturer": "acme",
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert_eq!(pf.get("marker").unwrap(), "old-but-usable");
    }

    #[tokio::test]
    async fn test_404_invalidates_level_and_descends() {
        let dir = TempDir::new().unwrap();
        let (db, resolver) = setup(&dir);
        seed_profile(&db, "acme/widget", json!({ "marker": "doomed" }));
        make_stale(&db, "acme/widget");

        // upstream has dropped the device level but still serves the
        // manufacturer level
        let router = Router::new().route(
            "/.autopolicy/acme/profile.json",
            get(|| async { Json(json!({ "marker": "from-upstream" })) }),
        );
        let url = serve(router).await;

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
            "manufacturer": "acme", "device": "widget",
            "url": url,
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert_eq!(pf.get("marker").unwrap(), "from-upstream");
        assert!(pf.get("@source").unwrap().as_str().unwrap().contains("/acme/"));

        // the stale device-level copy is gone
        assert!(!db.profile_path("acme/widget").exists());
        // the fetched copy is cached at the manufacturer level
        assert!(db.profile_path("acme").exists());
    }

    #[tokio::test]
    async fn test_fetch_stamps_and_caches() {
        let dir = TempDir::new().unwrap();
        let (db, resolver) = setup(&dir);

        let router = Router::new().route(
            "/.autopolicy/acme/profile.json",
            get(|| async { Json(json!({ "from_device": { "rate": 1 } })) }),
        );
        let url = serve(router).await;

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
            "manufacturer": "acme", "url": url,
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert!(pf.get("@timestamp").unwrap().as_i64().is_some());

        let cached: serde_json::Value =
            serde_json::from_slice(&fs::read(db.profile_path("acme")).unwrap()).unwrap();
        assert_eq!(cached["from_device"]["rate"], 1);
        assert!(cached["@source"].as_str().unwrap().ends_with("/profile.json"));
    }

    #[tokio::test]
    async fn test_nothing_found_yields_empty_profile() {
        let dir = TempDir::new().unwrap();
        let (_db, resolver) = setup(&dir);

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert!(pf.is_marked_empty());
        assert_eq!(pf.get("@source").unwrap(), "");
    }

    #[tokio::test]
    async fn test_incomplete_levels_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (db, resolver) = setup(&dir);
        // device present but manufacturer missing: only the site
        // default level applies
        seed_profile(&db, "", json!({ "marker": "site-default" }));

        let id = identity(json!({
            "@switch": "s1", "@port": "p1", "@mac": "aa:bb:cc:dd:ee:ff",
            "device": "widget",
        }));
        let pf = resolver.resolve(&id).await.unwrap();
        assert_eq!(pf.get("marker").unwrap(), "site-default");
    }
}
