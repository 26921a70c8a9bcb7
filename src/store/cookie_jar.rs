//! Credential backing on top of the transport's cookie jar.
//!
//! Entries are written as host-only cookies with `Path=/` for the service
//! origin, so they travel on every same-origin request exactly like a browser
//! cookie would.

use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use tracing::debug;
use url::Url;

use super::{KeyValueStore, StoreError};

const EXPIRED: &str = "Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT";

/// [`KeyValueStore`] that reads and writes cookies for one origin.
#[derive(Debug, Clone)]
pub struct CookieJarStore {
    jar: Arc<Jar>,
    origin: Url,
}

impl CookieJarStore {
    /// Creates a store over `jar` scoped to `origin`.
    #[must_use]
    pub fn new(jar: Arc<Jar>, origin: Url) -> Self {
        Self { jar, origin }
    }

    /// The origin the cookies are scoped to.
    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn cookie_url(&self, path: &str) -> Url {
        let mut url = self.origin.clone();
        url.set_path(path);
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    // "/", "/a", "/a/", "/a/b", ... for the origin's own path.
    fn path_prefixes(&self) -> Vec<String> {
        let mut prefixes = vec!["/".to_string()];
        let mut current = String::new();
        for segment in self.origin.path().split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            prefixes.push(current.clone());
            prefixes.push(format!("{current}/"));
        }
        prefixes
    }
}

impl KeyValueStore for CookieJarStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(header) = self.jar.cookies(&self.cookie_url("/")) else {
            return Ok(None);
        };
        let Ok(header) = header.to_str() else {
            return Ok(None);
        };
        Ok(header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.jar
            .add_cookie_str(&format!("{key}={value}; Path=/"), &self.cookie_url("/"));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        for path in self.path_prefixes() {
            let url = self.cookie_url(&path);
            self.jar
                .add_cookie_str(&format!("{key}=; Path={path}; {EXPIRED}"), &url);
        }
        debug!(name = key, origin = %self.origin, "expired cookie");
        Ok(())
    }
}
