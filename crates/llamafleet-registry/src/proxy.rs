//! Reverse-proxy target cache, keyed by `(host, port)` and invalidated on `SetOptions`
//! (spec §9, "Cyclic references").

use reqwest::Client;

/// A lazily-constructed, cached reverse-proxy handle to an instance's upstream child.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    client: Client,
    base_url: String,
}

impl ProxyTarget {
    pub fn new(base_url: String) -> Self {
        ProxyTarget {
            client: Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}
