/// Used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Path of the server push feed, relative to the base URL.
pub const STREAM_PATH: &str = "/stream";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamQuery {
    pub host: Option<String>,
}

impl StreamQuery {
    pub fn all_hosts() -> Self {
        Self { host: None }
    }

    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
        }
    }

    /// Path and query of the feed, e.g. `/stream?host=web-1`.
    pub fn path_and_query(&self) -> String {
        match &self.host {
            Some(host) => format!("{STREAM_PATH}?host={}", urlencoding::encode(host)),
            None => STREAM_PATH.to_owned(),
        }
    }

    /// Full feed URL under `base_url`. A trailing slash on the base is tolerated.
    pub fn url(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.path_and_query())
    }
}
