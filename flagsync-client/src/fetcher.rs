//! Catch-up fetch endpoints

use async_trait::async_trait;
use reqwest::header::CACHE_CONTROL;
use reqwest::{Client, Url};
use shared::{FlagChanges, MembershipResponse, SegmentChanges};

use crate::error::FetchError;

/// Per-request fetch options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass shared caches. Set only for push-triggered fetches.
    pub no_cache: bool,
    /// Change number the caller is waiting for, forwarded as `till` so that
    /// a CDN cannot answer with an older page
    pub till: Option<i64>,
}

impl FetchOptions {
    pub fn cached() -> Self {
        Self::default()
    }

    pub fn no_cache() -> Self {
        Self {
            no_cache: true,
            till: None,
        }
    }

    pub fn with_till(mut self, till: i64) -> Self {
        self.till = Some(till);
        self
    }
}

#[async_trait]
pub trait ChangesFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch_flag_changes(
        &self,
        since: i64,
        options: FetchOptions,
    ) -> Result<FlagChanges, FetchError>;

    async fn fetch_segment_changes(
        &self,
        name: &str,
        since: i64,
        options: FetchOptions,
    ) -> Result<SegmentChanges, FetchError>;

    /// Full membership of one key; there is no `since`
    async fn fetch_memberships(
        &self,
        key: &str,
        options: FetchOptions,
    ) -> Result<MembershipResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    sdk_url: String,
    sdk_key: String,
}

impl HttpFetcher {
    pub fn new(client: Client, sdk_url: impl Into<String>, sdk_key: impl Into<String>) -> Self {
        Self {
            client,
            sdk_url: sdk_url.into().trim_end_matches('/').to_string(),
            sdk_key: sdk_key.into(),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.sdk_url)
            .map_err(|e| FetchError::Network(format!("invalid sdk url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::Network("sdk url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
        options: FetchOptions,
    ) -> Result<T, FetchError> {
        let mut request = self.client.get(url).bearer_auth(&self.sdk_key).query(query);
        if let Some(till) = options.till {
            request = request.query(&[("till", till)]);
        }
        if options.no_cache {
            request = request.header(CACHE_CONTROL, "no-cache");
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(FetchError::Server {
                status: status.as_u16(),
                message,
            });
        }
        resp.json()
            .await
            .map_err(|e| FetchError::Network(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl ChangesFetcher for HttpFetcher {
    async fn fetch_flag_changes(
        &self,
        since: i64,
        options: FetchOptions,
    ) -> Result<FlagChanges, FetchError> {
        let url = self.url(&["splitChanges"])?;
        self.get(url, &[("since", since.to_string())], options).await
    }

    async fn fetch_segment_changes(
        &self,
        name: &str,
        since: i64,
        options: FetchOptions,
    ) -> Result<SegmentChanges, FetchError> {
        let url = self.url(&["segmentChanges", name])?;
        self.get(url, &[("since", since.to_string())], options).await
    }

    async fn fetch_memberships(
        &self,
        key: &str,
        options: FetchOptions,
    ) -> Result<MembershipResponse, FetchError> {
        let url = self.url(&["mySegments", key])?;
        let options = FetchOptions {
            till: None,
            ..options
        };
        self.get(url, &[], options).await
    }
}
