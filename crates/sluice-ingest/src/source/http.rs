//! reqwest-backed client for the source API

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::{CredentialProvider, EnrichmentFetcher, PageFetcher};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::{EntityDetail, Item, RefPath};

/// One page of the collection endpoint
#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Client for a paginated `{total, items[]}` collection plus a per-id detail
/// endpoint
#[derive(Clone)]
pub struct HttpSourceClient {
    client: reqwest::Client,
    base_url: String,
    collection_path: String,
    entity_path: String,
    ref_path: RefPath,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpSourceClient {
    pub fn new(
        config: &SourceConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Http {
                url: config.base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            collection_path: config.collection_path.clone(),
            entity_path: config.entity_path.clone(),
            ref_path: config.ref_path.clone(),
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| FetchError::InvalidUrl {
            url: raw,
            reason: e.to_string(),
        })
    }

    fn collection_url(&self, offset: u64, limit: u64) -> Result<Url, FetchError> {
        let mut url = self.endpoint(&self.collection_path)?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn entity_url(&self, id: &str) -> Result<Url, FetchError> {
        let mut url = self.endpoint(&self.entity_path)?;
        let raw = url.to_string();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl {
                url: raw,
                reason: "URL cannot have path segments".to_string(),
            })?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        let token = self.credentials.bearer_token().await?;
        let url_str = url.to_string();

        debug!(url = %url_str, "GET");
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| FetchError::Http {
                url: url_str.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url_str,
                status: status.as_u16(),
            });
        }

        response.json::<T>().await.map_err(|e| FetchError::Decode {
            url: url_str,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpSourceClient {
    async fn fetch_total(&self) -> Result<u64, FetchError> {
        let url = self.collection_url(0, 1)?;
        let url_str = url.to_string();
        let page: PageResponse = self.get_json(url).await?;
        page.total.ok_or(FetchError::Decode {
            url: url_str,
            reason: "response has no 'total' field".to_string(),
        })
    }

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<Item>, FetchError> {
        let page: PageResponse = self.get_json(self.collection_url(offset, limit)?).await?;
        Ok(page
            .items
            .into_iter()
            .map(|payload| Item::from_payload(payload, &self.ref_path))
            .collect())
    }
}

#[async_trait]
impl EnrichmentFetcher for HttpSourceClient {
    async fn fetch_entity(&self, id: &str) -> Result<EntityDetail, FetchError> {
        self.get_json(self.entity_url(id)?).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::source::StaticToken;

    fn client(base: &str) -> HttpSourceClient {
        let config = SourceConfig {
            base_url: base.to_string(),
            ..SourceConfig::default()
        };
        HttpSourceClient::new(&config, Arc::new(StaticToken::new("t"))).unwrap()
    }

    #[test]
    fn test_collection_url() {
        let url = client("https://api.example.com/").collection_url(40, 20).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/me/tracks?offset=40&limit=20");
    }

    #[test]
    fn test_entity_url_escapes_id() {
        let c = client("https://api.example.com");
        assert_eq!(
            c.entity_url("0OdUWJ0sBjDrqHygGUXeCF").unwrap().as_str(),
            "https://api.example.com/v1/artists/0OdUWJ0sBjDrqHygGUXeCF"
        );
        assert_eq!(
            c.entity_url("a/b").unwrap().as_str(),
            "https://api.example.com/v1/artists/a%2Fb"
        );
    }
}
