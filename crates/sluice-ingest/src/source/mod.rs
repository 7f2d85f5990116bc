//! Source API seams
//!
//! The collector and enricher only see these traits. [`HttpSourceClient`]
//! implements both against a paginated JSON API; tests substitute their own.

use async_trait::async_trait;

use crate::error::FetchError;
use crate::models::{EntityDetail, Item};

mod http;

pub use http::HttpSourceClient;

/// Retrieves pages of the primary collection
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Total number of items in the collection
    async fn fetch_total(&self) -> Result<u64, FetchError>;

    /// Items at `[offset, offset + limit)`, in source order
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<Item>, FetchError>;
}

/// Resolves one secondary entity by id
#[async_trait]
pub trait EnrichmentFetcher: Send + Sync {
    async fn fetch_entity(&self, id: &str) -> Result<EntityDetail, FetchError>;
}

/// Supplies bearer tokens for the source API. Acquisition and refresh live
/// outside Sluice.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, FetchError>;
}

/// A fixed token, typically read from configuration
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, FetchError> {
        if self.0.is_empty() {
            return Err(FetchError::Credentials("empty API token".to_string()));
        }
        Ok(self.0.clone())
    }
}
