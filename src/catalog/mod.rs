//! Remote dataset catalog.
//!
//! The metastore publishes every dataset in a single JSON array, so a listing
//! is one GET with no paging. Records are deserialized leniently: unknown
//! fields are ignored and missing ones fall back to empty values, leaving the
//! change filter to decide what is usable.

pub mod error;
pub mod types;

use std::time::Duration;

use reqwest::Client;

pub use error::CatalogError;
pub use types::{parse_instant, DatasetRecord};

/// CMS Provider Data metastore listing for all datasets.
pub const DEFAULT_CATALOG_URL: &str =
    "https://data.cms.gov/provider-data/api/1/metastore/schemas/dataset/items";

/// Client for the bulk listing endpoint.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the full listing.
    pub async fn list_datasets(&self) -> Result<Vec<DatasetRecord>, CatalogError> {
        tracing::debug!(url = %self.url, "Requesting catalog listing");
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| CatalogError::Http {
                url: self.url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CatalogError::HttpStatus {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|source| CatalogError::Http {
            url: self.url.clone(),
            source,
        })?;
        let records: Vec<DatasetRecord> =
            serde_json::from_slice(&body).map_err(|source| CatalogError::Json {
                url: self.url.clone(),
                source,
            })?;

        tracing::debug!(count = records.len(), "Catalog listing received");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog(server: &MockServer) -> HttpCatalog {
        HttpCatalog::new(
            Client::new(),
            format!("{}/api/1/metastore/schemas/dataset/items", server.uri()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_list_datasets_parses_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/metastore/schemas/dataset/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "identifier": "a-1",
                    "title": "Hospital A",
                    "theme": ["Hospitals"],
                    "modified": "2024-01-01T00:00:00Z",
                    "distribution": [{"downloadURL": "https://example.com/a.csv"}]
                },
                {"identifier": "b-2", "title": "Clinic B", "theme": ["Clinics"]}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let records = catalog(&server).list_datasets().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identifier, "a-1");
        assert!(records[0].modified_at().is_some());
        assert!(records[1].modified_at().is_none());
    }

    #[tokio::test]
    async fn test_list_datasets_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = catalog(&server).list_datasets().await.unwrap_err();
        assert!(matches!(err, CatalogError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_list_datasets_rejects_non_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "nope"})))
            .mount(&server)
            .await;

        let err = catalog(&server).list_datasets().await.unwrap_err();
        assert!(matches!(err, CatalogError::Json { .. }));
    }

    #[tokio::test]
    async fn test_list_datasets_connection_refused() {
        let catalog = HttpCatalog::new(
            Client::new(),
            "http://127.0.0.1:1/items",
            Duration::from_secs(5),
        );
        let err = catalog.list_datasets().await.unwrap_err();
        assert!(matches!(err, CatalogError::Http { .. }));
    }
}
