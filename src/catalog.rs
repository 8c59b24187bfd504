use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::generation::api_error_message;
use crate::records::{LocationRecord, RecordFilter, RecordPage, UpdateRequest};

const CATALOG_ENDPOINT: &str = "catalog";

/// The external catalog backend: paged reads, sparse updates, deletes.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        page: usize,
        page_size: usize,
    ) -> AppResult<RecordPage>;

    async fn update(&self, id: i64, update: &UpdateRequest) -> AppResult<LocationRecord>;

    /// `Ok(false)` when the backend answered but did not confirm the delete.
    async fn delete(&self, id: i64) -> AppResult<bool>;
}

pub struct HttpCatalogClient {
    http: Client,
    base: Url,
    token: Option<SecretString>,
}

impl HttpCatalogClient {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let base = Url::parse(&format!("{}/", config.catalog_api_base)).map_err(|err| {
            AppError::Config(format!("invalid CATALOG_API_BASE {}: {err}", config.catalog_api_base))
        })?;
        let http = Client::builder()
            .user_agent(concat!("place-curator/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base,
            token: config.catalog_api_token.clone(),
        })
    }

    pub fn into_shared(self) -> Arc<dyn Catalog> {
        Arc::new(self)
    }

    fn locations_url(&self, id: Option<i64>) -> AppResult<Url> {
        let path = match id {
            Some(id) => format!("locations/{id}"),
            None => "locations".to_string(),
        };
        self.base
            .join(&path)
            .map_err(|err| AppError::Config(format!("invalid catalog path {path}: {err}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

async fn ensure_success(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Api {
        endpoint: CATALOG_ENDPOINT,
        status: status.as_u16(),
        message: api_error_message(&body),
    })
}

#[async_trait]
impl Catalog for HttpCatalogClient {
    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        page: usize,
        page_size: usize,
    ) -> AppResult<RecordPage> {
        let mut url = self.locations_url(None)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("page", &page.to_string())
                .append_pair("pageSize", &page_size.to_string());
            for (key, value) in filter.query_pairs() {
                query.append_pair(key, &value);
            }
        }

        let response = self.authorized(self.http.get(url)).send().await?;
        let page_body: RecordPage = ensure_success(response).await?.json().await?;
        debug!(
            page,
            fetched = page_body.records.len(),
            total = page_body.total,
            "fetched catalog page"
        );
        Ok(page_body)
    }

    async fn update(&self, id: i64, update: &UpdateRequest) -> AppResult<LocationRecord> {
        let url = self.locations_url(Some(id))?;
        let response = self
            .authorized(self.http.put(url))
            .json(update)
            .send()
            .await?;
        let record: LocationRecord = ensure_success(response).await?.json().await?;
        trace!(id, fields = update.field_count(), "catalog record updated");
        Ok(record)
    }

    async fn delete(&self, id: i64) -> AppResult<bool> {
        let url = self.locations_url(Some(id))?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        let body = ensure_success(response).await?.text().await?;
        Ok(delete_confirmed(&body))
    }
}

/// Interprets the delete endpoint's loosely typed success indicator. An empty
/// 2xx body counts as success.
pub(crate) fn delete_confirmed(body: &str) -> bool {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Bool(flag)) => flag,
        Ok(Value::Object(map)) => ["success", "deleted", "data"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_bool))
            .unwrap_or(true),
        Ok(_) => true,
        Err(_) => matches!(trimmed, "ok" | "OK" | "true"),
    }
}
