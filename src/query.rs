use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::Value;

use crate::document::SharedDocument;
use crate::domain::{DishRecord, ItemId};
use crate::error::MbtError;

pub const CSRF_META_NAME: &str = "csrf-token";
pub const CSRF_HEADER: &str = "x-csrf-token";

const GROUP_FIELDS: &str = "id name minSelectionsCount maxSelectionsCount isEnabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryTier {
    Compact,
    Full,
}

impl fmt::Display for QueryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryTier::Compact => write!(f, "compact"),
            QueryTier::Full => write!(f, "full"),
        }
    }
}

/// Outcome of resolving one item. `Missing` and `Unavailable` are both
/// "no data"; they differ in whether any tier answered at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(DishRecord, QueryTier),
    Missing,
    Unavailable,
}

impl Resolution {
    pub fn record(&self) -> Option<&DishRecord> {
        match self {
            Resolution::Found(record, _) => Some(record),
            Resolution::Missing | Resolution::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBody {
    pub operation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub variables: QueryVariables,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<QueryExtensions>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryVariables {
    pub menu_item_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExtensions {
    pub operation_id: String,
}

pub trait CsrfSource: Send + Sync {
    fn csrf_token(&self) -> Option<String>;
}

impl CsrfSource for Option<String> {
    fn csrf_token(&self) -> Option<String> {
        self.clone()
    }
}

/// Reads `<meta name="csrf-token">` from the document on every request,
/// falling back to a configured token.
#[derive(Clone)]
pub struct DocumentCsrf {
    document: SharedDocument,
    fallback: Option<String>,
}

impl DocumentCsrf {
    pub fn new(document: SharedDocument, fallback: Option<String>) -> Self {
        Self { document, fallback }
    }
}

impl CsrfSource for DocumentCsrf {
    fn csrf_token(&self) -> Option<String> {
        self.document
            .read(|document| document.meta_content(CSRF_META_NAME).map(str::to_string))
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn post(&self, body: &QueryBody, csrf: Option<&str>) -> Result<Value, MbtError>;
}

#[async_trait]
pub trait DishResolver: Send + Sync {
    async fn resolve(&self, item_id: ItemId) -> Resolution;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, MbtError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("mbt/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MbtError::QueryHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MbtError::QueryHttp(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    async fn handle_status(response: reqwest::Response) -> Result<reqwest::Response, MbtError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "GraphQL request failed".to_string());
        Err(MbtError::QueryStatus { status, message })
    }
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn post(&self, body: &QueryBody, csrf: Option<&str>) -> Result<Value, MbtError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(token) = csrf {
            request = request.header(CSRF_HEADER, token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| MbtError::QueryHttp(err.to_string()))?;
        let response = Self::handle_status(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| MbtError::QueryDecode(err.to_string()))
    }
}

/// Both tiers, run independently, for operator comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub item_id: ItemId,
    pub queried_at: String,
    pub compact: TierProbe,
    pub full: TierProbe,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierProbe {
    pub tier: QueryTier,
    pub skipped: bool,
    pub elapsed_ms: u128,
    pub raw: Option<Value>,
    pub error: Option<String>,
}

pub struct RemoteQueryClient<T: QueryTransport> {
    transport: T,
    csrf: Arc<dyn CsrfSource>,
    operation_name: String,
    operation_id: Option<String>,
}

impl<T: QueryTransport> RemoteQueryClient<T> {
    pub fn new(
        transport: T,
        csrf: Arc<dyn CsrfSource>,
        operation_name: &str,
        operation_id: Option<&str>,
    ) -> Self {
        Self {
            transport,
            csrf,
            operation_name: operation_name.to_string(),
            operation_id: operation_id.map(str::to_string),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// `None` when the tier cannot be built (compact tier without an operation id).
    pub fn body(&self, item_id: ItemId, tier: QueryTier) -> Option<QueryBody> {
        let variables = QueryVariables {
            menu_item_id: item_id.get(),
        };
        match tier {
            QueryTier::Compact => self.operation_id.as_ref().map(|operation_id| QueryBody {
                operation_name: self.operation_name.clone(),
                query: None,
                variables,
                extensions: Some(QueryExtensions {
                    operation_id: operation_id.clone(),
                }),
            }),
            QueryTier::Full => Some(QueryBody {
                operation_name: self.operation_name.clone(),
                query: Some(full_query_text(&self.operation_name)),
                variables,
                extensions: None,
            }),
        }
    }

    async fn attempt(&self, item_id: ItemId, tier: QueryTier) -> Option<Result<Value, MbtError>> {
        let body = self.body(item_id, tier)?;
        let csrf = self.csrf.csrf_token();
        tracing::debug!(%item_id, %tier, csrf = csrf.is_some(), "sending dish query");
        Some(self.transport.post(&body, csrf.as_deref()).await)
    }

    pub async fn probe(&self, item_id: ItemId) -> ProbeReport {
        let queried_at = chrono::Utc::now().to_rfc3339();
        let compact = self.probe_tier(item_id, QueryTier::Compact).await;
        let full = self.probe_tier(item_id, QueryTier::Full).await;
        ProbeReport {
            item_id,
            queried_at,
            compact,
            full,
        }
    }

    async fn probe_tier(&self, item_id: ItemId, tier: QueryTier) -> TierProbe {
        let started = Instant::now();
        let result = self.attempt(item_id, tier).await;
        let elapsed_ms = started.elapsed().as_millis();
        match result {
            None => TierProbe {
                tier,
                skipped: true,
                elapsed_ms,
                raw: None,
                error: None,
            },
            Some(Ok(raw)) => TierProbe {
                tier,
                skipped: false,
                elapsed_ms,
                raw: Some(raw),
                error: None,
            },
            Some(Err(err)) => TierProbe {
                tier,
                skipped: false,
                elapsed_ms,
                raw: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[async_trait]
impl<T: QueryTransport> DishResolver for RemoteQueryClient<T> {
    async fn resolve(&self, item_id: ItemId) -> Resolution {
        let mut answered = false;
        for tier in [QueryTier::Compact, QueryTier::Full] {
            match self.attempt(item_id, tier).await {
                None => {
                    tracing::debug!(%item_id, %tier, "tier skipped: no operation id configured");
                }
                Some(Err(err)) => {
                    tracing::warn!(%item_id, %tier, error = %err, "dish query failed");
                }
                Some(Ok(raw)) => {
                    answered = true;
                    match dish_payload(&raw) {
                        Some(dish) => {
                            let record = DishRecord::from_dish_json(item_id, dish);
                            tracing::debug!(
                                %item_id,
                                %tier,
                                primary = record.groups_primary.len(),
                                secondary = record.groups_secondary.len(),
                                "dish resolved"
                            );
                            return Resolution::Found(record, tier);
                        }
                        None => match graphql_error(&raw) {
                            Some(message) => tracing::warn!(
                                %item_id,
                                %tier,
                                graphql_error = message,
                                "GraphQL error without dish"
                            ),
                            None => tracing::debug!(%item_id, %tier, "response carried no dish"),
                        },
                    }
                }
            }
        }
        if answered {
            Resolution::Missing
        } else {
            tracing::warn!(%item_id, "both dish query tiers failed");
            Resolution::Unavailable
        }
    }
}

pub fn full_query_text(operation_name: &str) -> String {
    format!(
        "query {operation_name}($menuItemId: Int!) {{ dish(menuItemId: $menuItemId) {{ id name \
         modifierGroups {{ {GROUP_FIELDS} }} selectedVariant {{ modifierGroups {{ {GROUP_FIELDS} }} }} }} }}"
    )
}

fn dish_payload(raw: &Value) -> Option<&Value> {
    raw.pointer("/data/dish").filter(|dish| dish.is_object())
}

fn graphql_error(raw: &Value) -> Option<&str> {
    raw.get("errors")
        .and_then(|errors| errors.as_array())
        .and_then(|errors| errors.first())
        .and_then(|error| error.get("message"))
        .and_then(|message| message.as_str())
}
