//! Square commerce API order source: location listing + cursor-paginated
//! order search over a creation-time window.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use possync_core::{LineItem, Location, Money, Order, SyncWindow};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "possync-square";

pub const DEFAULT_BASE_URL: &str = "https://connect.squareup.com";

/// Pinned API version sent on every request.
pub const SQUARE_API_VERSION: &str = "2024-07-17";

const SQUARE_VERSION_HEADER: &str = "Square-Version";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("commerce api returned status {status} for {url}: {body}")]
    Unavailable { status: u16, url: String, body: String },
}

/// One page of an order search. An absent cursor ends the paginated set.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub cursor: Option<String>,
}

/// Read side of the commerce API, behind a trait so the sync engine can be
/// driven by scripted sources in tests.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn list_locations(&self) -> Result<Vec<Location>, RemoteError>;

    /// Search orders created within `window` for one location. Callers
    /// repeat with the returned cursor until it is absent; the window is
    /// identical across all pages of one run.
    async fn search_orders(
        &self,
        location_id: &str,
        window: &SyncWindow,
        cursor: Option<&str>,
    ) -> Result<OrderPage, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct SquareClientConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
}

impl Default for SquareClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SquareApiSource {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl SquareApiSource {
    pub fn new(config: SquareClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = request
            .bearer_auth(&self.access_token)
            .header(SQUARE_VERSION_HEADER, SQUARE_API_VERSION)
            .send()
            .await
            .map_err(|source| RemoteError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Unavailable {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl OrderSource for SquareApiSource {
    async fn list_locations(&self) -> Result<Vec<Location>, RemoteError> {
        let url = format!("{}/v2/locations", self.base_url);
        let response = self.send(self.client.get(&url), &url).await?;
        let parsed: LocationsResponse =
            response
                .json()
                .await
                .map_err(|source| RemoteError::Transport {
                    url: url.clone(),
                    source,
                })?;
        debug!(locations = parsed.locations.len(), "fetched locations");
        Ok(parsed.locations.into_iter().map(ApiLocation::into_domain).collect())
    }

    async fn search_orders(
        &self,
        location_id: &str,
        window: &SyncWindow,
        cursor: Option<&str>,
    ) -> Result<OrderPage, RemoteError> {
        let url = format!("{}/v2/orders/search", self.base_url);
        let body = build_search_body(location_id, window, cursor);
        let response = self.send(self.client.post(&url).json(&body), &url).await?;
        let parsed: SearchOrdersResponse =
            response
                .json()
                .await
                .map_err(|source| RemoteError::Transport {
                    url: url.clone(),
                    source,
                })?;
        debug!(
            location_id,
            orders = parsed.orders.len(),
            more = parsed.cursor.is_some(),
            "fetched order page"
        );
        Ok(OrderPage {
            orders: parsed.orders.into_iter().map(ApiOrder::into_domain).collect(),
            cursor: parsed.cursor,
        })
    }
}

/// Search request body: one location, a created-at range filter, and the
/// previous page's cursor when present.
pub fn build_search_body(
    location_id: &str,
    window: &SyncWindow,
    cursor: Option<&str>,
) -> JsonValue {
    let mut body = json!({
        "location_ids": [location_id],
        "query": {
            "filter": {
                "date_time_filter": {
                    "created_at": {
                        "start_at": window.start,
                        "end_at": window.end,
                    }
                }
            }
        }
    });
    if let Some(cursor) = cursor {
        body["cursor"] = JsonValue::String(cursor.to_string());
    }
    body
}

#[derive(Debug, Clone, Deserialize)]
struct LocationsResponse {
    #[serde(default)]
    locations: Vec<ApiLocation>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiLocation {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl ApiLocation {
    fn into_domain(self) -> Location {
        Location {
            id: self.id,
            name: self.name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SearchOrdersResponse {
    #[serde(default)]
    orders: Vec<ApiOrder>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiOrder {
    id: String,
    #[serde(default)]
    location_id: Option<String>,
    created_at: String,
    #[serde(default)]
    total_tip_money: Option<ApiMoney>,
    #[serde(default)]
    line_items: Vec<ApiLineItem>,
}

impl ApiOrder {
    fn into_domain(self) -> Order {
        Order {
            id: self.id,
            location_id: self.location_id,
            created_at: self.created_at,
            total_tip_money: self.total_tip_money.map(ApiMoney::into_domain),
            line_items: self
                .line_items
                .into_iter()
                .map(ApiLineItem::into_domain)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMoney {
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: Option<String>,
}

impl ApiMoney {
    fn into_domain(self) -> Money {
        Money {
            amount: self.amount,
            currency: self.currency,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiLineItem {
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    catalog_object_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "de_quantity")]
    quantity: f64,
    #[serde(default)]
    gross_sales_money: Option<ApiMoney>,
    #[serde(default)]
    total_money: Option<ApiMoney>,
}

impl ApiLineItem {
    fn into_domain(self) -> LineItem {
        LineItem {
            uid: self.uid,
            catalog_object_id: self.catalog_object_id,
            name: self.name,
            quantity: self.quantity,
            gross_sales_money: self.gross_sales_money.map(ApiMoney::into_domain),
            total_money: self.total_money.map(ApiMoney::into_domain),
        }
    }
}

// Square serializes quantity as a decimal string ("2"); accept a bare number
// as well and fall back to 0 on anything unparseable.
fn de_quantity<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawQuantity {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<RawQuantity>::deserialize(deserializer)? {
        Some(RawQuantity::Number(n)) => n,
        Some(RawQuantity::Text(s)) => s.trim().parse().unwrap_or(0.0),
        None => 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_response_parses() {
        let payload = r#"{
            "locations": [
                {"id": "L-MAIN", "name": "Main Truck", "status": "ACTIVE"},
                {"id": "L-EAST"}
            ]
        }"#;
        let parsed: LocationsResponse = serde_json::from_str(payload).unwrap();
        let locations = parsed
            .locations
            .into_iter()
            .map(ApiLocation::into_domain)
            .collect::<Vec<_>>();

        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].id, "L-MAIN");
        assert_eq!(locations[0].name.as_deref(), Some("Main Truck"));
        assert!(locations[1].name.is_none());
    }

    #[test]
    fn search_response_parses_string_quantities_and_missing_fields() {
        let payload = r#"{
            "orders": [
                {
                    "id": "O1",
                    "location_id": "L-MAIN",
                    "created_at": "2024-07-01T10:00:00Z",
                    "total_tip_money": {"amount": 150, "currency": "USD"},
                    "line_items": [
                        {
                            "uid": "L1",
                            "catalog_object_id": "C1",
                            "name": "Taco",
                            "quantity": "2",
                            "gross_sales_money": {"amount": 500, "currency": "USD"},
                            "total_money": {"amount": 480, "currency": "USD"}
                        },
                        {
                            "uid": "L2",
                            "quantity": 1.5
                        }
                    ]
                }
            ]
        }"#;
        let parsed: SearchOrdersResponse = serde_json::from_str(payload).unwrap();
        assert!(parsed.cursor.is_none());

        let order = parsed.orders[0].clone().into_domain();
        assert_eq!(order.created_at, "2024-07-01T10:00:00Z");
        assert_eq!(order.total_tip_money.as_ref().map(|m| m.amount), Some(150));
        assert_eq!(order.line_items[0].quantity, 2.0);
        assert_eq!(order.line_items[1].quantity, 1.5);
        assert!(order.line_items[1].catalog_object_id.is_none());
        assert!(order.line_items[1].gross_sales_money.is_none());
    }

    #[test]
    fn search_response_surfaces_pagination_cursor() {
        let payload = r#"{"orders": [], "cursor": "opaque-token"}"#;
        let parsed: SearchOrdersResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.cursor.as_deref(), Some("opaque-token"));
    }

    #[test]
    fn search_body_carries_window_and_location() {
        let window = SyncWindow {
            start: "2024-07-01T00:00:00Z".to_string(),
            end: "2024-07-02T00:00:00Z".to_string(),
        };
        let body = build_search_body("L-MAIN", &window, None);

        assert_eq!(body["location_ids"][0], "L-MAIN");
        assert_eq!(
            body["query"]["filter"]["date_time_filter"]["created_at"]["start_at"],
            "2024-07-01T00:00:00Z"
        );
        assert_eq!(
            body["query"]["filter"]["date_time_filter"]["created_at"]["end_at"],
            "2024-07-02T00:00:00Z"
        );
        assert!(body.get("cursor").is_none());
    }

    #[test]
    fn search_body_repeats_previous_cursor() {
        let window = SyncWindow {
            start: "2024-07-01T00:00:00Z".to_string(),
            end: "2024-07-02T00:00:00Z".to_string(),
        };
        let body = build_search_body("L-MAIN", &window, Some("page-2"));
        assert_eq!(body["cursor"], "page-2");
    }

    #[test]
    fn remote_unavailable_reports_status_and_body() {
        let err = RemoteError::Unavailable {
            status: 401,
            url: format!("{DEFAULT_BASE_URL}/v2/locations"),
            body: r#"{"errors":[{"code":"UNAUTHORIZED"}]}"#.to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("401"));
        assert!(text.contains("UNAUTHORIZED"));
    }
}
