//! Client for the remote portfolio service.
//!
//! [`RemoteStore`] is the seam the synchronizer talks to; [`HttpStore`] is the
//! `reqwest` implementation against the service's JSON API.

use crate::error::StoreError;
use crate::holding::Holding;
use crate::portfolio::PortfolioMetrics;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Read and write access to the holdings kept by the remote service.
///
/// Every call is a single round-trip. Nothing is retried.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_holdings(&self) -> Result<Vec<Holding>, StoreError>;

    /// Latest market price for `ticker`.
    async fn get_quote(&self, ticker: &str) -> Result<Decimal, StoreError>;

    async fn create_holding(&self, holding: &Holding) -> Result<Holding, StoreError>;

    async fn update_holding(&self, ticker: &str, holding: &Holding)
        -> Result<Holding, StoreError>;

    /// Ask the service to refresh the stored price of `ticker`.
    async fn update_price(&self, ticker: &str) -> Result<Holding, StoreError>;

    async fn delete_holding(&self, ticker: &str) -> Result<(), StoreError>;

    async fn get_aggregate_metrics(&self) -> Result<PortfolioMetrics, StoreError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    current_price: Option<Decimal>,
}

impl QuoteResponse {
    /// A missing or zero price means the service had no quote.
    fn price(&self) -> Option<Decimal> {
        self.current_price.filter(|p| !p.is_zero())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsResponse {
    #[serde(default)]
    total_value: Decimal,
    #[serde(default)]
    top_stock: Option<String>,
    #[serde(default)]
    portfolio_distribution: BTreeMap<String, Decimal>,
}

impl From<MetricsResponse> for PortfolioMetrics {
    fn from(response: MetricsResponse) -> Self {
        PortfolioMetrics {
            total_value: response.total_value,
            top_holding: response
                .top_stock
                .filter(|t| !t.is_empty() && t != "N/A"),
            distribution: response.portfolio_distribution,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Map a non-success response to the error taxonomy.
///
/// `ticker` names the holding the request addressed, if any.
pub fn classify_error(status: StatusCode, body: &str, ticker: Option<&str>) -> StoreError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(ticker.unwrap_or_default().to_string()),
        StatusCode::CONFLICT => StoreError::Conflict(message),
        // the service reports unique-constraint violations as plain 500s
        StatusCode::INTERNAL_SERVER_ERROR if message.contains("ticker_symbol") => {
            StoreError::Conflict(message)
        }
        _ => StoreError::Network {
            status: Some(status.as_u16()),
            message,
        },
    }
}

/// [`RemoteStore`] over HTTP.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!("{method} {url}");
        self.client.request(method, url)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        ticker: Option<&str>,
    ) -> Result<Response, StoreError> {
        let response = request.send().await.map_err(|e| {
            warn!("Request failed: {e}");
            StoreError::from(e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_error(status, &body, ticker);
        warn!("Request failed: {err}");
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        ticker: Option<&str>,
    ) -> Result<T, StoreError> {
        let response = self.send(request, ticker).await?;
        response.json::<T>().await.map_err(|e| {
            warn!("Failed to decode response: {e}");
            StoreError::network(format!("invalid response body: {e}"))
        })
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn list_holdings(&self) -> Result<Vec<Holding>, StoreError> {
        self.send_json(self.request(Method::GET, "/api/stocks"), None)
            .await
    }

    async fn get_quote(&self, ticker: &str) -> Result<Decimal, StoreError> {
        let path = format!("/api/stocks/realtime/{ticker}");
        let unavailable = |reason: String| StoreError::QuoteUnavailable {
            ticker: ticker.to_string(),
            reason,
        };

        let quote: QuoteResponse = self
            .send_json(self.request(Method::GET, &path), Some(ticker))
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        quote
            .price()
            .ok_or_else(|| unavailable("no current price in response".to_string()))
    }

    async fn create_holding(&self, holding: &Holding) -> Result<Holding, StoreError> {
        let request = self.request(Method::POST, "/api/stocks").json(holding);
        self.send_json(request, Some(holding.ticker_symbol.as_str()))
            .await
    }

    async fn update_holding(
        &self,
        ticker: &str,
        holding: &Holding,
    ) -> Result<Holding, StoreError> {
        let path = format!("/api/stocks/ticker/{ticker}");
        let request = self.request(Method::PUT, &path).json(holding);
        self.send_json(request, Some(ticker)).await
    }

    async fn update_price(&self, ticker: &str) -> Result<Holding, StoreError> {
        let path = format!("/api/stocks/updatePrice/{ticker}");
        self.send_json(self.request(Method::PUT, &path), Some(ticker))
            .await
    }

    async fn delete_holding(&self, ticker: &str) -> Result<(), StoreError> {
        let path = format!("/api/stocks/{ticker}");
        self.send(self.request(Method::DELETE, &path), Some(ticker))
            .await?;
        Ok(())
    }

    async fn get_aggregate_metrics(&self) -> Result<PortfolioMetrics, StoreError> {
        let metrics: MetricsResponse = self
            .send_json(self.request(Method::GET, "/api/portfolio/metrics"), None)
            .await?;
        Ok(metrics.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_duplicate_ticker_is_a_conflict() {
        let body = r#"{"message":"duplicate key value violates unique constraint \"stock_ticker_symbol_key\""}"#;
        let err = classify_error(StatusCode::INTERNAL_SERVER_ERROR, body, Some("AAPL"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            err.user_message(),
            "A stock with this ticker symbol already exists."
        );
    }

    #[test]
    fn test_other_server_errors_are_network_errors() {
        let err = classify_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"message":"database unavailable"}"#,
            None,
        );
        match err {
            StoreError::Network { status, message } => {
                assert_eq!(status, Some(500));
                assert_eq!(message, "database unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_not_found_and_conflict_statuses() {
        let err = classify_error(StatusCode::NOT_FOUND, "", Some("TSLA"));
        assert!(matches!(err, StoreError::NotFound(ref t) if t == "TSLA"));

        let err = classify_error(StatusCode::CONFLICT, "exists", Some("TSLA"));
        assert!(matches!(err, StoreError::Conflict(ref m) if m == "exists"));
    }

    #[test]
    fn test_non_json_error_body_is_kept_verbatim() {
        let err = classify_error(StatusCode::BAD_GATEWAY, "upstream down", None);
        assert_eq!(err.to_string(), "network error (HTTP 502): upstream down");
    }

    #[test]
    fn test_metrics_response_conversion() {
        let body = r#"{"totalValue": 2100, "topStock": "AAPL", "portfolioDistribution": {"AAPL": 150, "MSFT": 300.5}}"#;
        let metrics: PortfolioMetrics = serde_json::from_str::<MetricsResponse>(body)
            .unwrap()
            .into();
        assert_eq!(metrics.total_value, dec!(2100));
        assert_eq!(metrics.top_holding.as_deref(), Some("AAPL"));
        assert_eq!(metrics.distribution["MSFT"], dec!(300.5));

        let empty: PortfolioMetrics = serde_json::from_str::<MetricsResponse>(
            r#"{"totalValue": 0, "topStock": "", "portfolioDistribution": {}}"#,
        )
        .unwrap()
        .into();
        assert_eq!(empty.top_holding, None);
    }

    #[test]
    fn test_quote_response_may_omit_price() {
        let quote: QuoteResponse = serde_json::from_str(r#"{"currentPrice": 187.3}"#).unwrap();
        assert_eq!(quote.current_price, Some(dec!(187.3)));
        let quote: QuoteResponse = serde_json::from_str(r#"{"currentPrice": null}"#).unwrap();
        assert_eq!(quote.current_price, None);
        let quote: QuoteResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(quote.current_price, None);
    }

    #[test]
    fn test_zero_or_missing_quote_has_no_price() {
        let quote: QuoteResponse = serde_json::from_str(r#"{"currentPrice": 0}"#).unwrap();
        assert_eq!(quote.price(), None);
        let quote: QuoteResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(quote.price(), None);
        let quote: QuoteResponse = serde_json::from_str(r#"{"currentPrice": 12.5}"#).unwrap();
        assert_eq!(quote.price(), Some(dec!(12.5)));
    }

    /// A one-request-per-connection HTTP server answering with `responses` in
    /// order. Returns its base URL and the `METHOD path body` of each request.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                seen.lock().unwrap().push(request);

                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (url, requests)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }

        let request_line = head.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, path) = (parts.next().unwrap(), parts.next().unwrap());
        let body = String::from_utf8_lossy(&buf[header_end..]);
        format!("{method} {path} {body}").trim_end().to_string()
    }

    const AAPL: &str =
        r#"{"id":1,"companyName":"Apple Inc.","tickerSymbol":"AAPL","price":150,"quantity":10}"#;

    #[tokio::test]
    async fn test_operations_hit_service_routes() {
        let (url, requests) = serve(vec![
            (200, "[]"),
            (200, AAPL),
            (200, AAPL),
            (200, AAPL),
            (200, ""),
            (200, r#"{"currentPrice": 187.25}"#),
            (200, r#"{"totalValue": 1500, "topStock": "AAPL", "portfolioDistribution": {"AAPL": 150}}"#),
        ])
        .await;
        let store = HttpStore::new(&url, Duration::from_secs(5)).unwrap();
        let holding = Holding::new("Apple Inc.", "AAPL", dec!(150), 10);

        assert!(store.list_holdings().await.unwrap().is_empty());
        assert_eq!(store.create_holding(&holding).await.unwrap().id, Some(1));
        store.update_holding("AAPL", &holding).await.unwrap();
        store.update_price("AAPL").await.unwrap();
        store.delete_holding("AAPL").await.unwrap();
        assert_eq!(store.get_quote("AAPL").await.unwrap(), dec!(187.25));
        assert_eq!(
            store.get_aggregate_metrics().await.unwrap().total_value,
            dec!(1500)
        );

        let requests = requests.lock().unwrap().clone();
        let routes: Vec<String> = requests
            .iter()
            .map(|r| r.splitn(3, ' ').take(2).collect::<Vec<_>>().join(" "))
            .collect();
        assert_eq!(
            routes,
            [
                "GET /api/stocks",
                "POST /api/stocks",
                "PUT /api/stocks/ticker/AAPL",
                "PUT /api/stocks/updatePrice/AAPL",
                "DELETE /api/stocks/AAPL",
                "GET /api/stocks/realtime/AAPL",
                "GET /api/portfolio/metrics",
            ]
        );
        assert!(requests[1].contains(r#""tickerSymbol":"AAPL""#));
        assert!(!requests[1].contains(r#""id""#));
    }

    #[tokio::test]
    async fn test_zero_quote_over_http_is_unavailable() {
        let (url, _) = serve(vec![(200, r#"{"currentPrice": 0}"#), (404, "")]).await;
        let store = HttpStore::new(&url, Duration::from_secs(5)).unwrap();

        let err = store.get_quote("AAPL").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuoteUnavailable);
        let err = store.get_quote("AAPL").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuoteUnavailable);
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let (url, _) = serve(vec![
            (500, r#"{"message":"duplicate key value violates unique constraint \"stock_ticker_symbol_key\""}"#),
            (404, ""),
        ])
        .await;
        let store = HttpStore::new(&url, Duration::from_secs(5)).unwrap();
        let holding = Holding::new("Apple Inc.", "AAPL", dec!(150), 10);

        let err = store.create_holding(&holding).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = store.delete_holding("TSLA").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref t) if t == "TSLA"));
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let store = HttpStore::new(&url, Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let err = store.list_holdings().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let store = HttpStore::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.base_url(), "http://localhost:8080");
        assert_eq!(store.url("/api/stocks"), "http://localhost:8080/api/stocks");
    }
}
