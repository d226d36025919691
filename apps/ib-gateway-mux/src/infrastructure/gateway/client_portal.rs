//! Client Portal REST Adapter
//!
//! `GatewayClient` over the Interactive Brokers Client Portal gateway. The
//! gateway owns the brokerage login; this adapter only asks it to bring up
//! the brokerage session, keeps it alive with `tickle`, and maps each
//! `Operation` to one REST endpoint.
//!
//! # Status mapping
//!
//! | Response                 | Error                              |
//! |--------------------------|------------------------------------|
//! | 401 / 403 on login init  | `Auth`                             |
//! | 401 / 403 otherwise      | `SessionLost`                      |
//! | still unauthenticated    | `SessionLost`                      |
//! |   after login polling    |                                    |
//! | other non-2xx            | `Rejected { status, message }`     |
//! | unparseable body         | `Decode`                           |
//! | connect / TLS failure    | `Transport`                        |
//! | client-side timeout      | `Timeout`                          |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::application::ports::{Credentials, GatewayClient, GatewayError};
use crate::domain::operation::Operation;
use crate::domain::request::Params;
use crate::infrastructure::config::GatewaySettings;

/// Snapshot fields requested when a client does not name any:
/// last price, bid and ask.
pub const MARKET_DATA_FIELDS: &str = "31,84,86";

const FIELD_BID: &str = "84";
const FIELD_ASK: &str = "86";

const MAX_ERROR_BODY: usize = 512;

/// Status checks made after an init that did not authenticate outright.
const LOGIN_STATUS_CHECKS: u32 = 3;

/// Pause between those checks.
const LOGIN_STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
struct AuthStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Client Portal gateway client.
pub struct ClientPortalClient {
    http: Client,
    base_url: String,
    default_account: Option<String>,
    session_token: RwLock<Option<String>>,
    status_checks: u32,
    status_interval: Duration,
}

impl std::fmt::Debug for ClientPortalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPortalClient")
            .field("base_url", &self.base_url)
            .field("default_account", &self.default_account)
            .finish_non_exhaustive()
    }
}

impl ClientPortalClient {
    /// Build a client for the gateway described by `settings`.
    ///
    /// `request_timeout` bounds each HTTP exchange.
    ///
    /// # Errors
    ///
    /// `GatewayError::Transport` if the HTTP client cannot be built.
    pub fn new(settings: &GatewaySettings, request_timeout: Duration) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: settings.base_url(),
            default_account: settings.account_id.clone(),
            session_token: RwLock::new(None),
            status_checks: LOGIN_STATUS_CHECKS,
            status_interval: LOGIN_STATUS_INTERVAL,
        })
    }

    /// Override how often login re-checks auth status while the brokerage
    /// session is still coming up (second factor, competing session).
    #[must_use]
    pub fn with_login_polling(mut self, checks: u32, interval: Duration) -> Self {
        self.status_checks = checks.max(1);
        self.status_interval = interval;
        self
    }

    /// API base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self.http.request(method, &url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let token = self.session_token.read().clone();
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::SessionLost(format!(
                "gateway returned {status} for {path}"
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: error_message(status, &text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Decode(format!("{path}: {e}")))
    }

    async fn get(&self, path: &str) -> Result<Value, GatewayError> {
        self.send(Method::GET, path, &[], None).await
    }

    async fn auth_status(&self) -> Result<AuthStatus, GatewayError> {
        let value = self.get("iserver/auth/status").await?;
        serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn snapshot(&self, conids: &str, fields: &str) -> Result<Value, GatewayError> {
        self.send(
            Method::GET,
            "iserver/marketdata/snapshot",
            &[("conids", conids), ("fields", fields)],
            None,
        )
        .await
    }

    fn account_for(&self, params: &Params) -> Result<String, GatewayError> {
        match params.get("account_id") {
            Some(Value::String(account)) if is_account_id(account) => Ok(account.clone()),
            Some(other) => Err(GatewayError::InvalidParams(format!(
                "account_id must be an account identifier, got {other}"
            ))),
            None => self.default_account.clone().ok_or_else(|| {
                GatewayError::InvalidParams(
                    "account_id is required when no default account is configured".to_string(),
                )
            }),
        }
    }
}

#[async_trait]
impl GatewayClient for ClientPortalClient {
    async fn login(&self, credentials: &Credentials) -> Result<(), GatewayError> {
        *self.session_token.write() = credentials.session_token().map(str::to_string);

        let init = self
            .send(
                Method::POST,
                "iserver/auth/ssodh/init",
                &[],
                Some(&json!({"publish": true, "compete": true})),
            )
            .await
            .map_err(as_credential_failure)?;
        if init.get("authenticated").and_then(Value::as_bool) == Some(true) {
            tracing::info!(credentials = credentials.reference(), "Brokerage session initialised");
            return Ok(());
        }

        // Second factor or competing session pending: transient until polled out.
        let mut message = init.get("message").and_then(Value::as_str).map(str::to_string);
        for check in 1..=self.status_checks {
            tokio::time::sleep(self.status_interval).await;
            let status = self.auth_status().await?;
            if status.authenticated {
                tracing::info!(
                    credentials = credentials.reference(),
                    check,
                    "Brokerage session authenticated"
                );
                return Ok(());
            }
            tracing::debug!(check, max_checks = self.status_checks, "Brokerage session not authenticated yet");
            message = status.message.or(message);
        }

        Err(GatewayError::SessionLost(format!(
            "brokerage session not authenticated after {} status checks: {}",
            self.status_checks,
            message.as_deref().unwrap_or("no reason given")
        )))
    }

    async fn heartbeat(&self) -> Result<(), GatewayError> {
        self.send(Method::POST, "tickle", &[], None).await?;
        let status = self.auth_status().await?;
        if status.authenticated {
            Ok(())
        } else {
            Err(GatewayError::SessionLost(status.message.unwrap_or_else(|| {
                "gateway reports the session as unauthenticated".to_string()
            })))
        }
    }

    async fn call(&self, operation: Operation, params: &Params) -> Result<Value, GatewayError> {
        tracing::debug!(operation = %operation, "Gateway call");
        match operation {
            Operation::CheckConnection => self.get("iserver/auth/status").await,
            Operation::GetAccountInfo => self.get("portfolio/accounts").await,
            Operation::GetPortfolio => {
                let account = self.account_for(params)?;
                self.get(&format!("portfolio/{account}/positions")).await
            }
            Operation::GetTrades => self.get("iserver/account/trades").await,
            Operation::GetMarketData => {
                let conids = conid_list(params, "conids")?;
                let fields = field_list(params)?;
                self.snapshot(&conids, &fields).await
            }
            Operation::GetMidPrice => {
                let conid = params
                    .get("conid")
                    .and_then(conid_value)
                    .ok_or_else(|| {
                        GatewayError::InvalidParams("conid must be a contract id".to_string())
                    })?;
                let fields = format!("{FIELD_BID},{FIELD_ASK}");
                let snapshot = self.snapshot(&conid, &fields).await?;
                mid_price(&conid, &snapshot)
            }
        }
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.send(Method::POST, "logout", &[], None).await?;
        *self.session_token.write() = None;
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.to_string())
    }
}

fn as_credential_failure(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::SessionLost(message) => GatewayError::Auth(message),
        other => other,
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("gateway error")
            .to_string();
    }
    body.chars().take(MAX_ERROR_BODY).collect()
}

fn is_account_id(account: &str) -> bool {
    !account.is_empty() && account.chars().all(|c| c.is_ascii_alphanumeric())
}

fn conid_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())).then(|| s.to_string())
        }
        _ => None,
    }
}

fn conid_list(params: &Params, key: &str) -> Result<String, GatewayError> {
    let invalid = || GatewayError::InvalidParams(format!("{key} must list contract ids"));
    let ids: Vec<String> = match params.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| conid_value(item).ok_or_else(invalid))
            .collect::<Result<_, _>>()?,
        Some(Value::String(list)) => list
            .split(',')
            .map(|id| conid_value(&Value::String(id.to_string())).ok_or_else(invalid))
            .collect::<Result<_, _>>()?,
        Some(single @ Value::Number(_)) => vec![conid_value(single).ok_or_else(invalid)?],
        _ => return Err(invalid()),
    };
    if ids.is_empty() {
        return Err(invalid());
    }
    Ok(ids.join(","))
}

fn field_list(params: &Params) -> Result<String, GatewayError> {
    if params.contains_key("fields") {
        conid_list(params, "fields")
    } else {
        Ok(MARKET_DATA_FIELDS.to_string())
    }
}

/// Parse a snapshot quote. The gateway prefixes values with `C` (prior
/// close) or `H` (halted).
fn quote_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(raw) => {
            let digits = raw.trim().trim_start_matches(|c: char| c.is_ascii_alphabetic());
            Decimal::from_str(&digits.replace(',', "")).ok()
        }
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn mid_price(conid: &str, snapshot: &Value) -> Result<Value, GatewayError> {
    let entry = snapshot
        .as_array()
        .and_then(|rows| rows.first())
        .ok_or_else(|| GatewayError::Decode(format!("empty snapshot for conid {conid}")))?;

    let quote = |field: &str| entry.get(field).and_then(quote_decimal);
    let (Some(bid), Some(ask)) = (quote(FIELD_BID), quote(FIELD_ASK)) else {
        return Err(GatewayError::Decode(format!(
            "bid/ask not available for conid {conid}"
        )));
    };
    let mid = (bid + ask) / Decimal::TWO;

    Ok(json!({
        "conid": conid,
        "bid": bid.to_string(),
        "ask": ask.to_string(),
        "mid": mid.normalize().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer, account: Option<&str>) -> ClientPortalClient {
        let settings = GatewaySettings {
            account_id: account.map(str::to_string),
            base_url_override: Some(server.uri()),
            ..GatewaySettings::default()
        };
        ClientPortalClient::new(&settings, Duration::from_secs(5))
            .unwrap()
            .with_login_polling(2, Duration::from_millis(5))
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    async fn mount_status(server: &MockServer, authenticated: bool) {
        Mock::given(method("GET"))
            .and(path("/iserver/auth/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"authenticated": authenticated, "connected": true})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn login_succeeds_on_init() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iserver/auth/ssodh/init"))
            .and(body_json(json!({"publish": true, "compete": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"authenticated": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client
            .login(&Credentials::new("ib-primary", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn login_falls_back_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iserver/auth/ssodh/init"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"authenticated": false, "challenge": "abc"})),
            )
            .mount(&server)
            .await;
        mount_status(&server, true).await;

        let client = client_for(&server, None);
        assert!(client.login(&Credentials::new("ib-primary", None)).await.is_ok());
    }

    #[tokio::test]
    async fn pending_login_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iserver/auth/ssodh/init"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authenticated": false,
                "connected": true,
                "message": "challenge pending"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/iserver/auth/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"authenticated": false, "connected": true})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client
            .login(&Credentials::new("ib-primary", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SessionLost(_)), "{err:?}");
        assert!(!err.is_credential());
        assert!(err.to_string().contains("challenge pending"), "{err}");
    }

    #[tokio::test]
    async fn login_polls_status_until_authenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iserver/auth/ssodh/init"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"authenticated": false})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/iserver/auth/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"authenticated": false})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_status(&server, true).await;

        let client = client_for(&server, None);
        assert!(client.login(&Credentials::new("ib-primary", None)).await.is_ok());
    }

    #[tokio::test]
    async fn login_unauthorized_is_credential_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iserver/auth/ssodh/init"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client
            .login(&Credentials::new("ib-primary", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn session_token_is_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iserver/auth/ssodh/init"))
            .and(header("authorization", "Bearer tok-123456"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"authenticated": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/iserver/account/trades"))
            .and(header("authorization", "Bearer tok-123456"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client
            .login(&Credentials::new("ib-primary", Some("tok-123456".to_string())))
            .await
            .unwrap();
        let trades = client
            .call(Operation::GetTrades, &Params::new())
            .await
            .unwrap();
        assert_eq!(trades, json!([]));
    }

    #[tokio::test]
    async fn heartbeat_tickles_then_checks_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tickle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session": "abc"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_status(&server, true).await;

        client_for(&server, None).heartbeat().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_unauthenticated_is_session_loss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tickle"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        mount_status(&server, false).await;

        let err = client_for(&server, None).heartbeat().await.unwrap_err();
        assert!(err.indicates_session_loss());
    }

    #[tokio::test]
    async fn portfolio_uses_default_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/U1234567/positions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"conid": 265_598, "position": 100.0}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("U1234567"));
        let positions = client
            .call(Operation::GetPortfolio, &Params::new())
            .await
            .unwrap();
        assert_eq!(positions[0]["position"], json!(100.0));
    }

    #[tokio::test]
    async fn portfolio_param_overrides_default_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/DU7654321/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("U1234567"));
        client
            .call(
                Operation::GetPortfolio,
                &params(json!({"account_id": "DU7654321"})),
            )
            .await
            .unwrap();
    }

    #[test_case(json!({}) ; "missing without default")]
    #[test_case(json!({"account_id": "../iserver"}) ; "path characters")]
    #[test_case(json!({"account_id": 42}) ; "not a string")]
    #[tokio::test]
    async fn portfolio_account_is_validated(raw: Value) {
        let server = MockServer::start().await;
        let err = client_for(&server, None)
            .call(Operation::GetPortfolio, &params(raw))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)), "{err:?}");
    }

    #[tokio::test]
    async fn market_data_builds_snapshot_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/iserver/marketdata/snapshot"))
            .and(query_param("conids", "265598,8314"))
            .and(query_param("fields", MARKET_DATA_FIELDS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"conid": 265_598, "31": "189.50"},
                {"conid": 8314, "31": "101.25"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = client_for(&server, None)
            .call(
                Operation::GetMarketData,
                &params(json!({"conids": [265_598, "8314"]})),
            )
            .await
            .unwrap();
        assert_eq!(snapshot.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn market_data_requires_conids() {
        let server = MockServer::start().await;
        let err = client_for(&server, None)
            .call(Operation::GetMarketData, &params(json!({"conids": "AAPL"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn mid_price_from_bid_and_ask() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/iserver/marketdata/snapshot"))
            .and(query_param("conids", "265598"))
            .and(query_param("fields", "84,86"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"conid": 265_598, "84": "189.10", "86": "189.20"}
            ])))
            .mount(&server)
            .await;

        let quote = client_for(&server, None)
            .call(Operation::GetMidPrice, &params(json!({"conid": 265_598})))
            .await
            .unwrap();
        assert_eq!(quote["mid"], "189.15");
        assert_eq!(quote["bid"], "189.10");
        assert_eq!(quote["conid"], "265598");
    }

    #[tokio::test]
    async fn unauthorized_call_is_session_loss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/accounts"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .call(Operation::GetAccountInfo, &Params::new())
            .await
            .unwrap_err();
        assert!(err.indicates_session_loss());
    }

    #[tokio::test]
    async fn server_error_is_rejected_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/iserver/account/trades"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .call(Operation::GetTrades, &Params::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Rejected {
                status: 500,
                message: "internal error".to_string()
            }
        );
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .call(Operation::GetAccountInfo, &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_transport_error() {
        let settings = GatewaySettings {
            base_url_override: Some("http://127.0.0.1:1".to_string()),
            ..GatewaySettings::default()
        };
        let client = ClientPortalClient::new(&settings, Duration::from_secs(2)).unwrap();

        let err = client.heartbeat().await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
    }

    #[test_case(json!("101.25"), Some("101.25") ; "plain")]
    #[test_case(json!("C101.25"), Some("101.25") ; "prior close prefix")]
    #[test_case(json!("1,024.50"), Some("1024.50") ; "thousands separator")]
    #[test_case(json!(99.5), Some("99.5") ; "number")]
    #[test_case(json!("n/a"), None ; "garbage")]
    #[test_case(json!(null), None ; "null")]
    fn parses_quotes(raw: Value, expected: Option<&str>) {
        assert_eq!(quote_decimal(&raw).map(|d| d.to_string()).as_deref(), expected);
    }

    #[test]
    fn mid_price_needs_both_sides() {
        let err = mid_price("8314", &json!([{"84": "10.00"}])).unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
        assert!(mid_price("8314", &json!([])).is_err());
    }
}
