// =============================================================================
// Bybit v5 REST client — HMAC-SHA256 signed, linear perpetuals
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-BAPI-API-KEY / X-BAPI-TIMESTAMP / X-BAPI-RECV-WINDOW / X-BAPI-SIGN
// headers; the signature covers timestamp + key + recv_window + payload.
// recvWindow is 5 000 ms to tolerate minor clock drift.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::error::{BotError, BotResult};
use crate::exchange::{Exchange, OrderRequest};
use crate::types::{Bar, Position, PositionSide, Timeframe};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Bybit v5 REST client for the linear (USDT-perpetual) category.
#[derive(Clone)]
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client. `testnet` selects the endpoint only.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        debug!(base_url, "BybitClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// HMAC-SHA256 hex signature over `timestamp + api_key + recv_window +
    /// payload` (query string for GET, raw JSON body for POST).
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_headers(&self, timestamp: u64, signature: &str) -> Vec<(&'static str, String)> {
        vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp.to_string()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", signature.to_string()),
        ]
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Signed GET; `query` is the already-encoded query string.
    async fn signed_get(&self, path: &str, query: &str) -> BotResult<serde_json::Value> {
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(timestamp, query);
        let url = format!("{}{path}?{query}", self.base_url);

        let mut req = self.client.get(&url);
        for (name, value) in self.auth_headers(timestamp, &signature) {
            req = req.header(name, value);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(path, &e))?;
        Self::decode_response(path, resp).await
    }

    /// Signed POST with a JSON body.
    async fn signed_post(&self, path: &str, body: &serde_json::Value) -> BotResult<serde_json::Value> {
        let raw = body.to_string();
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(timestamp, &raw);
        let url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(raw);
        for (name, value) in self.auth_headers(timestamp, &signature) {
            req = req.header(name, value);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(path, &e))?;
        Self::decode_response(path, resp).await
    }

    /// Public (unsigned) GET.
    async fn public_get(&self, path: &str, query: &str) -> BotResult<serde_json::Value> {
        let url = format!("{}{path}?{query}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(path, &e))?;
        Self::decode_response(path, resp).await
    }

    /// Map the HTTP status and Bybit `retCode` into the error taxonomy and
    /// return `result` on success.
    async fn decode_response(path: &str, resp: reqwest::Response) -> BotResult<serde_json::Value> {
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BotError::AuthFailure(format!("{path} returned {status}")));
        }
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(BotError::TransientExchange(format!(
                "{path} returned {status}"
            )));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            BotError::TransientExchange(format!("{path}: failed to parse response: {e}"))
        })?;

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let ret_msg = body["retMsg"].as_str().unwrap_or("").to_string();
            return Err(classify_ret_code(path, ret_code, ret_msg));
        }

        Ok(body["result"].clone())
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify_reqwest_error(path: &str, err: &reqwest::Error) -> BotError {
    BotError::TransientExchange(format!("{path}: {err}"))
}

/// Bybit business error codes mapped onto the engine taxonomy.
///
/// Unknown codes fail fast (filter-rejected) rather than being retried: a
/// blind retry of a permanent failure wastes the trigger, and a wrongly
/// aborted plan is surfaced to the operator anyway.
fn classify_ret_code(path: &str, code: i64, msg: String) -> BotError {
    match code {
        // Signature / API-key problems.
        10003 | 10004 | 10005 | 33004 => {
            BotError::AuthFailure(format!("{path}: retCode {code}: {msg}"))
        }
        // Timestamp drift or venue-side throttling.
        10002 | 10006 | 10016 | 10018 => {
            BotError::TransientExchange(format!("{path}: retCode {code}: {msg}"))
        }
        // Not enough margin for the requested order.
        110007 | 110012 | 110044 => {
            BotError::InsufficientMargin(format!("{path}: retCode {code}: {msg}"))
        }
        _ => BotError::SymbolFilterRejected(format!("{path}: retCode {code}: {msg}")),
    }
}

// ---------------------------------------------------------------------------
// Wire-format helpers
// ---------------------------------------------------------------------------

/// Bybit kline interval code for a sampled timeframe.
fn interval_code(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::M15 => Some("15"),
        Timeframe::H1 => Some("60"),
        Timeframe::H4 => Some("240"),
        Timeframe::D1 => Some("D"),
        Timeframe::Final => None,
    }
}

/// Parse a JSON value that may be a string or a number into `f64`.
fn json_f64(value: &serde_json::Value) -> Option<f64> {
    if let Some(s) = value.as_str() {
        if s.is_empty() {
            return None;
        }
        s.parse::<f64>().ok()
    } else {
        value.as_f64()
    }
}

/// Read a numeric field under any of the given names. Bybit has shipped both
/// camelCase and legacy names for several position fields.
fn field_f64(obj: &serde_json::Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| json_f64(&obj[*n]))
}

/// Render a quantity or price without scientific notation or trailing zeros.
fn decimal_str(value: f64) -> String {
    let s = format!("{value:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

// ---------------------------------------------------------------------------
// Exchange impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Exchange for BybitClient {
    /// GET /v5/market/kline (public). Bybit returns newest-first; the core
    /// contract is oldest-first, so the window is reversed here.
    #[instrument(skip(self), name = "bybit::get_ohlcv")]
    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> BotResult<Vec<Bar>> {
        let interval = interval_code(timeframe).ok_or_else(|| {
            BotError::MarketDataUnavailable("final timeframe is synthetic, not sampled".into())
        })?;

        let query =
            format!("category=linear&symbol={symbol}&interval={interval}&limit={limit}");
        let result = self.public_get("/v5/market/kline", &query).await?;

        let raw = result["list"].as_array().ok_or_else(|| {
            BotError::TransientExchange("kline response missing 'list' array".into())
        })?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw.iter().rev() {
            let row = entry.as_array().ok_or_else(|| {
                BotError::TransientExchange("kline entry is not an array".into())
            })?;
            if row.len() < 6 {
                warn!(elements = row.len(), "skipping malformed kline entry");
                continue;
            }
            let open_ts = json_f64(&row[0]).unwrap_or(0.0) as i64;
            let (open, high, low, close, volume) = match (
                json_f64(&row[1]),
                json_f64(&row[2]),
                json_f64(&row[3]),
                json_f64(&row[4]),
                json_f64(&row[5]),
            ) {
                (Some(o), Some(h), Some(l), Some(c), Some(v)) => (o, h, l, c, v),
                _ => {
                    warn!("skipping kline entry with unparseable fields");
                    continue;
                }
            };
            bars.push(Bar {
                open_ts,
                open,
                high,
                low,
                close,
                volume,
            });
        }

        debug!(symbol, %timeframe, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    /// GET /v5/account/wallet-balance (signed) — unified-account totalEquity.
    #[instrument(skip(self), name = "bybit::get_balance")]
    async fn get_balance(&self) -> BotResult<f64> {
        let result = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let account = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| {
                BotError::TransientExchange("wallet-balance response missing account".into())
            })?;

        let equity = field_f64(account, &["totalEquity"]).ok_or_else(|| {
            BotError::TransientExchange("wallet-balance missing totalEquity".into())
        })?;

        debug!(equity, "balance retrieved");
        Ok(equity)
    }

    /// GET /v5/position/list (signed), normalized. A missing or zero-size
    /// entry is a flat position, not an error.
    #[instrument(skip(self), name = "bybit::get_position")]
    async fn get_position(&self, symbol: &str) -> BotResult<Position> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.signed_get("/v5/position/list", &query).await?;

        let entry = match result["list"].as_array().and_then(|l| l.first()) {
            Some(e) => e,
            None => return Ok(Position::flat()),
        };

        let size = field_f64(entry, &["size", "qty"]).unwrap_or(0.0);
        let side = match entry["side"].as_str() {
            Some("Buy") if size > 0.0 => PositionSide::Long,
            Some("Sell") if size > 0.0 => PositionSide::Short,
            _ => PositionSide::Flat,
        };
        if side == PositionSide::Flat {
            return Ok(Position::flat());
        }

        let position = Position {
            side,
            size_base: size,
            leverage: field_f64(entry, &["leverage"]).unwrap_or(0.0) as u32,
            entry_price: field_f64(entry, &["avgPrice", "entryPrice", "entry_price"])
                .unwrap_or(0.0),
            mark_price: field_f64(entry, &["markPrice", "mark_price"]).unwrap_or(0.0),
            unrealized_pnl: field_f64(entry, &["unrealisedPnl", "unrealizedPnl"]).unwrap_or(0.0),
            liq_price: field_f64(entry, &["liqPrice", "liq_price"]),
        };

        debug!(symbol, side = %position.side, size = position.size_base, "position retrieved");
        Ok(position)
    }

    /// POST /v5/position/set-leverage (signed). Bybit answers retCode 110043
    /// when the leverage already matches; that is a success here.
    #[instrument(skip(self), name = "bybit::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> BotResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });

        match self.signed_post("/v5/position/set-leverage", &body).await {
            Ok(_) => {
                debug!(symbol, leverage, "leverage set");
                Ok(())
            }
            Err(BotError::SymbolFilterRejected(msg)) if msg.contains("retCode 110043") => {
                debug!(symbol, leverage, "leverage already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// POST /v5/order/create (signed).
    #[instrument(skip(self, request), name = "bybit::create_order")]
    async fn create_order(&self, request: &OrderRequest) -> BotResult<String> {
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "orderType": request.order_type.to_string(),
            "qty": decimal_str(request.qty),
        });

        if let Some(price) = request.price {
            body["price"] = serde_json::Value::String(decimal_str(price));
            body["timeInForce"] = serde_json::Value::String("GTC".into());
        }
        if request.reduce_only {
            body["reduceOnly"] = serde_json::Value::Bool(true);
        }
        if let Some(sl) = request.stop_loss {
            body["stopLoss"] = serde_json::Value::String(decimal_str(sl));
        }
        if let Some(tp) = request.take_profit {
            body["takeProfit"] = serde_json::Value::String(decimal_str(tp));
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            qty = request.qty,
            reduce_only = request.reduce_only,
            "placing order"
        );

        let result = self.signed_post("/v5/order/create", &body).await?;
        let order_id = result["orderId"]
            .as_str()
            .ok_or_else(|| {
                BotError::TransientExchange("order response missing orderId".into())
            })?
            .to_string();

        debug!(order_id = %order_id, "order placed");
        Ok(order_id)
    }

    /// POST /v5/order/cancel (signed).
    #[instrument(skip(self), name = "bybit::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> BotResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        self.signed_post("/v5/order/cancel", &body).await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let client = BybitClient::new("key", "secret", true);
        let a = client.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        let b = client.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "hex-encoded SHA-256");
        let c = client.sign(1_700_000_000_001, "category=linear&symbol=BTCUSDT");
        assert_ne!(a, c);
    }

    #[test]
    fn testnet_flag_selects_endpoint() {
        assert_eq!(BybitClient::new("k", "s", true).base_url, TESTNET_URL);
        assert_eq!(BybitClient::new("k", "s", false).base_url, MAINNET_URL);
    }

    #[test]
    fn interval_codes() {
        assert_eq!(interval_code(Timeframe::M15), Some("15"));
        assert_eq!(interval_code(Timeframe::H1), Some("60"));
        assert_eq!(interval_code(Timeframe::H4), Some("240"));
        assert_eq!(interval_code(Timeframe::D1), Some("D"));
        assert_eq!(interval_code(Timeframe::Final), None);
    }

    #[test]
    fn json_f64_accepts_strings_and_numbers() {
        assert_eq!(json_f64(&serde_json::json!("60000.5")), Some(60000.5));
        assert_eq!(json_f64(&serde_json::json!(5)), Some(5.0));
        assert_eq!(json_f64(&serde_json::json!("")), None);
        assert_eq!(json_f64(&serde_json::json!(null)), None);
    }

    #[test]
    fn field_f64_tries_name_variants() {
        let obj = serde_json::json!({ "entryPrice": "59000" });
        assert_eq!(
            field_f64(&obj, &["avgPrice", "entryPrice", "entry_price"]),
            Some(59000.0)
        );
        assert_eq!(field_f64(&obj, &["markPrice"]), None);
    }

    #[test]
    fn decimal_str_has_no_sci_notation() {
        assert_eq!(decimal_str(0.016), "0.016");
        assert_eq!(decimal_str(60000.0), "60000");
        assert_eq!(decimal_str(0.00000001), "0.00000001");
    }

    #[test]
    fn ret_code_classification() {
        assert!(matches!(
            classify_ret_code("/x", 10004, String::new()),
            BotError::AuthFailure(_)
        ));
        assert!(matches!(
            classify_ret_code("/x", 10006, String::new()),
            BotError::TransientExchange(_)
        ));
        assert!(matches!(
            classify_ret_code("/x", 110007, String::new()),
            BotError::InsufficientMargin(_)
        ));
        assert!(matches!(
            classify_ret_code("/x", 170131, String::new()),
            BotError::SymbolFilterRejected(_)
        ));
    }

    #[test]
    fn debug_redacts_secrets() {
        let client = BybitClient::new("my-key", "my-secret", true);
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("my-key"));
        assert!(!dbg.contains("my-secret"));
    }
}
