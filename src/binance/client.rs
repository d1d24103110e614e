// =============================================================================
// Binance USDT-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers. Larger drift is
// handled explicitly: on a -1021 ("timestamp out of recvWindow") response the
// client re-reads the server time, adjusts its local offset, and retries the
// request exactly once. No other call is ever retried automatically — order
// placement is not idempotent.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::binance::error::{
    BrokerError, CODE_NO_NEED_TO_CHANGE_MARGIN, CODE_TIMESTAMP_OUT_OF_WINDOW,
};
use crate::types::{
    Balance, Candle, ExecPrice, MarginMode, OrderResult, OrderSide, Position, PositionSide,
    SymbolPrecision,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// 24-hour ticker entry from the public spot endpoint, used by the downloader
/// for top-N symbol selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker24h {
    pub symbol: String,
    pub quote_volume: f64,
    pub last_price: f64,
    pub price_change_pct: f64,
}

/// Binance USDT-M futures REST client with HMAC-SHA256 request signing.
pub struct FuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    spot_url: String,
    client: reqwest::Client,
    /// Server-minus-local clock offset in milliseconds, updated on skew.
    time_offset_ms: Mutex<i64>,
    precision_cache: RwLock<HashMap<String, SymbolPrecision>>,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `FuturesClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("FuturesClient initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            spot_url: "https://api.binance.com".to_string(),
            client,
            time_offset_ms: Mutex::new(0),
            precision_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Credential-free client for consumers that only touch public endpoints
    /// (klines, tickers). Signed calls through this client will fail `Auth`.
    pub fn public() -> Self {
        Self::new("", "")
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds, corrected by the server offset.
    fn timestamp_ms(&self) -> i64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64;
        local + *self.time_offset_ms.lock()
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a request and map the response into JSON or a typed failure.
    async fn dispatch(
        &self,
        method: Method,
        url: String,
    ) -> Result<serde_json::Value, BrokerError> {
        let resp = self.client.request(method, url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Network(format!("invalid response body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("").to_string();
        Err(BrokerError::classify(status.as_u16(), code, &msg))
    }

    /// Public (unsigned) futures endpoint.
    async fn public_request(
        &self,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, BrokerError> {
        let url = if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, params)
        };
        self.dispatch(Method::GET, url).await
    }

    /// Signed endpoint with single-shot clock-skew recovery: a -1021 response
    /// triggers a server-time resync and exactly one retry.
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, BrokerError> {
        let first = self.signed_once(method.clone(), path, params).await;

        match first {
            Err(BrokerError::Venue { code, .. }) if code == CODE_TIMESTAMP_OUT_OF_WINDOW => {
                warn!(path, "timestamp outside recvWindow — resyncing clock and retrying once");
                self.sync_time().await?;
                self.signed_once(method, path, params).await
            }
            other => other,
        }
    }

    async fn signed_once(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, BrokerError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.dispatch(method, url).await
    }

    // -------------------------------------------------------------------------
    // Connectivity / time
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/ping — connectivity check.
    #[instrument(skip(self), name = "binance::ping")]
    pub async fn ping(&self) -> Result<(), BrokerError> {
        self.public_request("/fapi/v1/ping", "").await?;
        debug!("ping ok");
        Ok(())
    }

    /// GET /fapi/v1/time — venue server time in milliseconds.
    #[instrument(skip(self), name = "binance::server_time")]
    pub async fn server_time(&self) -> Result<i64, BrokerError> {
        let body = self.public_request("/fapi/v1/time", "").await?;
        body["serverTime"]
            .as_i64()
            .ok_or_else(|| BrokerError::Network("time response missing serverTime".into()))
    }

    /// Re-read the server time and store the offset used for signed requests.
    pub async fn sync_time(&self) -> Result<(), BrokerError> {
        let server = self.server_time().await?;
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64;
        let offset = server - local;
        *self.time_offset_ms.lock() = offset;
        info!(offset_ms = offset, "clock offset synchronised with venue");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/balance (signed) — USDT balance snapshot.
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self) -> Result<Balance, BrokerError> {
        let body = self
            .signed_request(Method::GET, "/fapi/v2/balance", "")
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| BrokerError::Network("balance response is not an array".into()))?;

        for entry in entries {
            if entry["asset"].as_str() == Some("USDT") {
                return Ok(Balance {
                    total: parse_str_decimal(&entry["balance"])?,
                    available: parse_str_decimal(&entry["availableBalance"])?,
                    unrealized_pnl: parse_str_decimal(&entry["crossUnPnl"])?,
                });
            }
        }

        warn!("USDT not found in balance response — returning zero balance");
        Ok(Balance {
            total: Decimal::ZERO,
            available: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        })
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/positionRisk (signed) — position for one symbol, `None`
    /// when the venue reports a zero quantity.
    #[instrument(skip(self), name = "binance::get_position")]
    pub async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        let params = format!("symbol={symbol}");
        let body = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| BrokerError::Network("positionRisk response is not an array".into()))?;

        for entry in entries {
            if entry["symbol"].as_str() == Some(symbol) {
                return parse_position(entry);
            }
        }
        Ok(None)
    }

    /// GET /fapi/v2/positionRisk (signed) — every position with qty != 0.
    #[instrument(skip(self), name = "binance::get_all_positions")]
    pub async fn get_all_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let body = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", "")
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| BrokerError::Network("positionRisk response is not an array".into()))?;

        let mut positions = Vec::new();
        for entry in entries {
            if let Some(pos) = parse_position(entry)? {
                positions.push(pos);
            }
        }

        debug!(count = positions.len(), "open positions retrieved");
        Ok(positions)
    }

    // -------------------------------------------------------------------------
    // Leverage / margin configuration
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BrokerError> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed_request(Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        info!(symbol, leverage, "leverage configured");
        Ok(())
    }

    /// POST /fapi/v1/marginType (signed). The venue answers an error when the
    /// symbol is already in the requested mode; that response is success here.
    #[instrument(skip(self), name = "binance::set_margin_mode")]
    pub async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), BrokerError> {
        let params = format!("symbol={symbol}&marginType={}", mode.as_str());
        match self
            .signed_request(Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => {
                info!(symbol, mode = %mode, "margin mode configured");
                Ok(())
            }
            Err(BrokerError::Venue { code, ref message })
                if code == CODE_NO_NEED_TO_CHANGE_MARGIN
                    || message.contains("No need to change margin type") =>
            {
                info!(symbol, mode = %mode, "margin mode already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — market order. The quantity must already
    /// be truncated to the symbol's quantity digits.
    #[instrument(skip(self), name = "binance::market_order")]
    pub async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<OrderResult, BrokerError> {
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={qty}",
            side.as_str()
        );

        debug!(symbol, side = %side, %qty, "submitting market order");

        let body = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;

        let result = parse_order_result(&body)?;
        info!(
            symbol,
            side = %side,
            order_id = result.order_id,
            avg_price = result.avg_price.value(),
            executed_qty = %result.executed_qty,
            "market order executed"
        );
        Ok(result)
    }

    /// Close the full position on `symbol` with a market order in the
    /// opposite direction. Returns `None` when there is nothing to close.
    #[instrument(skip(self), name = "binance::close_position")]
    pub async fn close_position(&self, symbol: &str) -> Result<Option<OrderResult>, BrokerError> {
        let position = match self.get_position(symbol).await? {
            Some(p) => p,
            None => {
                debug!(symbol, "no position to close");
                return Ok(None);
            }
        };

        let result = self
            .market_order(symbol, position.side.exit_order_side(), position.qty)
            .await?;
        Ok(Some(result))
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines — the most recent `limit` candles, ascending by
    /// open time. The last element may be the currently forming bar.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self.public_request("/fapi/v1/klines", &params).await?;
        parse_klines(&body)
    }

    /// GET /fapi/v1/klines with an explicit time range, used by the bulk
    /// downloader to page through history.
    #[instrument(skip(self), name = "binance::get_klines_range")]
    pub async fn get_klines_range(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let params = format!(
            "symbol={symbol}&interval={interval}&startTime={start_ms}&endTime={end_ms}&limit={limit}"
        );
        let body = self.public_request("/fapi/v1/klines", &params).await?;
        parse_klines(&body)
    }

    /// GET /fapi/v1/ticker/price — latest traded price for `symbol`.
    #[instrument(skip(self), name = "binance::mark_price")]
    pub async fn mark_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let params = format!("symbol={symbol}");
        let body = self.public_request("/fapi/v1/ticker/price", &params).await?;
        parse_str_f64(&body["price"])
    }

    /// GET /fapi/v1/exchangeInfo — price/quantity digits and minimum notional
    /// for `symbol`. Responses are cached for the life of the client.
    #[instrument(skip(self), name = "binance::get_symbol_precision")]
    pub async fn get_symbol_precision(
        &self,
        symbol: &str,
    ) -> Result<SymbolPrecision, BrokerError> {
        if let Some(cached) = self.precision_cache.read().get(symbol) {
            return Ok(*cached);
        }

        let body = self.public_request("/fapi/v1/exchangeInfo", "").await?;
        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| BrokerError::Network("exchangeInfo missing symbols array".into()))?;

        let entry = symbols
            .iter()
            .find(|s| s["symbol"].as_str() == Some(symbol))
            .ok_or_else(|| BrokerError::Venue {
                code: 0,
                message: format!("symbol {symbol} not found in exchangeInfo"),
            })?;

        let precision = parse_precision(entry)?;
        self.precision_cache
            .write()
            .insert(symbol.to_string(), precision);
        debug!(symbol, ?precision, "symbol precision cached");
        Ok(precision)
    }

    /// GET /api/v3/ticker/24hr (spot, public) — the full 24-hour ticker list,
    /// consumed by the downloader for volume-ranked symbol selection.
    #[instrument(skip(self), name = "binance::ticker_24h")]
    pub async fn ticker_24h(&self) -> Result<Vec<Ticker24h>, BrokerError> {
        let url = format!("{}/api/v3/ticker/24hr", self.spot_url);
        let body = self.dispatch(Method::GET, url).await?;

        let entries = body
            .as_array()
            .ok_or_else(|| BrokerError::Network("24hr ticker response is not an array".into()))?;

        let mut tickers = Vec::with_capacity(entries.len());
        for entry in entries {
            let symbol = match entry["symbol"].as_str() {
                Some(s) => s.to_string(),
                None => continue,
            };
            // Skip entries with unparseable numerics instead of failing the
            // whole listing — the venue mixes delisted pairs into this feed.
            let (Ok(quote_volume), Ok(last_price), Ok(price_change_pct)) = (
                parse_str_f64(&entry["quoteVolume"]),
                parse_str_f64(&entry["lastPrice"]),
                parse_str_f64(&entry["priceChangePercent"]),
            ) else {
                continue;
            };
            tickers.push(Ticker24h {
                symbol,
                quote_volume,
                last_price,
                price_change_pct,
            });
        }

        debug!(count = tickers.len(), "24h tickers fetched");
        Ok(tickers)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64, BrokerError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| BrokerError::Network(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(BrokerError::Network(format!(
            "expected string or number, got: {val}"
        )))
    }
}

/// Parse a venue string field into a `Decimal` without a float round-trip.
fn parse_str_decimal(val: &serde_json::Value) -> Result<Decimal, BrokerError> {
    let s = val
        .as_str()
        .ok_or_else(|| BrokerError::Network(format!("expected string, got: {val}")))?;
    Decimal::from_str(s)
        .map_err(|_| BrokerError::Network(format!("failed to parse '{s}' as decimal")))
}

/// Parse one positionRisk entry. Zero-quantity entries map to `None`.
fn parse_position(entry: &serde_json::Value) -> Result<Option<Position>, BrokerError> {
    let amt = parse_str_decimal(&entry["positionAmt"])?;
    if amt.is_zero() {
        return Ok(None);
    }

    let side = if amt > Decimal::ZERO {
        PositionSide::Long
    } else {
        PositionSide::Short
    };

    let margin_mode = match entry["marginType"].as_str() {
        Some(m) if m.eq_ignore_ascii_case("isolated") => MarginMode::Isolated,
        _ => MarginMode::Crossed,
    };

    let leverage = entry["leverage"]
        .as_str()
        .and_then(|s| s.parse::<u32>().ok())
        .or_else(|| entry["leverage"].as_u64().map(|l| l as u32))
        .unwrap_or(1);

    Ok(Some(Position {
        symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
        side,
        qty: amt.abs(),
        entry_price: parse_str_f64(&entry["entryPrice"])?,
        unrealized_pnl: parse_str_decimal(&entry["unRealizedProfit"])?,
        leverage,
        margin_mode,
    }))
}

/// Parse an order response, resolving the average fill price.
///
/// The venue `avgPrice` field wins when non-zero; otherwise the price is
/// derived from the fills as sum(qty * price) / sum(qty). An order with no
/// resolvable price is surfaced as a reject, never as a zero price.
fn parse_order_result(body: &serde_json::Value) -> Result<OrderResult, BrokerError> {
    let order_id = body["orderId"]
        .as_i64()
        .ok_or_else(|| BrokerError::Network("order response missing orderId".into()))?;
    let status = body["status"].as_str().unwrap_or("").to_string();

    let reported = match body.get("avgPrice") {
        Some(v) => parse_str_f64(v).unwrap_or(0.0),
        None => 0.0,
    };

    let avg_price = if reported > 0.0 {
        ExecPrice::Reported(reported)
    } else {
        let mut total_qty = 0.0;
        let mut total_value = 0.0;
        if let Some(fills) = body["fills"].as_array() {
            for fill in fills {
                let qty = parse_str_f64(&fill["qty"])?;
                let price = parse_str_f64(&fill["price"])?;
                total_qty += qty;
                total_value += qty * price;
            }
        }
        if total_qty > 0.0 {
            ExecPrice::FillWeighted(total_value / total_qty)
        } else if status != "FILLED" {
            return Err(BrokerError::Rejected(format!(
                "order {order_id} not filled (status={status}, no fills reported)"
            )));
        } else {
            return Err(BrokerError::Rejected(format!(
                "order {order_id} reported FILLED but carries no fill price"
            )));
        }
    };

    let side = match body["side"].as_str() {
        Some("BUY") => OrderSide::Buy,
        Some("SELL") => OrderSide::Sell,
        other => {
            return Err(BrokerError::Network(format!(
                "order response has invalid side: {other:?}"
            )))
        }
    };

    Ok(OrderResult {
        order_id,
        symbol: body["symbol"].as_str().unwrap_or_default().to_string(),
        side,
        executed_qty: parse_str_decimal(&body["executedQty"])?,
        avg_price,
        status,
    })
}

/// Parse a kline response (array of positional arrays) into candles.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>, BrokerError> {
    let raw = body
        .as_array()
        .ok_or_else(|| BrokerError::Network("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = match entry.as_array() {
            Some(a) if a.len() >= 7 => a,
            _ => {
                warn!("skipping malformed kline entry");
                continue;
            }
        };

        candles.push(Candle {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
            close_time: arr[6].as_i64().unwrap_or(0),
        });
    }

    Ok(candles)
}

/// Extract precision settings from an exchangeInfo symbol entry.
fn parse_precision(entry: &serde_json::Value) -> Result<SymbolPrecision, BrokerError> {
    let price_digits = entry["pricePrecision"]
        .as_u64()
        .ok_or_else(|| BrokerError::Network("exchangeInfo missing pricePrecision".into()))?
        as u32;
    let qty_digits = entry["quantityPrecision"]
        .as_u64()
        .ok_or_else(|| BrokerError::Network("exchangeInfo missing quantityPrecision".into()))?
        as u32;

    let mut min_notional = Decimal::ZERO;
    if let Some(filters) = entry["filters"].as_array() {
        for filter in filters {
            if filter["filterType"].as_str() == Some("MIN_NOTIONAL") {
                if let Ok(n) = parse_str_decimal(&filter["notional"]) {
                    min_notional = n;
                }
            }
        }
    }

    Ok(SymbolPrecision {
        price_digits,
        qty_digits,
        min_notional,
    })
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Signature test vector from the Binance API documentation.
    #[test]
    fn hmac_signature_matches_reference_vector() {
        let client = FuturesClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn parse_klines_from_venue_shape() {
        let body = json!([
            [1625097600000i64, "33500.0", "34000.0", "33200.0", "33800.0", "1200.5", 1625111999999i64, "0", 0, "0", "0", "0"],
            [1625112000000i64, "33800.0", "34100.0", "33700.0", "34000.0", "900.2", 1625126399999i64, "0", 0, "0", "0", "0"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 1625097600000);
        assert_eq!(candles[0].high, 34000.0);
        assert_eq!(candles[1].close, 34000.0);
        assert!(candles[0].open_time < candles[1].open_time);
    }

    #[test]
    fn parse_klines_skips_malformed_entries() {
        let body = json!([
            [1625097600000i64, "1.0", "2.0", "0.5", "1.5", "10", 1625111999999i64],
            [1625112000000i64, "1.5"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn order_result_prefers_reported_avg_price() {
        let body = json!({
            "orderId": 42,
            "symbol": "BTCUSDT",
            "side": "BUY",
            "origQty": "0.010",
            "executedQty": "0.010",
            "avgPrice": "30250.50",
            "status": "FILLED",
            "fills": [{"qty": "0.010", "price": "99999.0"}]
        });
        let result = parse_order_result(&body).unwrap();
        assert_eq!(result.avg_price, ExecPrice::Reported(30250.50));
        assert_eq!(result.executed_qty, Decimal::from_str("0.010").unwrap());
    }

    #[test]
    fn order_result_falls_back_to_fill_weighted_price() {
        let body = json!({
            "orderId": 43,
            "symbol": "BTCUSDT",
            "side": "SELL",
            "origQty": "0.030",
            "executedQty": "0.030",
            "avgPrice": "0.00",
            "status": "FILLED",
            "fills": [
                {"qty": "0.010", "price": "30000.0"},
                {"qty": "0.020", "price": "30300.0"}
            ]
        });
        let result = parse_order_result(&body).unwrap();
        match result.avg_price {
            ExecPrice::FillWeighted(p) => assert!((p - 30200.0).abs() < 1e-9),
            other => panic!("expected FillWeighted, got {other:?}"),
        }
    }

    #[test]
    fn order_without_fills_and_not_filled_is_reject() {
        let body = json!({
            "orderId": 44,
            "symbol": "BTCUSDT",
            "side": "BUY",
            "origQty": "0.010",
            "executedQty": "0.000",
            "avgPrice": "0.00",
            "status": "EXPIRED",
            "fills": []
        });
        assert!(matches!(
            parse_order_result(&body),
            Err(BrokerError::Rejected(_))
        ));
    }

    #[test]
    fn position_parsing_maps_sign_to_side() {
        let long = json!({
            "symbol": "BTCUSDT",
            "positionAmt": "0.010",
            "entryPrice": "30000.0",
            "unRealizedProfit": "12.50",
            "leverage": "7",
            "marginType": "isolated"
        });
        let pos = parse_position(&long).unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.qty, Decimal::from_str("0.010").unwrap());
        assert_eq!(pos.leverage, 7);
        assert_eq!(pos.margin_mode, MarginMode::Isolated);

        let short = json!({
            "symbol": "ETHUSDT",
            "positionAmt": "-1.5",
            "entryPrice": "2000.0",
            "unRealizedProfit": "-3.25",
            "leverage": "5",
            "marginType": "cross"
        });
        let pos = parse_position(&short).unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.qty, Decimal::from_str("1.5").unwrap());
        assert_eq!(pos.margin_mode, MarginMode::Crossed);
    }

    #[test]
    fn zero_position_is_none() {
        let flat = json!({
            "symbol": "BTCUSDT",
            "positionAmt": "0.000",
            "entryPrice": "0.0",
            "unRealizedProfit": "0.0",
            "leverage": "7",
            "marginType": "isolated"
        });
        assert!(parse_position(&flat).unwrap().is_none());
    }

    #[test]
    fn precision_extracted_with_min_notional_filter() {
        let entry = json!({
            "symbol": "BTCUSDT",
            "pricePrecision": 2,
            "quantityPrecision": 3,
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                {"filterType": "MIN_NOTIONAL", "notional": "5"}
            ]
        });
        let p = parse_precision(&entry).unwrap();
        assert_eq!(p.price_digits, 2);
        assert_eq!(p.qty_digits, 3);
        assert_eq!(p.min_notional, Decimal::from(5));
    }

    #[test]
    fn precision_without_notional_filter_defaults_to_zero() {
        let entry = json!({
            "symbol": "XRPUSDT",
            "pricePrecision": 4,
            "quantityPrecision": 1,
            "filters": []
        });
        let p = parse_precision(&entry).unwrap();
        assert_eq!(p.min_notional, Decimal::ZERO);
    }
}
