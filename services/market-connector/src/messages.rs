//! Stream names and wire messages
//!
//! Channels are addressed as `<symbol>@<kind>` (e.g. `btcusdt@depth@100ms`)
//! on a combined stream, where every data frame arrives wrapped as
//! `{"stream": "...", "data": {...}}`. Raw payloads carry prices and
//! quantities as decimal strings; they are decoded once here into the typed
//! [`MarketEvent`] handed to handlers.

use crate::error::{StreamError, StreamResult};
use crate::orderbook::{DepthDiff, DepthSnapshot, PriceLevel};
use serde::{Deserialize, Serialize};
use services_common::Side;
use std::fmt;
use std::str::FromStr;

/// Kind of logical channel on the combined stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKind {
    /// Individual trades
    Trade,
    /// Aggregated trades
    AggTrade,
    /// Incremental depth diffs (100ms)
    DepthDiff,
    /// Top-N partial book
    PartialDepth {
        /// Levels per side (5, 10 or 20)
        levels: u16,
    },
    /// Rolling 24h ticker
    Ticker,
    /// Best bid/ask updates
    BookTicker,
    /// Candlesticks
    Kline {
        /// Interval such as `1m` or `4h`
        interval: String,
    },
    /// Mark price and funding rate
    MarkPrice,
    /// Liquidation orders
    ForceOrder,
}

impl StreamKind {
    /// Suffix after the `@` in the stream name
    #[must_use]
    pub fn suffix(&self) -> String {
        match self {
            Self::Trade => "trade".to_string(),
            Self::AggTrade => "aggTrade".to_string(),
            Self::DepthDiff => "depth@100ms".to_string(),
            Self::PartialDepth { levels } => format!("depth{levels}@100ms"),
            Self::Ticker => "ticker".to_string(),
            Self::BookTicker => "bookTicker".to_string(),
            Self::Kline { interval } => format!("kline_{interval}"),
            Self::MarkPrice => "markPrice@1s".to_string(),
            Self::ForceOrder => "forceOrder".to_string(),
        }
    }

    fn parse(suffix: &str) -> Option<Self> {
        // Update speed modifiers do not change the payload shape
        let base = suffix.split('@').next().unwrap_or(suffix);
        match base {
            "trade" => Some(Self::Trade),
            "aggTrade" => Some(Self::AggTrade),
            "depth" => Some(Self::DepthDiff),
            "ticker" => Some(Self::Ticker),
            "bookTicker" => Some(Self::BookTicker),
            "markPrice" => Some(Self::MarkPrice),
            "forceOrder" => Some(Self::ForceOrder),
            other => {
                if let Some(interval) = other.strip_prefix("kline_") {
                    return (!interval.is_empty()).then(|| Self::Kline {
                        interval: interval.to_string(),
                    });
                }
                other
                    .strip_prefix("depth")
                    .and_then(|n| n.parse::<u16>().ok())
                    .map(|levels| Self::PartialDepth { levels })
            }
        }
    }
}

/// Fully qualified channel name, e.g. `btcusdt@trade`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName {
    symbol: String,
    kind: StreamKind,
}

impl StreamName {
    /// Channel for `symbol` (any case) and `kind`
    #[must_use]
    pub fn new(symbol: &str, kind: StreamKind) -> Self {
        Self {
            symbol: symbol.trim().to_ascii_lowercase(),
            kind,
        }
    }

    /// Lower-case symbol as used on the wire
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Channel kind
    #[must_use]
    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.kind.suffix())
    }
}

impl FromStr for StreamName {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, suffix) = s
            .split_once('@')
            .ok_or_else(|| StreamError::protocol(format!("stream name without '@': {s}")))?;
        if symbol.is_empty() {
            return Err(StreamError::protocol(format!("stream name without symbol: {s}")));
        }
        let kind = StreamKind::parse(suffix)
            .ok_or_else(|| StreamError::protocol(format!("unknown stream kind: {s}")))?;
        Ok(Self::new(symbol, kind))
    }
}

/// Subscription control method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMethod {
    /// Start receiving the listed channels
    Subscribe,
    /// Stop receiving the listed channels
    Unsubscribe,
}

/// Multiplexed control request sent over the stream
#[derive(Debug, Clone, Serialize)]
pub struct ControlRequest {
    /// Requested operation
    pub method: ControlMethod,
    /// Channel names
    pub params: Vec<String>,
    /// Request id, echoed back in the acknowledgement
    pub id: u64,
}

impl ControlRequest {
    /// Encode as a text frame payload
    pub fn to_text(&self) -> StreamResult<String> {
        serde_json::to_string(self).map_err(StreamError::protocol)
    }
}

/// Classified inbound text frame
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Payload for a channel
    Data {
        /// Channel the payload belongs to
        stream: StreamName,
        /// Raw payload
        data: serde_json::Value,
    },
    /// Acknowledgement of a control request
    Ack {
        /// Echoed request id
        id: u64,
    },
    /// Error pushed by the exchange
    Error {
        /// Provider code, 0 when absent
        code: i64,
        /// Provider message
        message: String,
    },
}

/// Classify a text frame without decoding the payload
pub fn classify(text: &str) -> StreamResult<Inbound> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(StreamError::protocol)?;
    let obj = value
        .as_object()
        .ok_or_else(|| StreamError::protocol("frame is not a JSON object"))?;

    if let Some(err) = obj.get("error") {
        let code = err.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0);
        let message = err
            .get("msg")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Ok(Inbound::Error { code, message });
    }

    if let (Some(stream), Some(data)) = (obj.get("stream"), obj.get("data")) {
        let name = stream
            .as_str()
            .ok_or_else(|| StreamError::protocol("stream field is not a string"))?;
        return Ok(Inbound::Data {
            stream: name.parse()?,
            data: data.clone(),
        });
    }

    if obj.contains_key("result") {
        if let Some(id) = obj.get("id").and_then(serde_json::Value::as_u64) {
            return Ok(Inbound::Ack { id });
        }
    }

    Err(StreamError::protocol(format!("unrecognised frame: {text}")))
}

#[derive(Debug, Deserialize)]
struct TradePayload {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t", alias = "a")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct DepthPayload {
    #[serde(rename = "E", default)]
    event_time: u64,
    #[serde(rename = "s", default)]
    symbol: String,
    #[serde(rename = "U", default)]
    first_update_id: u64,
    #[serde(rename = "u", alias = "lastUpdateId")]
    final_update_id: u64,
    #[serde(rename = "b", alias = "bids")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a", alias = "asks")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct TickerPayload {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "P")]
    price_change_percent: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "h")]
    high_price: String,
    #[serde(rename = "l")]
    low_price: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
struct BookTickerPayload {
    #[serde(rename = "E", default)]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "B")]
    bid_qty: String,
    #[serde(rename = "a")]
    ask_price: String,
    #[serde(rename = "A")]
    ask_qty: String,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlineBody,
}

#[derive(Debug, Deserialize)]
struct KlineBody {
    #[serde(rename = "t")]
    open_time: u64,
    #[serde(rename = "T")]
    close_time: u64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct MarkPricePayload {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
    #[serde(rename = "r", default)]
    funding_rate: String,
    #[serde(rename = "T", default)]
    next_funding_time: u64,
}

#[derive(Debug, Deserialize)]
struct ForceOrderPayload {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "o")]
    order: ForceOrderBody,
}

#[derive(Debug, Deserialize)]
struct ForceOrderBody {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "ap")]
    average_price: String,
}

/// Executed trade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    /// Upper-case symbol
    pub symbol: String,
    /// Exchange trade id
    pub trade_id: u64,
    /// Execution price
    pub price: f64,
    /// Executed quantity
    pub quantity: f64,
    /// True when the buyer was the maker (taker sold)
    pub buyer_is_maker: bool,
    /// Event time in milliseconds
    pub event_time: u64,
}

/// Rolling 24h ticker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticker24h {
    /// Upper-case symbol
    pub symbol: String,
    /// Last traded price
    pub last_price: f64,
    /// Price change over 24h in percent
    pub price_change_percent: f64,
    /// 24h high
    pub high: f64,
    /// 24h low
    pub low: f64,
    /// 24h base asset volume
    pub volume: f64,
    /// 24h quote asset volume
    pub quote_volume: f64,
    /// Event time in milliseconds
    pub event_time: u64,
}

/// Best bid and ask
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookTicker {
    /// Upper-case symbol
    pub symbol: String,
    /// Best bid price
    pub bid_price: f64,
    /// Quantity at best bid
    pub bid_qty: f64,
    /// Best ask price
    pub ask_price: f64,
    /// Quantity at best ask
    pub ask_qty: f64,
    /// Event time in milliseconds, 0 when not provided
    pub event_time: u64,
}

/// Candlestick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kline {
    /// Upper-case symbol
    pub symbol: String,
    /// Interval such as `1m`
    pub interval: String,
    /// Open time in milliseconds
    pub open_time: u64,
    /// Close time in milliseconds
    pub close_time: u64,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Base asset volume
    pub volume: f64,
    /// Whether the candle is final
    pub closed: bool,
    /// Event time in milliseconds
    pub event_time: u64,
}

/// Mark price and funding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkPrice {
    /// Upper-case symbol
    pub symbol: String,
    /// Mark price
    pub mark_price: f64,
    /// Current funding rate (fraction)
    pub funding_rate: f64,
    /// Next funding time in milliseconds
    pub next_funding_time: u64,
    /// Event time in milliseconds
    pub event_time: u64,
}

/// Forced liquidation order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Liquidation {
    /// Upper-case symbol
    pub symbol: String,
    /// Side of the liquidation order
    pub side: Side,
    /// Liquidated quantity
    pub quantity: f64,
    /// Average fill price
    pub average_price: f64,
    /// Event time in milliseconds
    pub event_time: u64,
}

/// Decoded channel payload handed to handlers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarketEvent {
    /// Trade or aggregated trade
    Trade(Trade),
    /// Incremental depth diff
    Depth(DepthDiff),
    /// Top-N book
    PartialDepth(DepthSnapshot),
    /// 24h ticker
    Ticker(Ticker24h),
    /// Best bid/ask
    BookTicker(BookTicker),
    /// Candlestick
    Kline(Kline),
    /// Mark price and funding rate
    MarkPrice(MarkPrice),
    /// Liquidation order
    Liquidation(Liquidation),
}

impl MarketEvent {
    /// Upper-case symbol the event refers to
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade(t) => &t.symbol,
            Self::Depth(d) => &d.symbol,
            Self::PartialDepth(d) => &d.symbol,
            Self::Ticker(t) => &t.symbol,
            Self::BookTicker(b) => &b.symbol,
            Self::Kline(k) => &k.symbol,
            Self::MarkPrice(m) => &m.symbol,
            Self::Liquidation(l) => &l.symbol,
        }
    }

    /// Exchange event time in milliseconds, when the payload carries one
    #[must_use]
    pub fn event_time(&self) -> Option<u64> {
        let ts = match self {
            Self::Trade(t) => t.event_time,
            Self::Depth(d) => d.event_time,
            Self::PartialDepth(d) => d.event_time,
            Self::Ticker(t) => t.event_time,
            Self::BookTicker(b) => b.event_time,
            Self::Kline(k) => k.event_time,
            Self::MarkPrice(m) => m.event_time,
            Self::Liquidation(l) => l.event_time,
        };
        (ts > 0).then_some(ts)
    }
}

fn decimal(field: &str, raw: &str) -> StreamResult<f64> {
    let value = raw
        .parse::<f64>()
        .map_err(|_| StreamError::protocol(format!("invalid decimal in {field}: {raw:?}")))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(StreamError::protocol(format!("non-finite decimal in {field}")))
    }
}

fn optional_decimal(field: &str, raw: &str) -> StreamResult<f64> {
    if raw.is_empty() { Ok(0.0) } else { decimal(field, raw) }
}

fn levels(raw: &[[String; 2]]) -> StreamResult<Vec<PriceLevel>> {
    raw.iter()
        .map(|[p, q]| {
            Ok(PriceLevel {
                price: decimal("price", p)?,
                quantity: decimal("quantity", q)?,
            })
        })
        .collect()
}

fn payload<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> StreamResult<T> {
    serde_json::from_value(data).map_err(StreamError::protocol)
}

/// Decode a channel payload according to the channel kind
pub fn decode(stream: &StreamName, data: serde_json::Value) -> StreamResult<MarketEvent> {
    let fallback_symbol = stream.symbol().to_ascii_uppercase();
    let event = match stream.kind() {
        StreamKind::Trade | StreamKind::AggTrade => {
            let p: TradePayload = payload(data)?;
            MarketEvent::Trade(Trade {
                symbol: p.symbol,
                trade_id: p.trade_id,
                price: decimal("p", &p.price)?,
                quantity: decimal("q", &p.quantity)?,
                buyer_is_maker: p.buyer_is_maker,
                event_time: p.event_time,
            })
        }
        StreamKind::DepthDiff => {
            let p: DepthPayload = payload(data)?;
            let first = if p.first_update_id == 0 { p.final_update_id } else { p.first_update_id };
            MarketEvent::Depth(DepthDiff {
                symbol: if p.symbol.is_empty() { fallback_symbol } else { p.symbol },
                first_update_id: first,
                final_update_id: p.final_update_id,
                bids: levels(&p.bids)?,
                asks: levels(&p.asks)?,
                event_time: p.event_time,
            })
        }
        StreamKind::PartialDepth { .. } => {
            let p: DepthPayload = payload(data)?;
            MarketEvent::PartialDepth(DepthSnapshot {
                symbol: if p.symbol.is_empty() { fallback_symbol } else { p.symbol },
                last_update_id: p.final_update_id,
                bids: levels(&p.bids)?,
                asks: levels(&p.asks)?,
                event_time: p.event_time,
            })
        }
        StreamKind::Ticker => {
            let p: TickerPayload = payload(data)?;
            MarketEvent::Ticker(Ticker24h {
                symbol: p.symbol,
                last_price: decimal("c", &p.last_price)?,
                price_change_percent: decimal("P", &p.price_change_percent)?,
                high: decimal("h", &p.high_price)?,
                low: decimal("l", &p.low_price)?,
                volume: decimal("v", &p.volume)?,
                quote_volume: decimal("q", &p.quote_volume)?,
                event_time: p.event_time,
            })
        }
        StreamKind::BookTicker => {
            let p: BookTickerPayload = payload(data)?;
            MarketEvent::BookTicker(BookTicker {
                symbol: p.symbol,
                bid_price: decimal("b", &p.bid_price)?,
                bid_qty: decimal("B", &p.bid_qty)?,
                ask_price: decimal("a", &p.ask_price)?,
                ask_qty: decimal("A", &p.ask_qty)?,
                event_time: p.event_time,
            })
        }
        StreamKind::Kline { .. } => {
            let p: KlinePayload = payload(data)?;
            let k = p.kline;
            MarketEvent::Kline(Kline {
                symbol: p.symbol,
                interval: k.interval,
                open_time: k.open_time,
                close_time: k.close_time,
                open: decimal("o", &k.open)?,
                high: decimal("h", &k.high)?,
                low: decimal("l", &k.low)?,
                close: decimal("c", &k.close)?,
                volume: decimal("v", &k.volume)?,
                closed: k.closed,
                event_time: p.event_time,
            })
        }
        StreamKind::MarkPrice => {
            let p: MarkPricePayload = payload(data)?;
            MarketEvent::MarkPrice(MarkPrice {
                symbol: p.symbol,
                mark_price: decimal("p", &p.mark_price)?,
                funding_rate: optional_decimal("r", &p.funding_rate)?,
                next_funding_time: p.next_funding_time,
                event_time: p.event_time,
            })
        }
        StreamKind::ForceOrder => {
            let p: ForceOrderPayload = payload(data)?;
            let side = match p.order.side.as_str() {
                "BUY" => Side::Buy,
                "SELL" => Side::Sell,
                other => return Err(StreamError::protocol(format!("unknown side {other}"))),
            };
            MarketEvent::Liquidation(Liquidation {
                symbol: p.order.symbol,
                side,
                quantity: decimal("q", &p.order.quantity)?,
                average_price: decimal("ap", &p.order.average_price)?,
                event_time: p.event_time,
            })
        }
    };
    Ok(event)
}
