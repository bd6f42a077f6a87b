//! Error types for the streaming client and order book

use thiserror::Error;

/// Errors raised by the stream connection and its transport
#[derive(Error, Debug)]
pub enum StreamError {
    /// Transport level failure (connect, send or receive)
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure reported by the transport
        message: String,
    },

    /// Malformed or unexpected message
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was wrong with the message
        message: String,
    },

    /// Exchange pushed an error payload on the stream
    #[error("Exchange stream error {code}: {message}")]
    Exchange {
        /// Provider error code, 0 when absent
        code: i64,
        /// Provider error message
        message: String,
    },

    /// Remote side closed the connection
    #[error("Connection closed by remote")]
    ConnectionClosed,

    /// No session is open
    #[error("Not connected")]
    NotConnected,

    /// Heartbeat could not be delivered
    #[error("Heartbeat failed: {message}")]
    Heartbeat {
        /// Underlying send failure
        message: String,
    },

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of reconnect attempts made
        attempts: u32,
    },

    /// Order book snapshot could not be fetched
    #[error("Snapshot request for {symbol} failed: {message}")]
    Snapshot {
        /// Symbol whose snapshot was requested
        symbol: String,
        /// Failure details
        message: String,
    },
}

impl StreamError {
    /// Build a transport error from any displayable failure
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    /// Build a protocol error from any displayable failure
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

/// Order book errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookError {
    /// Book is stale and needs a fresh snapshot before it can be read
    #[error("Order book for {symbol} is stale")]
    StaleBook {
        /// Symbol of the stale book
        symbol: String,
    },

    /// Diff did not continue the sequence
    #[error("Sequence gap on {symbol}: expected {expected}, received {received}")]
    SequenceGap {
        /// Symbol of the book
        symbol: String,
        /// Next update id the book expected
        expected: u64,
        /// First update id of the offending diff
        received: u64,
    },

    /// Best bid reached or crossed best ask
    #[error("Crossed book on {symbol}: bid {bid} >= ask {ask}")]
    CrossedBook {
        /// Symbol of the book
        symbol: String,
        /// Best bid price
        bid: f64,
        /// Best ask price
        ask: f64,
    },

    /// Level with a non-finite or negative price or quantity
    #[error("Invalid price level {price} x {quantity}")]
    InvalidLevel {
        /// Offending price
        price: f64,
        /// Offending quantity
        quantity: f64,
    },

    /// Requested quantity was not positive
    #[error("Invalid impact quantity: {quantity}")]
    InvalidQuantity {
        /// Offending quantity
        quantity: f64,
    },

    /// No book is tracked for the symbol
    #[error("No order book for {symbol}")]
    UnknownSymbol {
        /// Requested symbol
        symbol: String,
    },
}

/// Type alias for stream results
pub type StreamResult<T> = Result<T, StreamError>;

/// Type alias for order book results
pub type BookResult<T> = Result<T, BookError>;
