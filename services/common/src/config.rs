//! Exchange endpoint configuration

use serde::{Deserialize, Serialize};

/// Exchange endpoints used by the streaming client and the REST client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeEndpoints {
    /// Combined-stream websocket base, e.g. `wss://fstream.binance.com/stream`
    pub ws_url: String,
    /// REST base URL, e.g. `https://fapi.binance.com`
    pub rest_url: String,
    /// Whether the endpoints point at the exchange testnet
    pub testnet: bool,
}

impl ExchangeEndpoints {
    /// Futures mainnet endpoints
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            ws_url: "wss://fstream.binance.com/stream".to_string(),
            rest_url: "https://fapi.binance.com".to_string(),
            testnet: false,
        }
    }

    /// Futures testnet endpoints
    #[must_use]
    pub fn testnet() -> Self {
        Self {
            ws_url: "wss://stream.binancefuture.com/stream".to_string(),
            rest_url: "https://testnet.binancefuture.com".to_string(),
            testnet: true,
        }
    }
}

impl Default for ExchangeEndpoints {
    fn default() -> Self {
        Self::testnet()
    }
}

/// API credentials for signed REST requests
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Credentials {
    /// API key sent in the `X-MBX-APIKEY` header
    pub api_key: String,
    /// Secret used to sign query strings
    pub api_secret: String,
}

impl Credentials {
    /// Both key and secret are present
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("api_secret", &"<redacted>")
            .finish()
    }
}
