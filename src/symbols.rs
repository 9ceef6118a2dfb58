// =============================================================================
// Symbol Classifier — equity / crypto / fx normalization and channel mapping
// =============================================================================
//
// Everything the rest of the engine needs to know about a symbol is a pure
// function of its text: asset kind, provider ticker, subscription channels,
// and which upstream endpoint serves it.
// =============================================================================

use serde::Serialize;

/// Upstream WebSocket endpoints, one per asset class.
pub const WS_URL_STOCKS: &str = "wss://socket.polygon.io/stocks";
pub const WS_URL_CRYPTO: &str = "wss://socket.polygon.io/crypto";
pub const WS_URL_FOREX: &str = "wss://socket.polygon.io/forex";

/// Crypto base currencies the provider lists (base without the quote).
const CRYPTO_BASES: &[&str] = &[
    "BTC", "ETH", "SOL", "BNB", "XRP", "ADA", "AVAX", "DOGE", "DOT", "MATIC",
    "LINK", "LTC", "SHIB", "UNI", "ATOM", "XLM", "ETC", "ALGO", "VET", "ICP",
    "FIL", "AAVE", "SAND", "MANA", "AXS", "APT", "OP", "ARB", "SUI", "INJ",
];

/// Quote currencies accepted for crypto pairs.
const CRYPTO_QUOTES: &[&str] = &["USD", "USDT", "EUR", "GBP", "JPY"];

/// Fx base currencies plus spot metals.
const FOREX_BASES: &[&str] = &[
    "EUR", "GBP", "AUD", "NZD", "USD", "CAD", "CHF", "JPY", "MXN", "BRL",
    "CLP", "COP", "ARS", "XAU", "XAG", "XPT",
];

const FOREX_QUOTES: &[&str] = &[
    "EUR", "GBP", "AUD", "NZD", "USD", "CAD", "CHF", "JPY", "MXN", "BRL",
    "CLP", "COP", "ARS",
];

// =============================================================================
// AssetKind
// =============================================================================

/// Asset class of a symbol. Drives channel strings, ticker prefixes, and
/// which upstream endpoint the symbol is streamed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssetKind {
    Equity,
    Crypto,
    Forex,
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "equity"),
            Self::Crypto => write!(f, "crypto"),
            Self::Forex => write!(f, "fx"),
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Normalize any accepted form to the internal symbol: uppercase, no
/// provider prefix, no separator.
///
/// `"X:BTC-USD"` → `"BTCUSD"`, `"c:eurusd"` → `"EURUSD"`, `"aapl"` → `"AAPL"`.
pub fn normalize(symbol: &str) -> String {
    let mut s = symbol.trim().to_uppercase();
    if let Some(rest) = s.strip_prefix("X:").or_else(|| s.strip_prefix("C:")) {
        s = rest.to_string();
    }
    s.replace('-', "")
}

/// Classify a symbol. `X:` / `C:` prefixes force crypto / fx; otherwise the
/// base+quote catalogs decide, crypto winning over fx for overlapping pairs.
pub fn classify(symbol: &str) -> AssetKind {
    let raw = symbol.trim().to_uppercase();
    if raw.starts_with("X:") {
        return AssetKind::Crypto;
    }
    if raw.starts_with("C:") {
        return AssetKind::Forex;
    }

    let clean = normalize(symbol);
    if is_crypto_pair(&clean) {
        return AssetKind::Crypto;
    }
    if is_forex_pair(&clean) {
        return AssetKind::Forex;
    }
    AssetKind::Equity
}

fn is_crypto_pair(clean: &str) -> bool {
    CRYPTO_BASES.iter().any(|base| {
        clean
            .strip_prefix(base)
            .is_some_and(|quote| CRYPTO_QUOTES.contains(&quote))
    })
}

fn is_forex_pair(clean: &str) -> bool {
    if clean.len() != 6 {
        return false;
    }
    let (base, quote) = clean.split_at(3);
    FOREX_BASES.contains(&base) && FOREX_QUOTES.contains(&quote)
}

// =============================================================================
// Provider mappings
// =============================================================================

/// Ticker in the provider's wire form: `X:` for crypto, `C:` for fx,
/// bare for equities.
pub fn provider_ticker(symbol: &str) -> String {
    let clean = normalize(symbol);
    match classify(&clean) {
        AssetKind::Crypto => format!("X:{clean}"),
        AssetKind::Forex => format!("C:{clean}"),
        AssetKind::Equity => clean,
    }
}

/// Trade-channel subscription string for one symbol.
pub fn trade_channel(symbol: &str) -> String {
    let clean = normalize(symbol);
    match classify(&clean) {
        AssetKind::Crypto => format!("XT.X:{clean}"),
        AssetKind::Forex => format!("CA.C:{clean}"),
        AssetKind::Equity => format!("T.{clean}"),
    }
}

/// Quote-channel subscription string for one symbol.
pub fn quote_channel(symbol: &str) -> String {
    let clean = normalize(symbol);
    match classify(&clean) {
        AssetKind::Crypto => format!("XQ.X:{clean}"),
        AssetKind::Forex => format!("C.C:{clean}"),
        AssetKind::Equity => format!("Q.{clean}"),
    }
}

/// WebSocket endpoint URL for a symbol's asset class.
pub fn ws_url(symbol: &str) -> &'static str {
    match classify(symbol) {
        AssetKind::Crypto => WS_URL_CRYPTO,
        AssetKind::Forex => WS_URL_FOREX,
        AssetKind::Equity => WS_URL_STOCKS,
    }
}

/// Human-readable label for the frontend: `"BTCUSD"` → `"BTC/USD"`.
/// Equities and fx are shown as-is.
pub fn display_label(symbol: &str) -> String {
    let clean = normalize(symbol);
    if classify(&clean) == AssetKind::Crypto {
        // Longest matching base wins so SHIB does not split as SHI|B...
        let mut bases: Vec<&str> = CRYPTO_BASES.to_vec();
        bases.sort_by_key(|b| std::cmp::Reverse(b.len()));
        for base in bases {
            if let Some(quote) = clean.strip_prefix(base) {
                if !quote.is_empty() {
                    return format!("{base}/{quote}");
                }
            }
        }
    }
    clean
}

/// Split a configured symbol list into (equities, cryptos, fx), all
/// normalized. Order within each group is preserved.
pub fn partition(symbols: &[String]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut equities = Vec::new();
    let mut cryptos = Vec::new();
    let mut forex = Vec::new();
    for s in symbols {
        let clean = normalize(s);
        match classify(&clean) {
            AssetKind::Equity => equities.push(clean),
            AssetKind::Crypto => cryptos.push(clean),
            AssetKind::Forex => forex.push(clean),
        }
    }
    (equities, cryptos, forex)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_basic_forms() {
        assert_eq!(classify("AAPL"), AssetKind::Equity);
        assert_eq!(classify("TSLA"), AssetKind::Equity);
        assert_eq!(classify("BTCUSD"), AssetKind::Crypto);
        assert_eq!(classify("ETHUSDT"), AssetKind::Crypto);
        assert_eq!(classify("EURUSD"), AssetKind::Forex);
        assert_eq!(classify("XAUUSD"), AssetKind::Forex);
    }

    #[test]
    fn prefixes_force_kind() {
        assert_eq!(classify("X:BTCUSD"), AssetKind::Crypto);
        assert_eq!(classify("C:EURUSD"), AssetKind::Forex);
    }

    #[test]
    fn dashed_and_lowercase_input() {
        assert_eq!(classify("btc-usd"), AssetKind::Crypto);
        assert_eq!(normalize("X:BTC-USD"), "BTCUSD");
        assert_eq!(normalize(" aapl "), "AAPL");
    }

    #[test]
    fn crypto_wins_over_forex_overlap() {
        // XRPJPY-style pairs could parse as 6-letter fx; the crypto catalog
        // must take precedence.
        assert_eq!(classify("XRPJPY"), AssetKind::Crypto);
    }

    #[test]
    fn provider_ticker_prefixes() {
        assert_eq!(provider_ticker("BTCUSD"), "X:BTCUSD");
        assert_eq!(provider_ticker("EURUSD"), "C:EURUSD");
        assert_eq!(provider_ticker("AAPL"), "AAPL");
        assert_eq!(provider_ticker("X:BTCUSD"), "X:BTCUSD");
    }

    #[test]
    fn channel_strings() {
        assert_eq!(trade_channel("AAPL"), "T.AAPL");
        assert_eq!(quote_channel("AAPL"), "Q.AAPL");
        assert_eq!(trade_channel("BTCUSD"), "XT.X:BTCUSD");
        assert_eq!(quote_channel("BTCUSD"), "XQ.X:BTCUSD");
        assert_eq!(quote_channel("EURUSD"), "C.C:EURUSD");
        assert_eq!(trade_channel("EURUSD"), "CA.C:EURUSD");
    }

    #[test]
    fn ws_url_per_kind() {
        assert_eq!(ws_url("AAPL"), WS_URL_STOCKS);
        assert_eq!(ws_url("BTCUSD"), WS_URL_CRYPTO);
        assert_eq!(ws_url("EURUSD"), WS_URL_FOREX);
    }

    #[test]
    fn display_labels() {
        assert_eq!(display_label("BTCUSD"), "BTC/USD");
        assert_eq!(display_label("SHIBUSDT"), "SHIB/USDT");
        assert_eq!(display_label("AAPL"), "AAPL");
    }

    #[test]
    fn partition_groups() {
        let symbols = vec![
            "AAPL".to_string(),
            "BTCUSD".to_string(),
            "TSLA".to_string(),
            "EURUSD".to_string(),
        ];
        let (equities, cryptos, forex) = partition(&symbols);
        assert_eq!(equities, vec!["AAPL", "TSLA"]);
        assert_eq!(cryptos, vec!["BTCUSD"]);
        assert_eq!(forex, vec!["EURUSD"]);
    }
}
