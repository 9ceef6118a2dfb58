// =============================================================================
// Settings — environment-file backed configuration
// =============================================================================
//
// `dotenv` loads the `.env` file (key=value lines, `#` comments, quoted
// values) into the process environment at startup; `Settings` then builds a
// typed view with defaults. The API key is the only required option.
// =============================================================================

use anyhow::{bail, Result};

/// Default port for the tick (chart) WebSocket server.
const DEFAULT_CHART_PORT: u16 = 8765;
/// Default port for the order-book WebSocket server.
const DEFAULT_ORDERBOOK_PORT: u16 = 8766;
/// Symbols monitored when SIMBOLOS is not set.
const DEFAULT_SYMBOLS: &str = "AAPL,TSLA";

/// Typed configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Provider API key (required).
    pub api_key: String,
    /// Symbols to monitor, uppercased, in configured order.
    pub symbols: Vec<String>,
    /// Local port for the tick fan-out server.
    pub chart_port: u16,
    /// Local port for the book fan-out server.
    pub orderbook_port: u16,
}

impl Settings {
    /// Build settings from the process environment. Call after
    /// `dotenv::dotenv()` so `.env` values are visible.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary lookup. Separated from the process
    /// environment so tests can feed a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("POLYGON_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("POLYGON_API_KEY is not set — create a .env file or export it");
        }

        let symbols_raw = lookup("SIMBOLOS").unwrap_or_else(|| DEFAULT_SYMBOLS.to_string());
        let symbols: Vec<String> = symbols_raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            bail!("SIMBOLOS resolved to an empty symbol list");
        }

        let chart_port = parse_port(lookup("CHART_PORT"), DEFAULT_CHART_PORT)?;
        let orderbook_port = parse_port(lookup("ORDERBOOK_PORT"), DEFAULT_ORDERBOOK_PORT)?;

        Ok(Self {
            api_key,
            symbols,
            chart_port,
            orderbook_port,
        })
    }

    /// Short summary safe to log: the key is shown truncated.
    pub fn summary(&self) -> String {
        let key_preview: String = self.api_key.chars().take(8).collect();
        format!(
            "api_key={key_preview}... symbols={} ports={}/{}",
            self.symbols.join(","),
            self.chart_port,
            self.orderbook_port
        )
    }
}

fn parse_port(value: Option<String>, default: u16) -> Result<u16> {
    match value {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(port) => Ok(port),
            Err(_) => bail!("invalid port value: {raw:?}"),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_applied() {
        let map = HashMap::from([("POLYGON_API_KEY", "test-key-123")]);
        let settings = Settings::from_lookup(lookup_from(&map)).expect("valid");
        assert_eq!(settings.symbols, vec!["AAPL", "TSLA"]);
        assert_eq!(settings.chart_port, 8765);
        assert_eq!(settings.orderbook_port, 8766);
    }

    #[test]
    fn missing_key_is_an_error() {
        let map = HashMap::new();
        assert!(Settings::from_lookup(lookup_from(&map)).is_err());
    }

    #[test]
    fn symbol_list_is_uppercased_and_trimmed() {
        let map = HashMap::from([
            ("POLYGON_API_KEY", "k"),
            ("SIMBOLOS", " aapl, btcusd ,,tsla "),
        ]);
        let settings = Settings::from_lookup(lookup_from(&map)).expect("valid");
        assert_eq!(settings.symbols, vec!["AAPL", "BTCUSD", "TSLA"]);
    }

    #[test]
    fn ports_parse_and_reject_garbage() {
        let map = HashMap::from([
            ("POLYGON_API_KEY", "k"),
            ("CHART_PORT", "9001"),
            ("ORDERBOOK_PORT", "9002"),
        ]);
        let settings = Settings::from_lookup(lookup_from(&map)).expect("valid");
        assert_eq!(settings.chart_port, 9001);
        assert_eq!(settings.orderbook_port, 9002);

        let bad = HashMap::from([("POLYGON_API_KEY", "k"), ("CHART_PORT", "nope")]);
        assert!(Settings::from_lookup(lookup_from(&bad)).is_err());
    }
}
