//! Quote data model.
//!
//! A `Quote` is the latest bid/ask snapshot an algorithm instance publishes on every
//! tick. Sessions keep exactly one of them and overwrite it in place.
use serde::{Deserialize, Serialize};

/// Best bid/ask for a single symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument symbol as the host names it (e.g. `EURUSD`).
    pub symbol: String,
    /// Best bid price.
    pub bid: f64,
    /// Best ask price.
    pub ask: f64,
}

impl Quote {
    /// Creates a new quote.
    pub fn new(symbol: &str, bid: f64, ask: f64) -> Self {
        Quote {
            symbol: String::from(symbol),
            bid,
            ask,
        }
    }

    /// Distance between ask and bid.
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_is_ask_minus_bid() {
        let quote = Quote::new("EURUSD", 1.1, 1.25);
        assert!((quote.spread() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn default_quote_is_empty() {
        let quote = Quote::default();
        assert!(quote.symbol.is_empty());
        assert_eq!(quote.bid, 0.0);
        assert_eq!(quote.ask, 0.0);
    }
}
