//! Synthetic bid/ask generator.
//!
//! Each instance owns one `PriceFeed`. Every tick moves the mid price by a small random
//! walk and quotes it with the configured spread around it.
use mt_common::Quote;
use rand::Rng;

/// Smallest mid price the walk may reach.
const MIN_PRICE: f64 = 0.0001;

/// Random-walk price source for one symbol.
#[derive(Debug, Clone)]
pub struct PriceFeed {
    symbol: String,
    mid: f64,
    spread: f64,
}

impl PriceFeed {
    /// Creates a feed starting at `mid` with a fixed `spread`.
    pub fn new(symbol: &str, mid: f64, spread: f64) -> Self {
        Self {
            symbol: String::from(symbol),
            mid: mid.max(MIN_PRICE),
            spread: spread.abs(),
        }
    }

    /// Calculate the next mid price using a small random walk around `current`.
    ///
    /// The change is sampled uniformly from `[-0.05%, +0.05%]` and the result is clamped
    /// to a minimum positive value.
    pub fn next_mid(current: f64) -> f64 {
        let mut rng = rand::rng();
        let change: f64 = rng.random_range(-0.0005..0.0005);
        (current * (1.0 + change)).max(MIN_PRICE)
    }

    /// Advances the walk and returns the new quote.
    pub fn next_quote(&mut self) -> Quote {
        self.mid = Self::next_mid(self.mid);
        self.current()
    }

    /// Quote at the current mid, without advancing.
    pub fn current(&self) -> Quote {
        let half = self.spread / 2.0;
        Quote::new(&self.symbol, self.mid - half, self.mid + half)
    }

    /// Current spread.
    pub fn spread(&self) -> f64 {
        self.spread
    }

    /// Changes the spread for subsequent quotes.
    pub fn set_spread(&mut self, spread: f64) {
        self.spread = spread.abs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_keep_spread_around_mid() {
        let mut feed = PriceFeed::new("EURUSD", 1.1, 0.0002);
        for _ in 0..100 {
            let quote = feed.next_quote();
            assert_eq!(quote.symbol, "EURUSD");
            assert!(quote.bid < quote.ask);
            assert!((quote.spread() - 0.0002).abs() < 1e-9);
        }
    }

    #[test]
    fn walk_stays_close_and_positive() {
        let next = PriceFeed::next_mid(100.0);
        assert!((99.9..=100.1).contains(&next));
        assert!(PriceFeed::next_mid(0.0) >= MIN_PRICE);
    }

    #[test]
    fn spread_is_never_negative() {
        let mut feed = PriceFeed::new("X", 10.0, -1.0);
        assert_eq!(feed.spread(), 1.0);
        feed.set_spread(-0.5);
        assert_eq!(feed.spread(), 0.5);
    }
}
