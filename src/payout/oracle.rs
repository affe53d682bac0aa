use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::collections::HashMap;

use crate::error::ConnectorError;

/// Source of exchange rates between priced currencies
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Units of `to_ticker` worth one unit of `from_ticker`
    async fn conversion_rate(&self, from_ticker: &str, to_ticker: &str) -> Result<BigDecimal, ConnectorError>;
}

/// Oracle answering from a fixed table of rates
///
/// Inverse pairs are derived when only one direction is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    rates: HashMap<(String, String), BigDecimal>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from_ticker: &str, to_ticker: &str, rate: BigDecimal) -> Self {
        self.rates
            .insert((from_ticker.to_uppercase(), to_ticker.to_uppercase()), rate);
        self
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn conversion_rate(&self, from_ticker: &str, to_ticker: &str) -> Result<BigDecimal, ConnectorError> {
        let from = from_ticker.to_uppercase();
        let to = to_ticker.to_uppercase();
        if from == to {
            return Ok(BigDecimal::from(1));
        }
        if let Some(rate) = self.rates.get(&(from.clone(), to.clone())) {
            return Ok(rate.clone());
        }
        match self.rates.get(&(to, from)) {
            Some(rate) if *rate != BigDecimal::from(0) => Ok(BigDecimal::from(1) / rate),
            _ => Err(ConnectorError::Unavailable(format!(
                "no price for {}/{}",
                from_ticker, to_ticker
            ))),
        }
    }
}
