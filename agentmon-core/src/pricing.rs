//! Model pricing and cost estimation
//!
//! Prices are USD per million tokens. Lookup tries the exact model id, then a
//! model family (`opus`, `sonnet`, `haiku`) found in the id, then the default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Price of one model, USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Cost of the given token counts
    pub fn cost(&self, tokens_input: i64, tokens_output: i64) -> f64 {
        (tokens_input.max(0) as f64 / 1_000_000.0) * self.input
            + (tokens_output.max(0) as f64 / 1_000_000.0) * self.output
    }
}

const BUILTIN: &[(&str, ModelPrice)] = &[
    ("claude-opus-4-5-20251101", ModelPrice::new(15.0, 75.0)),
    ("claude-sonnet-4-20250514", ModelPrice::new(3.0, 15.0)),
    ("claude-3-5-haiku-20241022", ModelPrice::new(0.8, 4.0)),
];

const FAMILIES: &[&str] = &["opus", "sonnet", "haiku"];

const DEFAULT_PRICE: ModelPrice = ModelPrice::new(3.0, 15.0);

/// Model id → price table
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPrice>,
    default: ModelPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            models: BUILTIN
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
            default: DEFAULT_PRICE,
        }
    }
}

impl PricingTable {
    /// Add or replace a model entry
    pub fn insert(&mut self, model: &str, price: ModelPrice) {
        self.models.insert(model.to_string(), price);
    }

    /// Replace the fallback price
    pub fn set_default(&mut self, price: ModelPrice) {
        self.default = price;
    }

    /// Price for a model id
    pub fn price_for(&self, model: Option<&str>) -> ModelPrice {
        let Some(model) = model else {
            return self.default;
        };
        if let Some(price) = self.models.get(model) {
            return *price;
        }

        let lower = model.to_lowercase();
        let family = FAMILIES.iter().find(|f| lower.contains(*f));
        if let Some(family) = family {
            let mut candidates: Vec<_> = self
                .models
                .iter()
                .filter(|(id, _)| id.contains(family))
                .collect();
            // Deterministic pick when several ids share a family
            candidates.sort_by(|a, b| b.0.cmp(a.0));
            if let Some((_, price)) = candidates.first() {
                return **price;
            }
        }
        self.default
    }

    /// Estimated cost in USD
    pub fn cost(&self, model: Option<&str>, tokens_input: i64, tokens_output: i64) -> f64 {
        self.price_for(model).cost(tokens_input, tokens_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_million_each_at_default_price() {
        let table = PricingTable::default();
        let cost = table.cost(None, 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_and_family_lookup() {
        let table = PricingTable::default();
        assert_eq!(
            table.price_for(Some("claude-opus-4-5-20251101")),
            ModelPrice::new(15.0, 75.0)
        );
        assert_eq!(
            table.price_for(Some("claude-haiku-4-5")),
            ModelPrice::new(0.8, 4.0)
        );
        assert_eq!(table.price_for(Some("gpt-4o")), DEFAULT_PRICE);
    }

    #[test]
    fn test_overrides() {
        let mut table = PricingTable::default();
        table.insert("local", ModelPrice::new(0.0, 0.0));
        table.set_default(ModelPrice::new(1.0, 1.0));
        assert_eq!(table.cost(Some("local"), 5_000_000, 5_000_000), 0.0);
        assert_eq!(table.cost(Some("mystery"), 1_000_000, 0), 1.0);
    }
}
