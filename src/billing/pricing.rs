//! Model pricing table.
//!
//! Grounded directly on `examples/adolfousier-opencrabs/src/pricing.rs`:
//! same prefix-match-first-wins lookup and TOML-file-with-compiled-fallback
//! loading, narrowed to the provider families this core ships
//! (Anthropic, OpenAI-compatible) and extended with a cache-read rate since
//! spec §4.5 bills cache reads at the provider's discounted rate.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub prefix: String,
    pub input_per_m: f64,
    pub output_per_m: f64,
    /// Cache-read tokens are billed at a discount off `input_per_m`; falls
    /// back to `input_per_m * 0.1` (Anthropic's published ratio) when unset.
    #[serde(default)]
    pub cache_read_per_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingTable {
    #[serde(default)]
    pub providers: HashMap<String, Vec<PricingEntry>>,
}

impl PricingTable {
    pub fn load(path: Option<&std::path::Path>) -> Self {
        if let Some(path) = path {
            if let Ok(content) = std::fs::read_to_string(path) {
                if let Ok(table) = toml::from_str::<PricingTable>(&content) {
                    return table;
                }
                tracing::warn!(path = %path.display(), "pricing file present but failed to parse, using defaults");
            }
        }
        Self::defaults()
    }

    pub fn defaults() -> Self {
        toml::from_str(DEFAULT_PRICING_TOML).unwrap_or_default()
    }

    fn find(&self, model: &str) -> Option<&PricingEntry> {
        let m = model.to_lowercase();
        self.providers
            .values()
            .flatten()
            .find(|entry| m.contains(&entry.prefix.to_lowercase()))
    }

    /// `cost(prompt, completion, cache_read, cache_creation, model)` (spec
    /// §4.5). Cache-creation tokens are billed at the ordinary input rate;
    /// cache-read tokens at the discounted rate. Unknown models cost zero
    /// rather than erroring, matching the teacher's unmatched-model
    /// behaviour.
    pub fn cost(
        &self,
        prompt_tokens: u64,
        completion_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
        model: &str,
    ) -> Decimal {
        let Some(entry) = self.find(model) else {
            return Decimal::ZERO;
        };
        let million = 1_000_000.0;
        let cache_read_rate = entry.cache_read_per_m.unwrap_or(entry.input_per_m * 0.1);
        let input_cost = (prompt_tokens as f64 / million) * entry.input_per_m;
        let output_cost = (completion_tokens as f64 / million) * entry.output_per_m;
        let cache_read_cost = (cache_read_tokens as f64 / million) * cache_read_rate;
        let cache_creation_cost = (cache_creation_tokens as f64 / million) * entry.input_per_m;
        let total = input_cost + output_cost + cache_read_cost + cache_creation_cost;
        Decimal::from_f64_retain(total).unwrap_or(Decimal::ZERO)
    }
}

const DEFAULT_PRICING_TOML: &str = r#"
[providers.anthropic]
entries = [
  { prefix = "claude-opus-4",     input_per_m = 15.0, output_per_m = 75.0, cache_read_per_m = 1.5 },
  { prefix = "claude-sonnet-4",   input_per_m = 3.0,  output_per_m = 15.0, cache_read_per_m = 0.3 },
  { prefix = "claude-3-7-sonnet", input_per_m = 3.0,  output_per_m = 15.0, cache_read_per_m = 0.3 },
  { prefix = "claude-3-5-sonnet", input_per_m = 3.0,  output_per_m = 15.0, cache_read_per_m = 0.3 },
  { prefix = "claude-3-5-haiku",  input_per_m = 0.80, output_per_m = 4.0,  cache_read_per_m = 0.08 },
  { prefix = "claude-3-haiku",    input_per_m = 0.25, output_per_m = 1.25, cache_read_per_m = 0.03 },
]

[providers.openai]
entries = [
  { prefix = "gpt-4o-mini", input_per_m = 0.15, output_per_m = 0.60 },
  { prefix = "gpt-4o",      input_per_m = 2.50, output_per_m = 10.0 },
  { prefix = "o3-mini",     input_per_m = 1.10, output_per_m = 4.40 },
  { prefix = "o3",          input_per_m = 10.0, output_per_m = 40.0 },
]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn defaults_parse_and_match_sonnet() {
        let table = PricingTable::defaults();
        let cost = table.cost(1_000_000, 1_000_000, 0, 0, "claude-sonnet-4-6");
        assert_eq!(cost, Decimal::from_str("18").unwrap());
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = PricingTable::defaults();
        assert_eq!(table.cost(1000, 1000, 0, 0, "some-unknown-model"), Decimal::ZERO);
    }

    #[test]
    fn cache_read_tokens_bill_at_discount() {
        let table = PricingTable::defaults();
        let full_price = table.cost(0, 0, 0, 1_000_000, "claude-sonnet-4-6");
        let cache_read_price = table.cost(0, 0, 1_000_000, 0, "claude-sonnet-4-6");
        assert!(cache_read_price < full_price);
    }
}
