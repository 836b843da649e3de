//! Effective token budget per model (spec §4.4).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/agent/service/
//! context.rs::trim_messages_to_budget` computes a budget by subtracting
//! reserved shares from the context window; this mirrors that shape with the
//! exact tiered constants spec.md names.
//!
//! See `DESIGN.md` for the recorded deviation in the smallest tier: spec.md
//! uses a `× 0.84` multiplier where the original implementation subtracts a
//! flat 8,000 tokens. spec.md is authoritative here.

/// `budget(context_window)` — the maximum tokens the Context Manager may
/// send to the provider, after subtracting a safety reserve.
pub fn budget(context_window: usize) -> usize {
    if context_window >= 1_000_000 {
        context_window - 300_000
    } else if context_window >= 400_000 {
        context_window - 64_000
    } else if context_window >= 200_000 {
        context_window - 32_000
    } else if context_window >= 100_000 {
        context_window - 16_000
    } else {
        (context_window as f64 * 0.84) as usize
    }
}

/// `target = floor(budget * 0.6)` — hysteresis goal after compression, so
/// the next turn doesn't immediately need to recompress.
pub fn target(budget: usize) -> usize {
    (budget as f64 * 0.6) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn million_plus_window() {
        assert_eq!(budget(1_200_000), 900_000);
    }

    #[test]
    fn four_hundred_k_window() {
        assert_eq!(budget(400_000), 336_000);
    }

    #[test]
    fn two_hundred_k_window() {
        assert_eq!(budget(200_000), 168_000);
    }

    #[test]
    fn hundred_k_window() {
        assert_eq!(budget(100_000), 84_000);
    }

    #[test]
    fn small_window_uses_multiplier() {
        assert_eq!(budget(50_000), 42_000);
    }

    #[test]
    fn target_is_sixty_percent_of_budget() {
        assert_eq!(target(168_000), 100_800);
    }
}
