//! Billing / credit accounting (spec §4.5, §4.6, §8 invariant 7).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/pricing.rs` for the
//! pricing-table shape (moved to [`pricing`]); the reservation/deduction
//! flow itself has no teacher counterpart (the teacher is a single-user CLI
//! with no credit system) and is built directly from spec.md §4.6's
//! `check_and_reserve_credits` / `deduct` contract.

pub mod pricing;

use deadpool_sqlite::Pool;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::db::Usage;
use crate::error::CoreResult;

use pricing::PricingTable;

pub struct BillingService {
    pool: Pool,
    dev_mode: bool,
    pricing: PricingTable,
}

impl BillingService {
    pub fn new(pool: Pool, cfg: &BillingConfig) -> Self {
        Self {
            pool,
            dev_mode: cfg.dev_mode,
            pricing: PricingTable::load(cfg.pricing_path.as_deref()),
        }
    }

    /// Called before each Thread Runner iteration (spec §4.6 step "credit
    /// reservation"). In dev mode this always succeeds without touching the
    /// database, mirroring the teacher's CLI bypass for local use.
    pub async fn check_and_reserve_credits(&self, user_id: Uuid) -> CoreResult<(bool, Option<Uuid>)> {
        if self.dev_mode {
            return Ok((true, None));
        }
        let account = crate::db::get_credit_account(&self.pool, user_id).await?;
        let Some(account) = account else {
            return Ok((false, None));
        };
        if account.balance <= Decimal::ZERO {
            return Ok((false, None));
        }
        let reservation_id = crate::db::insert_reservation(&self.pool, user_id).await?;
        Ok((true, Some(reservation_id)))
    }

    /// Releases a reservation without deducting — used when an iteration
    /// errors out before the provider call completes.
    pub async fn release_reservation(&self, reservation_id: Uuid) -> CoreResult<()> {
        if self.dev_mode {
            return Ok(());
        }
        crate::db::release_reservation(&self.pool, reservation_id).await
    }

    pub fn cost(&self, usage: &Usage) -> Decimal {
        self.pricing.cost(
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.cache_read_input_tokens,
            usage.cache_creation_input_tokens,
            &usage.model,
        )
    }

    /// Post-insert hook on `llm_response_end` (spec §4.5). Idempotent on
    /// `llm_response_id`; a no-op in dev mode.
    pub async fn deduct(&self, llm_response_id: Uuid, user_id: Uuid, usage: &Usage) -> CoreResult<bool> {
        if self.dev_mode {
            return Ok(true);
        }
        let amount = self.cost(usage);
        crate::db::record_deduction(&self.pool, llm_response_id, user_id, amount).await
    }
}
