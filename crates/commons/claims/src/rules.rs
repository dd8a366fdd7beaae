//! Pluggable preconditions for opening claims.
//!
//! Rules run after the engine has filled in the draft's value, so a rule
//! sees exactly what would be persisted. Each rule applies itself only to
//! the claim kinds it cares about and passes everything else through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use commons_storage::CommonsStorage;
use commons_types::ClaimKind;

use crate::{account_balance, ClaimConfig, ClaimDraft, ClaimError};

pub struct RuleContext<'a> {
    pub store: &'a dyn CommonsStorage,
    pub draft: &'a ClaimDraft,
    pub now: DateTime<Utc>,
    pub config: &'a ClaimConfig,
}

#[async_trait]
pub trait ClaimRule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &RuleContext<'_>) -> Result<(), ClaimError>;
}

/// Disputes may not target their own initiator.
pub struct NoSelfTarget;

#[async_trait]
impl ClaimRule for NoSelfTarget {
    fn name(&self) -> &'static str {
        "no_self_target"
    }

    async fn check(&self, ctx: &RuleContext<'_>) -> Result<(), ClaimError> {
        if ctx.draft.kind == ClaimKind::Dispute
            && ctx.draft.target.as_ref() == Some(&ctx.draft.initiator)
        {
            return Err(ClaimError::SelfTarget);
        }
        Ok(())
    }
}

/// One open dispute per initiator/target pair at a time.
pub struct SingleOpenDispute;

#[async_trait]
impl ClaimRule for SingleOpenDispute {
    fn name(&self) -> &'static str {
        "single_open_dispute"
    }

    async fn check(&self, ctx: &RuleContext<'_>) -> Result<(), ClaimError> {
        if ctx.draft.kind != ClaimKind::Dispute {
            return Ok(());
        }
        let open = ctx.store.list_open_claims(&ctx.draft.scope).await?;
        let duplicate = open.iter().any(|c| {
            c.kind == ClaimKind::Dispute
                && c.initiator == ctx.draft.initiator
                && c.target == ctx.draft.target
        });
        if duplicate {
            return Err(ClaimError::DuplicateDispute);
        }
        Ok(())
    }
}

/// Purchases must fit within the shared account balance, counting every
/// earlier purchase not yet rejected.
pub struct SufficientAccountBalance;

#[async_trait]
impl ClaimRule for SufficientAccountBalance {
    fn name(&self) -> &'static str {
        "sufficient_account_balance"
    }

    async fn check(&self, ctx: &RuleContext<'_>) -> Result<(), ClaimError> {
        if ctx.draft.kind != ClaimKind::Purchase {
            return Ok(());
        }
        let available = account_balance(ctx.store, &ctx.draft.scope, ctx.now).await?;
        if ctx.draft.value > available {
            return Err(ClaimError::InsufficientFunds {
                needed: ctx.draft.value,
                available,
            });
        }
        Ok(())
    }
}

/// A completion claim on an entity with nothing accrued is meaningless.
pub struct NonZeroCompletionValue;

#[async_trait]
impl ClaimRule for NonZeroCompletionValue {
    fn name(&self) -> &'static str {
        "non_zero_completion_value"
    }

    async fn check(&self, ctx: &RuleContext<'_>) -> Result<(), ClaimError> {
        if ctx.draft.kind == ClaimKind::Completion && ctx.draft.value == 0.0 {
            return Err(ClaimError::ZeroValueClaim);
        }
        Ok(())
    }
}
