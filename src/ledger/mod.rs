use tracing::info;

use chrono::{DateTime, Utc};

use crate::error::{ShopError, ShopResult};
use crate::store::models::{Lease, LedgerEntry, LedgerReason, Protocol};
use crate::store::Store;

/// Outcome of a balance mutation: previous and new balance, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub previous: i64,
    pub new: i64,
}

/// Authoritative store of user balance and history. Every mutation appends an
/// immutable ledger entry; the store lock serializes concurrent mutations for
/// the same user (purchase racing an admin adjustment cannot lose an update).
#[derive(Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Credit (positive) or debit (negative) a user's balance. The
    /// sufficiency check for debits runs inside the same transaction as the
    /// write; a debit that would cross zero fails with `InsufficientBalance`
    /// and leaves no trace.
    pub fn credit(
        &self,
        user_id: &str,
        amount: i64,
        reason: LedgerReason,
        correlation_id: Option<&str>,
    ) -> ShopResult<BalanceChange> {
        let (previous, new) =
            self.store
                .apply_ledger_delta(user_id, amount, reason, correlation_id)?;
        info!(
            user_id,
            amount,
            reason = reason.as_str(),
            previous,
            new, "ledger entry appended"
        );
        Ok(BalanceChange { previous, new })
    }

    pub fn debit(
        &self,
        user_id: &str,
        amount: i64,
        reason: LedgerReason,
        correlation_id: Option<&str>,
    ) -> ShopResult<BalanceChange> {
        debug_assert!(amount >= 0);
        self.credit(user_id, -amount, reason, correlation_id)
    }

    /// Set the balance to an explicit value, recorded as a single delta entry
    /// of (target − current). The read of the current balance and the write
    /// share one store transaction, so the result is exactly `target` even
    /// with credits or debits racing this call.
    pub fn set_balance(&self, user_id: &str, target: i64) -> ShopResult<BalanceChange> {
        if target < 0 {
            return Err(ShopError::Validation(
                "balance cannot be set below zero".to_string(),
            ));
        }
        let (previous, new) = self.store.set_balance(user_id, target)?;
        info!(user_id, previous, new, "balance overwritten");
        Ok(BalanceChange { previous, new })
    }

    /// Debit the purchase price and record the lease atomically. A username
    /// collision rolls the whole transaction back, so the buyer is never
    /// charged for a lease that was not created.
    pub fn charge_purchase(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
        username: &str,
        price: i64,
        expires_at: DateTime<Utc>,
    ) -> ShopResult<Lease> {
        debug_assert!(price >= 0);
        let lease =
            self.store
                .record_paid_lease(user_id, server_id, protocol, username, price, expires_at)?;
        info!(
            user_id,
            username, price, "purchase debited and lease recorded"
        );
        Ok(lease)
    }

    /// Debit the renewal price and extend the lease atomically. Fails without
    /// moving money when the lease no longer exists.
    pub fn charge_renewal(
        &self,
        user_id: &str,
        lease_id: i64,
        username: &str,
        price: i64,
        new_expiry: DateTime<Utc>,
    ) -> ShopResult<BalanceChange> {
        debug_assert!(price >= 0);
        let (previous, new) = self
            .store
            .record_renewal(lease_id, user_id, username, price, new_expiry)?;
        info!(user_id, username, price, "renewal debited");
        Ok(BalanceChange { previous, new })
    }

    pub fn balance(&self, user_id: &str) -> ShopResult<i64> {
        match self.store.get_user(user_id)? {
            Some(user) => Ok(user.balance),
            None => Err(ShopError::NotFound(format!("user {user_id}"))),
        }
    }

    pub fn history(&self, user_id: &str) -> ShopResult<Vec<LedgerEntry>> {
        self.store.ledger_entries(user_id)
    }
}
