//! Deposits and withdrawals through an external payment gateway
//!
//! The gateway is opaque: it hands out deposit addresses, reports inbound
//! transfers and accepts outbound ones. The cashier only turns confirmed
//! transfers into ledger credits and withdrawals into a debit that is reversed
//! if the transfer does not go through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    common::{
        clock::Clock,
        types::{Points, UserId},
    },
    config::CashierConfig,
    errors::{CasinoError, CasinoResult},
    ledger::{EntryKind, Ledger},
    locks::KeyedLocks,
    storage::{load_json, BatchOp, KvStore},
};

fn deposit_key(tx_id: &str) -> Vec<u8> {
    format!("deposit:{}", tx_id).into_bytes()
}

const PENDING_WITHDRAWAL_PREFIX: &str = "withdrawal:pending:";

fn withdrawal_key(id: &Uuid) -> Vec<u8> {
    format!("withdrawal:{}", id).into_bytes()
}

fn pending_withdrawal_key(id: &Uuid) -> Vec<u8> {
    format!("{}{}", PENDING_WITHDRAWAL_PREFIX, id).into_bytes()
}

/// Row write plus the pending-index entry that matches its status
fn withdrawal_ops(withdrawal: &Withdrawal) -> CasinoResult<Vec<BatchOp>> {
    let index_op = if withdrawal.status == WithdrawalStatus::Pending {
        BatchOp::put(pending_withdrawal_key(&withdrawal.id), withdrawal.id.to_string())
    } else {
        BatchOp::delete(pending_withdrawal_key(&withdrawal.id))
    };
    Ok(vec![
        BatchOp::put_json(withdrawal_key(&withdrawal.id), withdrawal)?,
        index_op,
    ])
}

/// Withdrawals still `Pending` whose last update is older than `before`.
///
/// A withdrawal stays pending only when the process stopped between the
/// debit and the gateway's answer. Whether the transfer left is unknown, so
/// these are reported for manual review and never reversed automatically.
pub fn stale_withdrawals(
    store: &dyn KvStore,
    before: DateTime<Utc>,
    page_size: usize,
) -> CasinoResult<Vec<Withdrawal>> {
    let mut stale = Vec::new();
    let mut after: Option<Vec<u8>> = None;
    loop {
        let rows = store.scan_prefix(
            PENDING_WITHDRAWAL_PREFIX.as_bytes(),
            after.as_deref(),
            page_size,
        )?;
        for (_, value) in &rows {
            let Some(id) = std::str::from_utf8(value)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                tracing::warn!("Skipping malformed pending withdrawal index entry");
                continue;
            };
            let withdrawal: Option<Withdrawal> = load_json(store, &withdrawal_key(&id))?;
            if let Some(withdrawal) = withdrawal {
                if withdrawal.status == WithdrawalStatus::Pending && withdrawal.updated_at < before {
                    stale.push(withdrawal);
                }
            }
        }
        if rows.len() < page_size {
            return Ok(stale);
        }
        after = rows.last().map(|(key, _)| key.clone());
    }
}

/// Network fee charged on top of a withdrawal
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSchedule {
    pub flat: Points,
    pub rate_bps: u32,
}

impl FeeSchedule {
    /// Fee for sending `amount`, rounded up to the next cent
    pub fn fee_for(&self, amount: Points) -> Points {
        let variable = (amount.cents() as u128 * self.rate_bps as u128).div_ceil(10_000);
        Points::from_cents(self.flat.cents().saturating_add(variable as u64))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn deposit_address(&self, user: &UserId) -> CasinoResult<String>;

    /// Submit an outbound transfer; returns the gateway transaction id
    async fn submit_transfer(&self, address: &str, amount: Points) -> CasinoResult<String>;

    async fn fee_schedule(&self) -> CasinoResult<FeeSchedule>;
}

/// Transfer reported by the gateway for a user's deposit address
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundTransfer {
    pub tx_id: String,
    pub user_id: UserId,
    pub amount: Points,
    pub confirmations: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct DepositRecord {
    tx_id: String,
    user_id: UserId,
    amount: Points,
    credited_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Reversed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: UserId,
    pub address: String,
    pub amount: Points,
    pub fee: Points,
    pub status: WithdrawalStatus,
    #[serde(default)]
    pub tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn total(&self) -> Points {
        self.amount.saturating_add(self.fee)
    }
}

/// Largest amount in `1..=target` cents accepted by `fits`, assuming `fits`
/// is monotone (true below some threshold, false above it).
pub fn max_spendable<F>(target: Points, fits: F) -> Option<Points>
where
    F: Fn(Points) -> bool,
{
    if target.is_zero() {
        return None;
    }
    if fits(target) {
        return Some(target);
    }

    // Invariant: fits(lo) or lo == 0, and !fits(hi).
    let (mut lo, mut hi) = (0u64, target.cents());
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if fits(Points::from_cents(mid)) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo > 0).then_some(Points::from_cents(lo))
}

pub struct Cashier {
    store: Arc<dyn KvStore>,
    ledger: Arc<Ledger>,
    locks: Arc<KeyedLocks>,
    gateway: Arc<dyn PaymentGateway>,
    config: CashierConfig,
    clock: Arc<dyn Clock>,
}

impl Cashier {
    pub fn new(
        store: Arc<dyn KvStore>,
        ledger: Arc<Ledger>,
        locks: Arc<KeyedLocks>,
        gateway: Arc<dyn PaymentGateway>,
        config: CashierConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            gateway,
            config,
            clock,
        }
    }

    pub async fn deposit_address(&self, user: &UserId) -> CasinoResult<String> {
        user.validate()?;
        self.ledger.ensure_exists(user).await?;
        self.gateway.deposit_address(user).await
    }

    /// Credit a confirmed inbound transfer exactly once
    pub async fn credit_deposit(&self, transfer: &InboundTransfer) -> CasinoResult<Points> {
        transfer.user_id.validate()?;
        if transfer.confirmations < self.config.min_confirmations {
            return Err(CasinoError::AwaitingConfirmations {
                have: transfer.confirmations,
                need: self.config.min_confirmations,
            });
        }

        let _tx_guard = self.locks.lock(&format!("deposit:{}", transfer.tx_id)).await;
        if self.store.get(&deposit_key(&transfer.tx_id))?.is_some() {
            return Err(CasinoError::DuplicateDeposit(transfer.tx_id.clone()));
        }

        let _guard = self.ledger.lock_user(&transfer.user_id).await;
        let mut account = self.ledger.load_or_new(&transfer.user_id)?;
        let mut ops = self.ledger.stage_credit(
            &mut account,
            transfer.amount,
            EntryKind::Deposit,
            &transfer.tx_id,
        )?;
        let record = DepositRecord {
            tx_id: transfer.tx_id.clone(),
            user_id: transfer.user_id.clone(),
            amount: transfer.amount,
            credited_at: self.clock.now(),
        };
        ops.push(BatchOp::put_json(deposit_key(&transfer.tx_id), &record)?);
        self.store.write_batch(ops)?;

        tracing::info!(
            user = %transfer.user_id,
            tx = %transfer.tx_id,
            amount = %transfer.amount,
            "Deposit credited"
        );
        Ok(account.balance())
    }

    /// Debit `amount` plus the network fee and send `amount` to `address`.
    /// The debit is reversed if the gateway rejects or fails the transfer.
    pub async fn withdraw(
        &self,
        user: &UserId,
        amount: Points,
        address: &str,
    ) -> CasinoResult<Withdrawal> {
        user.validate()?;
        if address.trim().is_empty() {
            return Err(CasinoError::InvalidParams("withdrawal address is empty".to_string()));
        }
        let minimum = Points::from_cents(self.config.min_withdrawal_cents);
        if amount < minimum {
            return Err(CasinoError::InvalidStake(format!(
                "withdrawals must be at least {}",
                minimum
            )));
        }

        let _in_flight = self
            .locks
            .try_lock(&format!("withdraw:{}", user))
            .ok_or(CasinoError::ActionInProgress)?;

        let fee = self.gateway.fee_schedule().await?.fee_for(amount);
        let now = self.clock.now();
        let mut withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            user_id: user.clone(),
            address: address.to_string(),
            amount,
            fee,
            status: WithdrawalStatus::Pending,
            tx_id: None,
            created_at: now,
            updated_at: now,
        };

        {
            let _guard = self.ledger.lock_user(user).await;
            let mut account = self.ledger.load_or_new(user)?;
            let mut ops = self.ledger.stage_debit(
                &mut account,
                withdrawal.total(),
                EntryKind::Withdrawal,
                &withdrawal.id.to_string(),
            )?;
            ops.extend(withdrawal_ops(&withdrawal)?);
            self.store.write_batch(ops)?;
        }

        match self.gateway.submit_transfer(address, amount).await {
            Ok(tx_id) => {
                withdrawal.status = WithdrawalStatus::Completed;
                withdrawal.tx_id = Some(tx_id);
                withdrawal.updated_at = self.clock.now();
                if let Err(e) = self.store.write_batch(withdrawal_ops(&withdrawal)?) {
                    // The money has left; only the bookkeeping row is stale.
                    tracing::error!(withdrawal = %withdrawal.id, "Failed to mark withdrawal completed: {}", e);
                }
                tracing::info!(
                    user = %user,
                    withdrawal = %withdrawal.id,
                    amount = %amount,
                    fee = %fee,
                    "Withdrawal sent"
                );
                Ok(withdrawal)
            }
            Err(e) => {
                tracing::warn!(user = %user, withdrawal = %withdrawal.id, "Transfer failed, reversing debit: {}", e);
                self.reverse(&mut withdrawal).await?;
                Err(match e {
                    CasinoError::Gateway(_) => e,
                    other => CasinoError::Gateway(other.to_string()),
                })
            }
        }
    }

    /// Withdraw the largest amount the balance covers after fees
    pub async fn withdraw_max(&self, user: &UserId, address: &str) -> CasinoResult<Withdrawal> {
        let balance = self.ledger.balance(user)?;
        let fees = self.gateway.fee_schedule().await?;
        let amount = max_spendable(balance, |a| {
            a.checked_add(fees.fee_for(a)).is_some_and(|total| total <= balance)
        })
        .ok_or(CasinoError::InsufficientFunds {
            needed: fees.fee_for(Points::from_cents(1)).saturating_add(Points::from_cents(1)),
            available: balance,
        })?;
        self.withdraw(user, amount, address).await
    }

    async fn reverse(&self, withdrawal: &mut Withdrawal) -> CasinoResult<()> {
        let _guard = self.ledger.lock_user(&withdrawal.user_id).await;
        let mut account = self.ledger.load_or_new(&withdrawal.user_id)?;
        withdrawal.status = WithdrawalStatus::Reversed;
        withdrawal.updated_at = self.clock.now();

        let mut ops = self.ledger.stage_credit(
            &mut account,
            withdrawal.total(),
            EntryKind::WithdrawalReversal,
            &withdrawal.id.to_string(),
        )?;
        ops.extend(withdrawal_ops(withdrawal)?);
        self.store.write_batch(ops).map_err(|e| {
            tracing::error!(
                withdrawal = %withdrawal.id,
                user = %withdrawal.user_id,
                total = %withdrawal.total(),
                "Withdrawal reversal failed, needs manual attention: {}",
                e
            );
            CasinoError::SettlementInfraFailure {
                reason: e.to_string(),
                refunded: false,
            }
        })
    }

    pub fn withdrawal(&self, id: &Uuid) -> CasinoResult<Option<Withdrawal>> {
        load_json(self.store.as_ref(), &withdrawal_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::SystemClock;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockGateway {
        reject: AtomicBool,
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn deposit_address(&self, user: &UserId) -> CasinoResult<String> {
            Ok(format!("addr-{}", user))
        }

        async fn submit_transfer(&self, _address: &str, _amount: Points) -> CasinoResult<String> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(CasinoError::Gateway("amount below dust limit".to_string()));
            }
            Ok("tx-out-1".to_string())
        }

        async fn fee_schedule(&self) -> CasinoResult<FeeSchedule> {
            Ok(FeeSchedule {
                flat: Points::from_cents(50),
                rate_bps: 100,
            })
        }
    }

    fn cashier(reject: bool) -> (Cashier, Arc<Ledger>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
        let locks = Arc::new(KeyedLocks::new());
        let ledger = Arc::new(Ledger::new(store.clone(), locks.clone(), Arc::new(SystemClock)));
        let gateway = Arc::new(MockGateway {
            reject: AtomicBool::new(reject),
        });
        let cashier = Cashier::new(
            store,
            ledger.clone(),
            locks,
            gateway,
            CashierConfig::default(),
            Arc::new(SystemClock),
        );
        (cashier, ledger)
    }

    fn transfer(tx: &str, cents: u64, confirmations: u32) -> InboundTransfer {
        InboundTransfer {
            tx_id: tx.to_string(),
            user_id: UserId::from("7"),
            amount: Points::from_cents(cents),
            confirmations,
        }
    }

    #[test]
    fn test_max_spendable_binary_search() {
        let fees = FeeSchedule {
            flat: Points::from_cents(50),
            rate_bps: 100,
        };
        let balance = Points::whole(100);
        let best = max_spendable(balance, |a| a.saturating_add(fees.fee_for(a)) <= balance).unwrap();
        assert!(best.saturating_add(fees.fee_for(best)) <= balance);
        let next = Points::from_cents(best.cents() + 1);
        assert!(next.saturating_add(fees.fee_for(next)) > balance);

        assert_eq!(max_spendable(Points::whole(5), |_| true), Some(Points::whole(5)));
        assert_eq!(max_spendable(Points::whole(5), |_| false), None);
        assert_eq!(max_spendable(Points::ZERO, |_| true), None);
    }

    #[tokio::test]
    async fn test_deposit_credited_once() {
        let (cashier, ledger) = cashier(false);
        let user = UserId::from("7");

        assert!(matches!(
            cashier.credit_deposit(&transfer("tx-1", 2_500, 0)).await,
            Err(CasinoError::AwaitingConfirmations { have: 0, need: 1 })
        ));
        assert_eq!(cashier.credit_deposit(&transfer("tx-1", 2_500, 1)).await.unwrap(), Points::whole(25));
        assert!(matches!(
            cashier.credit_deposit(&transfer("tx-1", 2_500, 2)).await,
            Err(CasinoError::DuplicateDeposit(_))
        ));
        assert_eq!(ledger.balance(&user).unwrap(), Points::whole(25));
    }

    #[tokio::test]
    async fn test_withdrawal_debits_amount_and_fee() {
        let (cashier, ledger) = cashier(false);
        let user = UserId::from("7");
        cashier.credit_deposit(&transfer("tx-1", 10_000, 3)).await.unwrap();

        let w = cashier.withdraw(&user, Points::whole(50), "addr").await.unwrap();
        assert_eq!(w.status, WithdrawalStatus::Completed);
        assert_eq!(w.fee, Points::from_cents(100));
        assert_eq!(ledger.balance(&user).unwrap(), Points::whole(49));
        assert_eq!(cashier.withdrawal(&w.id).unwrap().unwrap().tx_id.as_deref(), Some("tx-out-1"));
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(stale_withdrawals(cashier.store.as_ref(), later, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_transfer_is_reversed() {
        let (cashier, ledger) = cashier(true);
        let user = UserId::from("7");
        cashier.credit_deposit(&transfer("tx-1", 10_000, 3)).await.unwrap();

        let err = cashier.withdraw(&user, Points::whole(50), "addr").await.unwrap_err();
        assert!(matches!(err, CasinoError::Gateway(_)));
        assert_eq!(ledger.balance(&user).unwrap(), Points::whole(100));

        let entries = ledger.entries(&user, 10).unwrap();
        assert!(entries.iter().any(|e| e.kind == EntryKind::WithdrawalReversal));
    }

    #[tokio::test]
    async fn test_withdraw_max_leaves_room_for_fee() {
        let (cashier, ledger) = cashier(false);
        let user = UserId::from("7");
        cashier.credit_deposit(&transfer("tx-1", 10_000, 3)).await.unwrap();

        let w = cashier.withdraw_max(&user, "addr").await.unwrap();
        assert!(w.total() <= Points::whole(100));
        assert_eq!(ledger.balance(&user).unwrap().cents(), 10_000 - w.total().cents());
        assert!(matches!(
            cashier.withdraw(&user, Points::whole(1), "addr").await,
            Err(CasinoError::InsufficientFunds { .. })
        ));
    }
}
