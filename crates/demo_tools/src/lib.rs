//! demo_tools
//!
//! A minimal in-process mock bank: `get_balance` and `send_money`. Exists
//! purely so the integration tests and the `dlm-control demo-banking`
//! subcommand can exercise spec.md §8's seed scenarios 1-3 end to end
//! without a real LLM or banking backend.
//!
//! Grounded in `original_source/benchmarks/banking/tools.py` (a stub in the
//! retrieval pack) and `benchmarks/banking/policy.py`'s `TRUSTED_IBANS`
//! list, which is reused here as the bank's own "known account" ledger so
//! the allowlisted scenario and the policy allowlist agree on the same
//! values.
//!
//! This is process-global mutable state exactly as spec.md §9 describes
//! benchmark fixtures ("a property of the mock fixtures, not of the core");
//! the mediation core never assumes such state exists.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Mirrors `original_source/benchmarks/banking/policy.py`'s `TRUSTED_IBANS`.
pub const TRUSTED_IBANS: &[&str] = &[
    "CH9300762011623852957",
    "GB29NWBK60161331926819",
    "SE3550000000054910000003",
    "US122000000121212121212",
    "UK12345678901234567890",
];

#[derive(Debug, Error)]
pub enum BankError {
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("insufficient funds: balance {balance} < amount {amount}")]
    InsufficientFunds { balance: f64, amount: f64 },
}

struct BankState {
    balances: HashMap<String, f64>,
}

/// Single process-wide mock ledger. `MockBank::shared()` is the handle the
/// demo CLI and integration tests use; nothing in `dlm-mediator`/`dlm-policy`
/// depends on this type.
pub struct MockBank {
    state: Mutex<BankState>,
}

impl MockBank {
    pub fn new() -> Self {
        let mut balances = HashMap::new();
        for iban in TRUSTED_IBANS {
            balances.insert(iban.to_string(), 1810.0);
        }
        Self { state: Mutex::new(BankState { balances }) }
    }

    pub fn get_balance(&self, account: &str) -> Result<f64, BankError> {
        let state = self.state.lock().expect("mock bank lock poisoned");
        state.balances.get(account).copied().ok_or_else(|| BankError::UnknownAccount(account.to_string()))
    }

    /// Debits `from` and credits `recipient`. The mock bank itself performs
    /// no security checks (per spec.md §9: tools are opaque effectful
    /// functions); the allowlist/limit enforcement happens entirely in
    /// `dlm-policy` before this is ever called.
    pub fn send_money(&self, from: &str, recipient: &str, amount: f64) -> Result<(), BankError> {
        let mut state = self.state.lock().expect("mock bank lock poisoned");
        let balance = state
            .balances
            .get(from)
            .copied()
            .ok_or_else(|| BankError::UnknownAccount(from.to_string()))?;
        if balance < amount {
            return Err(BankError::InsufficientFunds { balance, amount });
        }
        *state.balances.get_mut(from).unwrap() -= amount;
        *state.balances.entry(recipient.to_string()).or_insert(0.0) += amount;
        Ok(())
    }
}

impl Default for MockBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_balance_returns_seeded_amount() {
        let bank = MockBank::new();
        assert_eq!(bank.get_balance("CH9300762011623852957").unwrap(), 1810.0);
    }

    #[test]
    fn get_balance_unknown_account_errors() {
        let bank = MockBank::new();
        assert!(matches!(bank.get_balance("nope"), Err(BankError::UnknownAccount(_))));
    }

    #[test]
    fn send_money_moves_balance_between_trusted_accounts() {
        let bank = MockBank::new();
        bank.send_money("CH9300762011623852957", "GB29NWBK60161331926819", 500.0).unwrap();
        assert_eq!(bank.get_balance("CH9300762011623852957").unwrap(), 1310.0);
        assert_eq!(bank.get_balance("GB29NWBK60161331926819").unwrap(), 2310.0);
    }

    #[test]
    fn send_money_insufficient_funds_errors_and_leaves_balances_unchanged() {
        let bank = MockBank::new();
        let err = bank.send_money("CH9300762011623852957", "GB29NWBK60161331926819", 5000.0).unwrap_err();
        assert!(matches!(err, BankError::InsufficientFunds { .. }));
        assert_eq!(bank.get_balance("CH9300762011623852957").unwrap(), 1810.0);
    }
}
