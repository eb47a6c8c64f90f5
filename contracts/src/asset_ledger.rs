//! # Asset Ledger
//!
//! Balances for the deposit asset and every destination asset the bridge
//! issues. Depositors pledge the deposit asset into escrow at submission;
//! on settlement the bridge issues the market's destination asset to them;
//! on refund the escrow is handed back.
//!
//! ## Accounts
//!
//! Balances are keyed by `(symbol, holder)`. Each key is its own `DashMap`
//! entry, so debits from unrelated holders never contend.
//!
//! Escrow custody is a separate counter rather than a named account. No
//! holder string can address it, so a pledge always debits the depositor.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during asset operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    /// The holder does not have enough of the asset.
    #[error("insufficient {symbol} balance: has {balance}, needs {required}")]
    InsufficientBalance {
        /// Asset symbol.
        symbol: String,
        /// Current balance of the holder.
        balance: u128,
        /// Amount the operation needed.
        required: u128,
    },

    /// Supply or a balance would exceed `u128::MAX`.
    #[error("{symbol} supply overflow: adding {amount}")]
    SupplyOverflow {
        /// Asset symbol.
        symbol: String,
        /// The amount that was attempted.
        amount: u128,
    },

    /// A release asked for more than escrow custody holds.
    #[error("escrow holds {held}, cannot release {required}")]
    EscrowShortfall { held: u128, required: u128 },

    /// The issuing side could not be reached.
    #[error("issuance unavailable: {0}")]
    Unavailable(String),
}

/// Issues destination assets. The escrow ledger calls this only after it has
/// committed the intent to `Executed`.
pub trait DestinationIssuer: Send + Sync {
    fn issue(&self, symbol: &str, to: &str, amount: u128) -> Result<(), AssetError>;
}

/// Supply summary for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSupply {
    pub symbol: String,
    pub total_supply: u128,
}

/// In-memory multi-asset balance book.
#[derive(Debug)]
pub struct AssetLedger {
    deposit_symbol: String,
    balances: DashMap<(String, String), u128>,
    supplies: DashMap<String, u128>,
    escrow: Mutex<u128>,
}

impl AssetLedger {
    /// Creates an empty ledger whose deposit asset is `deposit_symbol`.
    pub fn new(deposit_symbol: impl Into<String>) -> Self {
        Self {
            deposit_symbol: deposit_symbol.into().to_uppercase(),
            balances: DashMap::new(),
            supplies: DashMap::new(),
            escrow: Mutex::new(0),
        }
    }

    pub fn deposit_symbol(&self) -> &str {
        &self.deposit_symbol
    }

    /// Mints `amount` of the deposit asset to `holder`. Devnet seeding only.
    pub fn fund(&self, holder: &str, amount: u128) -> Result<(), AssetError> {
        let symbol = self.deposit_symbol.clone();
        self.mint(&symbol, holder, amount)
    }

    /// Moves `amount` of the deposit asset from `depositor` into escrow.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::InsufficientBalance`] if the depositor cannot
    /// cover it; nothing moves in that case.
    pub fn escrow_deposit(&self, depositor: &str, amount: u128) -> Result<(), AssetError> {
        let symbol = self.deposit_symbol.clone();
        let mut balance = self
            .balances
            .entry((symbol.clone(), depositor.to_string()))
            .or_insert(0);
        if *balance < amount {
            return Err(AssetError::InsufficientBalance {
                symbol,
                balance: *balance,
                required: amount,
            });
        }
        let mut escrow = self.escrow.lock();
        // Cannot overflow: escrow only ever holds amounts debited from
        // balances, and their sum is bounded by the deposit supply.
        *escrow = escrow.saturating_add(amount);
        *balance -= amount;
        Ok(())
    }

    /// Returns `amount` of escrowed deposit asset to `depositor`.
    pub fn release_escrow(&self, depositor: &str, amount: u128) -> Result<(), AssetError> {
        {
            let mut escrow = self.escrow.lock();
            if *escrow < amount {
                return Err(AssetError::EscrowShortfall {
                    held: *escrow,
                    required: amount,
                });
            }
            *escrow -= amount;
        }
        let mut balance = self
            .balances
            .entry((self.deposit_symbol.clone(), depositor.to_string()))
            .or_insert(0);
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    /// Total deposit asset currently held in escrow.
    pub fn escrowed(&self) -> u128 {
        *self.escrow.lock()
    }

    /// Returns the balance of `holder` for `symbol`, or 0.
    pub fn balance_of(&self, symbol: &str, holder: &str) -> u128 {
        self.balances
            .get(&(symbol.to_uppercase(), holder.to_string()))
            .map(|b| *b)
            .unwrap_or(0)
    }

    /// Returns the total supply of `symbol`, or 0 if never minted.
    pub fn total_supply(&self, symbol: &str) -> u128 {
        self.supplies
            .get(&symbol.to_uppercase())
            .map(|s| *s)
            .unwrap_or(0)
    }

    pub fn supplies(&self) -> Vec<AssetSupply> {
        let mut out: Vec<_> = self
            .supplies
            .iter()
            .map(|e| AssetSupply {
                symbol: e.key().clone(),
                total_supply: *e.value(),
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    fn mint(&self, symbol: &str, to: &str, amount: u128) -> Result<(), AssetError> {
        let symbol = symbol.to_uppercase();
        let overflow = || AssetError::SupplyOverflow {
            symbol: symbol.clone(),
            amount,
        };

        let mut supply = self.supplies.entry(symbol.clone()).or_insert(0);
        let new_supply = supply.checked_add(amount).ok_or_else(overflow)?;

        let mut balance = self.balances.entry((symbol.clone(), to.to_string())).or_insert(0);
        *balance = balance.checked_add(amount).ok_or_else(overflow)?;
        *supply = new_supply;
        Ok(())
    }
}

impl DestinationIssuer for AssetLedger {
    fn issue(&self, symbol: &str, to: &str, amount: u128) -> Result<(), AssetError> {
        self.mint(symbol, to, amount)?;
        tracing::debug!(symbol, to, amount = %amount, "destination asset issued");
        Ok(())
    }
}
