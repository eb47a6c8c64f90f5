//! # Mintbridge Contracts
//!
//! The escrow ledger the settlement bridge drives, written as in-process
//! contracts with explicit locking where a chain would have given us
//! serialized execution for free:
//!
//! - **Mint Escrow**: the intent state machine: submit, compliance-gated
//!   execute under a daily issuance cap, refund.
//! - **Access Control**: role grants checked against a presented
//!   credential on every privileged call.
//! - **Compliance**: the oracle interface and a policy-driven registry.
//! - **Asset Ledger**: deposit-asset escrow and destination-asset issuance.
//!
//! ## Design Principles
//!
//! 1. All monetary operations check for overflow. Amounts are `u128`
//!    smallest units.
//! 2. State transitions are explicit enum variants, never boolean flags.
//! 3. Role checks gate every privileged operation.
//! 4. Authoritative state is journaled and mutated before any outbound call.

pub mod access;
pub mod asset_ledger;
pub mod compliance;
pub mod mint_escrow;

pub use access::{AccessControl, Credential, Role};
pub use asset_ledger::{AssetLedger, DestinationIssuer};
pub use compliance::{ComplianceOracle, ComplianceRecord, ComplianceRegistry};
pub use mint_escrow::{EscrowClient, EscrowSettings, MintEscrow, RestoreError};
