//! Differential privacy: budget accounting and the Gaussian mechanism.

mod budget;
mod noise;

pub use budget::{BudgetAccountant, BudgetCharge, PrivacyLedgerEntry};
pub use noise::{NoiseMechanism, NoiseReport};
