//! Round lifecycle: the coordinator that ties selection, privacy, proofs,
//! sealing and aggregation together.

pub mod coordinator;
pub use coordinator::{CoordinatorBuilder, RoundCoordinator, RoundTicket, SubmissionReceipt};
