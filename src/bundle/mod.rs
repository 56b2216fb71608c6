//! Bundle construction, simulation and submission
//!
//! The assembler turns an allocation plan into an ordered, signed bundle
//! with risk-adapted gas; the simulator validates it against the relay's
//! simulation endpoint; the submission controller drives the bundle state
//! machine across a bounded window of target blocks.

pub mod assembler;
pub mod simulation;
pub mod submission;

pub use assembler::{BundleAssembler, FlashLoanCalls, FlashLoanProvider};
pub use simulation::BundleSimulator;
pub use submission::{SubmissionController, SubmissionOutcome};
