//! Telecom invoice intake and report governance.
//!
//! Uploaded carrier invoices are fingerprinted, stored, and run through an
//! extractor. Confident results become PENDING reports straight away; the
//! rest wait for a human in the review queue. Reports then move through an
//! audited approval workflow.

pub mod bridge;
pub mod categories;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extraction;
pub mod governance;
pub mod intake;
pub mod model;
pub mod reconciler;
pub mod scanner;
pub mod storage;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Result, WorkflowError};
