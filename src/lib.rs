//! Checkpointed, rate-limit tolerant batch scoring of images against a
//! vision-language model.
//!
//! The [`orchestrator::PoolManager`] pulls image paths lazily from an
//! [`source::ImageSource`], bounds in-flight requests with an
//! [`admission::AdmissionController`], retries transient failures through
//! the [`state_machine`] and writes one atomic JSON record per image via
//! [`checkpoint::CheckpointStore`], so an interrupted run resumes where it
//! stopped.

pub mod admission;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod scoring;
pub mod source;
pub mod state_machine;
pub mod ui;
