//! # Assessment Module
//!
//! Reconciles the agent's asynchronous structured updates into one session record.
//!
//! - **model**: dimensions, evidence, contradictions, score history
//! - **patch**: tolerant parsing of tool-call arguments
//! - **store**: append-only, merge-based application of patches

pub mod model;
pub mod patch;
pub mod store;
