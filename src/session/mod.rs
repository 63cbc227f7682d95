//! # Voice Session
//!
//! One live conversation with the agent, from connect to disconnect.
//!
//! ## Key Components:
//! - **controller**: single-owner session state machine
//! - **monitor**: duration limits and early-exit eligibility
//! - **transcript**: running conversation history
//! - **runtime**: socket, devices, and the event loop
//! - **report**: submission of the finished record

pub mod controller;
pub mod monitor;
pub mod report;
pub mod runtime;
pub mod transcript;
