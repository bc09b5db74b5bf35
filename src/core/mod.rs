//! Core module containing the bus engine
//!
//! This module provides:
//! - Transport layer for half-duplex serial lines (RS-485, USB adapters)
//! - Timing derived from channel parameters (inter-frame silence)
//! - Frame assembly from inter-frame silence and protocol boundaries
//! - Transaction controller serializing exchanges on one bus
//! - Retry and timeout policy
//! - Poll batches
//! - Traffic logging with timestamps
//! - Simulated bus with scripted devices

pub mod batch;
pub mod logger;
pub mod protocol;
pub mod retry;
pub mod simulator;
pub mod timing;
pub mod transaction;
pub mod transport;
