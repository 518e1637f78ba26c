//! Purchases core - trust and identity synchronization for the purchases client SDK
//!
//! This library keeps a client's view of "who the user is" and "what they are
//! entitled to" consistent and trustworthy: response signature verification,
//! per-user subscriber attributes with offline sync, the anonymous/identified
//! identity lifecycle, and coalescing/serial execution primitives.

pub mod attributes;
pub mod backend;
pub mod cache;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod customer_info;
pub mod error;
pub mod id;
pub mod identity;
pub mod logging;
pub mod serial;
pub mod storage;
pub mod verification;

pub use client::{Purchases, PurchasesOptions};
pub use customer_info::CustomerInfo;
pub use error::{PurchasesError, PurchasesErrorCode, Result};
pub use verification::{VerificationMode, VerificationResult};
