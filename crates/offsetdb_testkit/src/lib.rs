//! # OffsetDB Testkit
//!
//! Test utilities for OffsetDB.
//!
//! This crate provides:
//! - Sample record kinds and temp-dir index fixtures
//! - Property-based test generators using proptest
//! - Cross-crate integration scenarios
//! - Concurrency stress helpers
//!
//! ## Usage
//!
//! ```rust
//! use offsetdb_testkit::prelude::*;
//!
//! with_temp_index(|index| {
//!     index.put(1, TestPart::price(7, 1250)).unwrap();
//!     index.flush(1).unwrap();
//!     assert!(index.get(1, TestPart::price_key(7)).unwrap().is_some());
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
