#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

//! Scoped-resource guards and function wrappers.
//!
//! `wrapkit_core` provides:
//! - synchronous scoped resources (transactional database, plain file) via [`scoped`]
//! - an asynchronous scoped network session via [`session`]
//! - a constant-delay retry wrapper via [`retry`]
//! - an asynchronous call-logging wrapper via [`logging`]
//! - a bounded memoizing wrapper via [`memo`]
//! - shared configuration and output types via [`types`]
//!
//! None of these depend on each other.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use wrapkit_core::memo::memoize;
//! use wrapkit_core::retry::Retry;
//!
//! let mut square = memoize(|n: u64| n * n);
//! assert_eq!(square.call(12), 144);
//! assert_eq!(square.call(12), 144);
//! assert_eq!(square.stats().misses, 1);
//!
//! let mut attempts = 0;
//! let value: Result<u32, String> = Retry::new(3, Duration::ZERO).call(|| {
//!     attempts += 1;
//!     if attempts < 3 { Err(format!("attempt {attempts} failed")) } else { Ok(7) }
//! });
//! assert_eq!(value, Ok(7));
//! ```

pub mod logging;
pub mod memo;
pub mod retry;
pub mod scoped;
pub mod session;
pub mod types;

#[cfg(feature = "sqlite")]
pub use rusqlite;
