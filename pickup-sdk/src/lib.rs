//! Wire types for pickup-point order events.
//!
//! Everything a downstream subscriber (notifications, analytics) needs to
//! decode broker messages lives here, without pulling in the database stack.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod objects;
