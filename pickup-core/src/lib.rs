#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod broker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod entities;
pub mod framework;
pub mod lifecycle;
pub mod processors;
pub mod store;
