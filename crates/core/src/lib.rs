//! Domain layer for the payment webhook processor.
//!
//! Everything in this crate is pure: signature verification, payload
//! parsing, and the order status transition table perform no I/O and can
//! be tested without a database or HTTP stack.

pub mod event;
pub mod signature;
pub mod transition;
pub mod types;
