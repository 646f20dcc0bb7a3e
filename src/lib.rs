//! Scalping engine for short-duration UP/DOWN binary prediction markets.
//!
//! One market at a time: discover the active 15-minute window, quote a fair
//! value from the live spot stream, scalp inside the entry band with a paired
//! profit-taker, guard the position with a high-frequency stop-loss monitor,
//! and rotate cleanly into the next window.

pub mod config;
pub mod engine;
pub mod models;
pub mod scrapers;
