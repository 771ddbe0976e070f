//! Shared test helpers.

pub mod helper;
