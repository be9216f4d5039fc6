//! Utils module - utility functions and helpers

pub mod logging;
