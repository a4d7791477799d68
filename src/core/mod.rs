//! Value types, configuration and constants shared by every other module

pub mod config;
pub mod constants;
pub mod geo;
