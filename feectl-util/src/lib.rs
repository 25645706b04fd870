//! Process level utilities for the fee policy control plane

#![forbid(unsafe_code)]

pub mod config;
pub mod env_var;
pub mod observability;

pub use env_var::*;
