// src/cli/handlers/mod.rs

//! One module per CLI action.

pub mod commons;
pub mod escape;
pub mod run;
pub mod shell;
pub mod which;
