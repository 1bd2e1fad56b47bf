// src/core/mod.rs

//! Composition root and configuration.

pub mod paths;
pub mod service;
pub mod settings;
