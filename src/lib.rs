#![allow(clippy::derive_partial_eq_without_eq)]

pub mod anr;
pub mod bugreport;
pub mod config;
pub mod error;
pub mod inspector;
pub mod lines;
pub mod logcat;
pub mod report;
pub mod stacks;
