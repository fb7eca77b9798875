#![forbid(unsafe_code)]

//! Scripted scanner-settings session driven through Scanflow.
//!
//! Devices, option lists, and saved preferences live in versioned
//! containers. Toolbar and device commands route through a router chain,
//! and observers keep the option panel and status line current.

pub mod app;
pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod model;
pub mod observers;
pub mod views;

pub use cli::{Cli, run, run_from_env};
pub use error::{DemoError, Result};
