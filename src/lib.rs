pub mod activity;
pub mod app;
pub mod builder;
pub mod cli;
pub mod composite;
pub mod config;
pub mod error;
pub mod kernel;
pub mod model;
pub mod output;
pub mod runner;
pub mod time;
pub mod version;

pub use error::{Error, Result};
