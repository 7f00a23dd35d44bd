pub mod app;
pub mod backup;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod extract;
pub mod fomod;
pub mod game;
pub mod installer;
pub mod library;
pub mod logging;
pub mod paths;
pub mod plugins;
pub mod profile;
pub mod resolve;

pub use app::App;
pub use error::{Error, Result, SortError, ValidationError};
