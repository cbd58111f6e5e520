pub mod config;
pub mod error;
pub mod matrix;
pub mod metrics;
pub mod server;
pub mod utils;

pub use ::http;
pub use ::ruma;
pub use ::tracing;
pub use config::Config;
pub use error::Error;
pub use matrix::Events;
pub use server::Server;
pub use tracing::{debug, error, info, trace, warn};
pub use utils::{result, result::Result};

pub use crate as asmux_core;
