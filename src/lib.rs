pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod pool;
pub mod reporter;
pub mod transport;
pub mod txn;
pub mod verdict;

pub use crate::error::{Error, ErrorKind, Result};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Installs the global `tracing` subscriber. Called once, early in `main`.
pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(max_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}
