/*!
 * dropbus Core
 *
 * This crate provides the shared foundations of dropbus: primitive bus
 * types, configuration, the event bus, logging and randomness sources.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod logging;
pub mod prelude;
pub mod types;

/// dropbus core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("dropbus core {} initialized", VERSION);
    Ok(())
}
