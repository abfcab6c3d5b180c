/*!
 * Prelude module for dropbus core.
 *
 * Re-exports the types most bus code needs.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{Address, DriverClass, RollingCounter, SerialNumber};

pub use crate::event::{EventBus, SharedEventBus};

pub use crate::config::{BusConfig, Config, ConfigBuilder, SharedConfig};

pub use crate::identity::{RandomSource, ScriptedRandom, StdRandom};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
