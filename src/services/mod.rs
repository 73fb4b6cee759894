pub mod client;
pub mod discovery;
pub mod error;
pub mod resolver;
pub(crate) mod task;

pub use client::{ClientConnection, ClientFactory};
pub use discovery::{Registry, ServiceManager, ServiceRecord, WatchStream, new_registry};
pub use error::{DiscoveryError, Result};
