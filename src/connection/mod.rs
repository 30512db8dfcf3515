//! Managed connections: one per backend instance.

mod managed;
mod state;

pub(crate) use managed::ManagedConnection;
pub use state::{ConnectionState, ConnectionStats};
