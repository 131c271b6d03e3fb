//! SFU coordination: worker pool, capability negotiation, transport lifecycle
//! and the session registry shared by every connection.

mod capabilities;
mod session;
mod transport;
mod workers;

pub use capabilities::CapabilityNegotiator;
pub use session::{ReleasedConnection, SessionRegistry};
pub use transport::{BitrateCapOutcome, CreatedTransport, TransportManager};
pub use workers::WorkerPool;
