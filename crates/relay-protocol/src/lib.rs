//! Wire protocol shared by the relay signaling server and its clients.
//!
//! Every frame is a JSON object `{ "type": ..., "data": ... }`.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
