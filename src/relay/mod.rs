//! The relay process: a room-addressed websocket broadcast bus with no
//! durable state and no domain knowledge.

pub mod hub;
pub mod server;

pub use hub::{Dispatch, PeerId, RelayHub};
pub use server::{relay_router, serve, RelayState};
