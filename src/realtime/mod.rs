//! Realtime notification layer: the event vocabulary, the notifier seam used
//! by the fan-out core, and the outbound link to the relay.

pub mod events;
pub mod notifier;
pub mod relay_client;

pub use events::{EventError, Frame, RealtimeEvent, Room};
pub use notifier::{fan_out, Committed, DeliveryReport, MemoryNotifier, Notifier, RelayError};
pub use relay_client::{Backoff, LinkEvent, RelayConnection};
