//! Network Layer
//!
//! Broadcast transports and seat identity. Nothing here knows the game rules;
//! events are routed as opaque payloads.

pub mod broadcast;
pub mod identity;
pub mod protocol;
pub mod relay;
pub mod ws_client;

pub use broadcast::{BroadcastError, Broadcaster, ClientId, HubClient, LocalHub, Subscription};
pub use identity::{IdentityConfig, IdentityError, SeatIdentity, SeatTokenIssuer};
pub use protocol::{RelayClientMessage, RelayServerMessage};
pub use relay::{RelayConfig, RelayServer, RelayServerError};
pub use ws_client::WsBroadcaster;
