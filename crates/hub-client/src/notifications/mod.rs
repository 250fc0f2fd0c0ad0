//! Realtime notifications: the push channel and the list it feeds.

mod backoff;
mod channel;
mod envelope;
mod model;
mod store;
mod transport;

pub use backoff::{ReconnectPolicy, ReconnectState};
pub use channel::{ChannelEvent, ChannelState, NotificationChannel};
pub use envelope::{ClientMessage, PushEnvelope};
pub use model::{Notification, NotificationId};
pub use store::NotificationStore;
pub use transport::{Incoming, PushConnection, PushTransport, WsTransport};
