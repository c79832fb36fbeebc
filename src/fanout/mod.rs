//! Status fan-out — one subscriber registry fed by a store diff-poll, served
//! over three transports.
//!
//! - `registry` — `StatusHub`: subscribers, ticker, snapshots
//! - `ws` — push stream (WebSocket)
//! - `poll` — long poll
//! - `stream` — server stream for one task or batch

pub mod model;
pub mod poll;
pub mod registry;
pub mod stream;
pub mod ws;

pub use model::{ClientMessage, ServerMessage, StatusUpdate, SubscriptionFilter};
pub use poll::{PollResponse, long_poll};
pub use registry::StatusHub;
pub use stream::{WatchTarget, watch};
pub use ws::serve_socket;
