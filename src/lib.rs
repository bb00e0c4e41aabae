//! docrelay - durable cross-process pub/sub
//!
//! A process broadcasts by inserting a message into a shared document store.
//! Every process running a `Relay` tails that store through a background
//! listener and redelivers each message to its local subscribers.

pub mod config;
pub mod dispatch;
pub mod listener;
pub mod observe;
pub mod registry;
pub mod relay;
pub mod store;
pub mod utils;

pub use config::RelayConfig;
pub use dispatch::{DispatchContext, SerialExecutor};
pub use listener::{Listener, ListenerState, SourceKind};
pub use registry::{Callback, Membership, OnSubscribed, SubscriberRegistry};
pub use relay::{Relay, RelayError};
pub use store::{connect_store, MessageStore, StoreError};
