//! pushfeed-client: streaming exchange client
//!
//! Keeps one websocket session alive across reconnects, replays the desired
//! subscriptions, correlates commands with replies, maintains verified order
//! books and fans payloads out to user callbacks off the read path.

pub mod auth;
pub mod backoff;
pub mod books;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod metrics;
pub mod orders;
pub mod registry;
pub mod rest;
pub mod shutdown;
pub mod subscription;
pub mod topics;
pub mod transport;

pub use auth::{AuthError, Credentials};
pub use books::{BookEvent, BookManager};
pub use client::{ClientBuilder, StreamClient};
pub use config::{ClientConfig, ConfigError, DispatchConfig, Endpoint};
pub use dispatch::{DispatchError, OverflowPolicy};
pub use error::ClientError;
pub use frame::{Arg, Command, EventFrame, Frame, OpReply, PushFrame};
pub use handlers::Handlers;
pub use metrics::{encode_metrics, ClientMetrics};
pub use orders::{AmendOrder, CancelOrder, PlaceOrder, MAX_BATCH_OPS};
pub use rest::{HttpRestClient, RestApi};
pub use topics::{Ticker, TopicKind, Trade};
pub use transport::{Dialer, TungsteniteDialer};

pub use pushfeed_book::{BookError, BookSnapshot, Level};
