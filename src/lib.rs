#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

//! Client runtime for the Realtime Messaging (ORTC) pub/sub service.
//!
//! A client connects to a messaging cluster (resolving the concrete service
//! node through an HTTP balancer), validates itself with an application key
//! and a permissions token, and then subscribes to named channels, publishes
//! to them, and receives pushed messages, all over a single WebSocket that
//! a background driver task owns. Connection loss feeds an indefinite
//! reconnect loop that re-validates and re-subscribes; liveness is watched
//! through the service's heartbeat frames.
//!
//! Everything observable flows through [`EventStreams`]: lifecycle
//! transitions, subscription acknowledgements, delivered messages and every
//! reportable error.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use ortc::OrtcClient;
//!
//! # async fn run() {
//! let (client, mut events) = OrtcClient::new();
//! client.connect(
//!     "YOUR_APPLICATION_KEY",
//!     "myToken",
//!     "RustApp",
//!     "http://ortc-developers.realtime.co/server/2.1",
//!     true,
//!     false,
//! );
//! events.connected.next().await;
//!
//! let mut my_channel = client.subscribe("my_channel", true);
//! client.send("my_channel", "Hello World!");
//! while let Some(message) = my_channel.next().await {
//!     println!("{}: {}", message.channel, message.payload);
//! }
//! # }
//! ```
//!
//! The out-of-band REST surface (persisting a token's channel permissions,
//! querying or toggling presence) lives in [`rest`].

mod client;
pub use client::{ChannelMessage, ClientOptions, EventStreams, OrtcClient};

mod errors;
pub use errors::OrtcError;

mod protocol;

pub mod rest;
pub use rest::{
    authentication::{save_authentication, ChannelPermission},
    presence::{disable_presence, enable_presence, presence, PresenceData},
};

mod utils;
