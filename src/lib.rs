//! relaymq - a minimal exact-topic publish/subscribe broker.
//!
//! Speaks an MQTT 3.1.1 framing subset over TCP: CONNECT, SUBSCRIBE,
//! PUBLISH (QoS 0 only), PINGREQ and DISCONNECT. Subscriptions match topic
//! strings exactly (no wildcards, no hierarchy); published messages fan out
//! best-effort to the subscribers registered at publish time. Operational
//! counters are exposed over a read-only HTTP endpoint.

pub mod client;
pub mod client_handle;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod packet;
pub mod server;
pub mod shared;
pub mod subscription;
pub mod worker;

mod write_buffer;
