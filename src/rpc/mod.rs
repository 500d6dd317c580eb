//! Request/response coordination on top of the Pub/Sub primitives: a
//! correlation map and direct reply-to consumer for the client, and a
//! command registry with the same ack/retry/DLQ discipline as the
//! Subscriber for the server.

pub mod client;
pub mod server;

pub use client::{RpcClient, RpcClientOptions, SendOptions};
pub use server::{RpcServer, RpcServerOptions};
