//! Length-prefixed JSON-RPC 2.0 plumbing for supervised worker processes.
//!
//! Frames are a 4-byte big-endian length followed by a UTF-8 JSON payload,
//! capped at [`MAX_FRAME_LEN`]. On top of the framing this crate provides:
//!
//! - [`RequestTable`]: in-flight request bookkeeping with exactly-once completion
//! - [`RpcClient`]: lazily connecting client with per-call timeouts
//! - [`Dispatcher`]: method registry that serves requests on the worker side
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(unix)]
//! # async fn example() -> Result<(), sidecar_rpc::RpcError> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sidecar_rpc::{RpcClient, RpcClientConfig, UnixSocketConnector};
//!
//! let connector = Arc::new(UnixSocketConnector::new("/tmp/sidecar-501/server.sock"));
//! let client = RpcClient::new(connector, RpcClientConfig::default());
//! let pong = client.call("ping", None, Some(Duration::from_secs(2))).await?;
//! println!("{pong}");
//! # Ok(())
//! # }
//! ```

mod client;
mod connector;
mod error;
mod framing;
mod request_table;
mod server;
mod types;

pub use client::{RpcClient, RpcClientConfig};
pub use connector::{BoxedReader, BoxedWriter, Connector, TcpConnector};
#[cfg(unix)]
pub use connector::UnixSocketConnector;
pub use error::{FrameError, RpcError};
pub use framing::{FrameDecoder, FramedWriter, MAX_FRAME_LEN, encode_frame, read_frames};
pub use request_table::{PendingResult, RequestTable};
pub use server::{Dispatcher, MethodResult, serve_connection};
#[cfg(unix)]
pub use server::serve_unix;
pub use types::*;
