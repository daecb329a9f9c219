//! A connection-oriented, reliable byte-stream transport over an
//! IPv6-style datagram layer, based on [RFC 793].
//!
//! The crate centers on a per-connection finite state machine driven by
//! three serialized event sources: blocking user calls, timer expirations
//! and inbound segments delivered by an event-loop task. Connections are
//! caller-owned [TcpSocket] values on top of a [TcpStack], which bundles
//! the timer service, the receive-buffer pool and the network-layer
//! handle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcp_stack::{Config, Endpoint, MemLink, TcpSocket, TcpStack};
//!
//! let (link, _peer) = MemLink::pair(
//!     "fc00::1".parse().unwrap(),
//!     "fc00::2".parse().unwrap(),
//! );
//! let stack = TcpStack::new(Arc::new(link), Config::default());
//!
//! let socket = TcpSocket::new(&stack);
//! socket.open_active(&"[fc00::2]:7777".parse::<Endpoint>().unwrap(), 0)?;
//! socket.send(b"hello", None)?;
//! socket.close();
//! # Ok::<(), tcp_stack::Error>(())
//! ```
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod config;
pub use config::Config;

pub mod error;
pub use error::{Error, ParseError, Result};

mod eventloop;
mod mailbox;
mod rcvbuf;
mod timer;

pub mod net;
pub use net::{Datagram, MemLink, NetLayer};

pub mod protocol;
pub use protocol::socket::{AddrFamily, Endpoint, Socket, SocketAddr};
pub use protocol::tcb::State;

mod sock;
pub use sock::TcpSocket;

mod stack;
pub use stack::TcpStack;
