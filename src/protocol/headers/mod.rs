//! TCP header definition, parsing and serialization.

mod tcp;

pub use tcp::{TcpHeader, TcpOptions};
