//! Networking module - the acceptor and the per-connection state machine.

mod acceptor;
mod connection;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use connection::{
    CloseCallback, ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
