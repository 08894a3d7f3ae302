// Copyright 2026 the Cinder authors. MIT license.

//! RFC 6455 WebSockets for Cinder: the frame codec, the shared open/close/
//! ping/pong state machine, the client handshake riding on the HTTP
//! client, and a server with origin, extension and subprotocol
//! negotiation.

mod client;
mod error;
mod extension;
mod frame;
mod handshake;
mod protocol;
mod server;

pub use crate::client::connect;
pub use crate::client::ConnectOptions;
pub use crate::error::ConnectionClosed;
pub use crate::error::WebSocketError;
pub use crate::extension::WebSocketExtension;
pub use crate::frame::apply_mask;
pub use crate::frame::WebSocketFrame;
pub use crate::frame::OP_BINARY;
pub use crate::frame::OP_CLOSE;
pub use crate::frame::OP_CONTINUOUS;
pub use crate::frame::OP_PING;
pub use crate::frame::OP_PONG;
pub use crate::frame::OP_TEXT;
pub use crate::handshake::accept_key;
pub use crate::handshake::WEBSOCKET_GUID;
pub use crate::protocol::Message;
pub use crate::protocol::WebSocket;
pub use crate::protocol::DEFAULT_CLOSE_TIMEOUT;
pub use crate::protocol::DEFAULT_MAX_SIZE;
pub use crate::server::Handler;
pub use crate::server::RequestProcessor;
pub use crate::server::ServerOptions;
pub use crate::server::SubprotocolSelector;
pub use crate::server::WebSocketServer;
