//! Network transports.

pub mod websocket;
