//! WebSocket transport and binary game protocol

pub mod handler;
pub mod protocol;
pub mod session;
