//! Local SOCKS5 proxy
//!
//! This module provides the SOCKS5 server that lets local applications
//! route their TCP traffic through the active remote transport.

mod server;
mod socks5;

pub use server::{ProxyState, Socks5Server, StopHandle};
