// Copyright (c) 2026 wspp developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A server-side implementation of the [RFC6455][rfc6455] websocket
//! protocol: opening handshake validation and response, base framing,
//! and a per-connection session state machine which delivers lifecycle
//! events to an application-supplied [`Handler`].
//!
//! Sessions speak protocol versions 7, 8 and 13. The transport is any
//! `AsyncRead + AsyncWrite` byte stream; accepting connections is left
//! to a [`Listener`], implemented for [`tokio::net::TcpListener`].
//!
//! # Example: an echo server
//!
//! ```no_run
//! use std::sync::Arc;
//! use wspp::{Data, Handler, Server, Session};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, session: &mut Session, data: Data) {
//!         let _ = match data {
//!             Data::Text(text) => session.send_text(String::from_utf8_lossy(&text)),
//!             Data::Binary(bytes) => session.send_binary(bytes)
//!         };
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9001").await?;
//!     let server = Server::new(Some(Arc::new(Echo)));
//!     server.start_accept(listener).await
//! }
//! ```
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

#![forbid(unsafe_code)]

pub mod base;
pub mod data;
pub mod handshake;
pub mod logging;
pub mod server;
pub mod session;
pub mod utf8;

#[cfg(test)]
mod tests;

pub use base::{Codec, Frame, Mode, OpCode};
pub use data::Data;
pub use handshake::{Rejection, Request};
pub use logging::Logging;
pub use server::{Listener, Server};
pub use session::{CloseCode, Error, Handler, ServerSession, Session, State, DEFAULT_MAX_MESSAGE_SIZE};
