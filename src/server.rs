// Copyright (c) 2026 wspp developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The server registrar: shared configuration, the default application
//! handler and the accept loop that mints sessions.

use crate::logging::{Logging, ALOG_CONNECT, LOG_ERROR};
use crate::session::{Handler, ServerSession, DEFAULT_MAX_MESSAGE_SIZE};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Source of freshly accepted transports.
///
/// The production of sockets stays outside the core; this is the seam
/// through which an acceptor hands them in. Implemented for
/// [`tokio::net::TcpListener`]; tests provide their own.
pub trait Listener {
    /// The transport produced per accepted connection.
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

impl Listener for tokio::net::TcpListener {
    type Conn = tokio::net::TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send {
        async { tokio::net::TcpListener::accept(self).await.map(|(socket, _)| socket) }
    }
}

/// Process-wide holder of shared configuration.
///
/// Created once; every session it mints shares its log filter and picks
/// up the maximum message size current at accept time.
pub struct Server {
    handler: Option<Arc<dyn Handler>>,
    max_message_size: AtomicUsize,
    logging: Arc<Logging>
}

impl Server {
    /// Create a new server with the default application handler.
    ///
    /// Without a handler every valid upgrade is accepted and inbound
    /// messages are dropped; pings are still answered.
    pub fn new(handler: Option<Arc<dyn Handler>>) -> Self {
        Server {
            handler,
            max_message_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
            logging: Arc::new(Logging::new())
        }
    }

    /// The configured maximum size of a complete message.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size.load(Ordering::Relaxed)
    }

    /// Limit the accumulated size of inbound messages.
    ///
    /// Applies to sessions accepted from here on.
    pub fn set_max_message_size(&self, size: usize) {
        self.max_message_size.store(size, Ordering::Relaxed)
    }

    /// Should a message of the given level be written to the error log?
    pub fn test_elog_level(&self, level: u16) -> bool {
        self.logging.test_elog_level(level)
    }

    /// Set the error log threshold.
    pub fn set_elog_level(&self, level: u16) {
        self.logging.set_elog_level(level)
    }

    /// Should a message of the given category be written to the access log?
    pub fn test_alog_level(&self, category: u16) -> bool {
        self.logging.test_alog_level(category)
    }

    /// Enable the given access log categories.
    pub fn set_alog_level(&self, category: u16) {
        self.logging.set_alog_level(category)
    }

    /// Disable the given access log categories.
    pub fn unset_alog_level(&self, category: u16) {
        self.logging.unset_alog_level(category)
    }

    /// Write a message to the error log.
    pub fn log(&self, msg: &str, level: u16) {
        self.logging.log(msg, level)
    }

    /// Write a message to the access log.
    pub fn access_log(&self, msg: &str, category: u16) {
        self.logging.access_log(msg, category)
    }

    /// Mint a session for a freshly accepted transport, bound to the
    /// default handler and the server's configuration.
    pub fn session<T>(&self, socket: T) -> ServerSession<T>
    where
        T: AsyncRead + AsyncWrite + Unpin
    {
        ServerSession::with_config(
            socket,
            self.handler.clone(),
            self.max_message_size(),
            self.logging.clone()
        )
    }

    /// Accept connections indefinitely.
    ///
    /// Each accepted transport becomes a session running on its own
    /// task; each accept arms the next. Returns only when the listener
    /// fails.
    pub async fn start_accept<L: Listener>(&self, mut listener: L) -> io::Result<()> {
        loop {
            let socket = listener.accept().await?;
            self.access_log("client connect accepted", ALOG_CONNECT);
            let session = self.session(socket);
            let logging = self.logging.clone();
            tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    logging.log(&format!("session ended with error: {}", e), LOG_ERROR)
                }
            });
        }
    }
}
