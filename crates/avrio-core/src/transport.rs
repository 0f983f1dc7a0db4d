//! Byte transport capability.
//!
//! The engine never accepts an untyped handle: a channel owns either a
//! [`Duplex`] byte pair or, for stateless channels, a [`Factory`] producing a
//! fresh pair per call. Transport creation, socket-level retries and TLS are
//! the caller's responsibility.

use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// Size of the in-memory pipe used by [`Duplex::pair`].
const PAIR_CAPACITY: usize = 64 * 1024;

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A readable/writable byte pair owned by exactly one channel or connection.
pub struct Duplex {
    pub(crate) reader: ByteReader,
    pub(crate) writer: ByteWriter,
}

impl Duplex {
    /// Split a bidirectional stream (TCP socket, unix socket, ...) into a
    /// transport.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Build a transport from independent read and write halves.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Two transports joined by an in-memory pipe, one per peer.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PAIR_CAPACITY);
        (Self::new(a), Self::new(b))
    }

    pub(crate) fn into_parts(self) -> (ByteReader, ByteWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex").finish_non_exhaustive()
    }
}

/// Factory producing one fresh transport per stateless call.
pub type Factory = Box<dyn Fn() -> BoxFuture<'static, io::Result<Duplex>> + Send + Sync>;

/// Wrap a closure producing transports into a [`Factory`].
pub fn factory<F, Fut>(f: F) -> Factory
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = io::Result<Duplex>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}
