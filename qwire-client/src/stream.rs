//! Client stream abstraction over the supported transports.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio_rustls::client::TlsStream as ClientTlsStream;

/// Any byte stream usable as a transport.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pin_project! {
    /// A client stream: plain TCP, TLS, a child process's stdio, or any other
    /// transport supplied by the caller.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
        Pipe {
            #[pin] reader: ChildStdout,
            #[pin] writer: ChildStdin,
            // Held so the child lives (and is killed) with the stream.
            child: Child,
        },
        Boxed { stream: Box<dyn Transport> },
    }
}

impl ClientStream {
    /// Wraps a caller-supplied transport.
    pub fn boxed(stream: impl Transport) -> Self {
        ClientStream::Boxed {
            stream: Box::new(stream),
        }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }

    /// Returns a short transport name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientStream::Plain { .. } => "tcp",
            ClientStream::Tls { .. } => "tls",
            ClientStream::Pipe { .. } => "pipe",
            ClientStream::Boxed { .. } => "custom",
        }
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("kind", &self.kind())
            .finish()
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Pipe { reader, .. } => reader.poll_read(cx, buf),
            ClientStreamProj::Boxed { stream } => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Pipe { writer, .. } => writer.poll_write(cx, buf),
            ClientStreamProj::Boxed { stream } => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
            ClientStreamProj::Pipe { writer, .. } => writer.poll_flush(cx),
            ClientStreamProj::Boxed { stream } => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Pipe { writer, .. } => writer.poll_shutdown(cx),
            ClientStreamProj::Boxed { stream } => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
