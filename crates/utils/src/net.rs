/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fmt, io, pin::Pin, task::Poll, time::Duration};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Error kinds a [`Conn`] operation can raise. Distinct from the SMTP-level
/// error kinds reported to the peer over SMTP — this is the transport layer only.
#[derive(Debug)]
pub enum Error {
    /// The peer half-closed (or fully closed) the connection before the
    /// requested delimiter was seen.
    Closed,
    /// `max` bytes were read without encountering the delimiter.
    LimitExceeded,
    Io(io::Error),
    TlsHandshake(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "connection closed by peer"),
            Error::LimitExceeded => write!(f, "read limit exceeded before delimiter"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::TlsHandshake(e) => write!(f, "tls handshake failed: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Any full-duplex byte stream a [`Conn`] can wrap: a bare TCP socket, or
/// (post-upgrade) a TLS stream over one.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

enum Inner {
    Plain(Box<dyn Io>),
    Tls(Box<TlsStream<Box<dyn Io>>>),
}

impl AsyncRead for Inner {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Inner::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Inner {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Inner::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Inner::Plain(s) => Pin::new(s).poll_flush(cx),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Inner::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A framed, optionally-TLS connection. Every SMTP role (server session,
/// client session) reads and writes through this type so the session state
/// machines never touch a raw socket or a TLS type directly.
pub struct Conn {
    inner: Inner,
    /// Bytes read past the delimiter on the previous call, held for the
    /// next read (DATA is read line-by-line but the peer may pipeline).
    pending: Vec<u8>,
    pub timeout: Duration,
    tls: bool,
}

impl Conn {
    pub fn plain<T: Io + 'static>(stream: T, timeout: Duration) -> Self {
        Conn {
            inner: Inner::Plain(Box::new(stream)),
            pending: Vec::new(),
            timeout,
            tls: false,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Reads until `delim` is seen (inclusive in the underlying stream, but
    /// excluded from the returned bytes), respecting an inactivity
    /// deadline and a hard byte cap `max`.
    pub async fn read_to_delim(&mut self, delim: &[u8], max: usize) -> Result<Vec<u8>, Error> {
        debug_assert!(!delim.is_empty());
        let mut out = std::mem::take(&mut self.pending);

        loop {
            if let Some(pos) = find_subslice(&out, delim) {
                // `max` bounds content before the delimiter, not the
                // delimiter's own bytes: content of exactly `max` octets is
                // accepted even though `out` (content + delimiter) exceeds
                // `max` at this point.
                if pos > max {
                    self.pending = out;
                    return Err(Error::LimitExceeded);
                }
                let rest = out.split_off(pos + delim.len());
                out.truncate(pos);
                self.pending = rest;
                return Ok(out);
            }
            if out.len() > max {
                // Bytes already pulled off the wire still need a home: the
                // delimiter may be further in, and a caller that wants to
                // resynchronize (e.g. `discard_to_delim`) must see them.
                self.pending = out;
                return Err(Error::LimitExceeded);
            }

            let mut chunk = [0u8; 8192];
            let n = tokio::time::timeout(self.timeout, self.inner.read_buf_into(&mut chunk))
            .await
            .map_err(|_| Error::Closed)??;
            if n == 0 {
                return Err(Error::Closed);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads and discards bytes until `delim` is seen, with no size bound.
    /// Used after a [`Error::LimitExceeded`] from [`Self::read_to_delim`] to
    /// resynchronize the stream at the next command boundary instead of
    /// leaving unread oversized payload in front of the peer's next line.
    pub async fn discard_to_delim(&mut self, delim: &[u8]) -> Result<(), Error> {
        let mut tail = std::mem::take(&mut self.pending);
        loop {
            if let Some(pos) = find_subslice(&tail, delim) {
                self.pending = tail.split_off(pos + delim.len());
                return Ok(());
            }
            // Keep only enough of the tail to still detect a delimiter that
            // straddles a chunk boundary; drop the rest to bound memory use.
            if tail.len() > delim.len() {
                tail.drain(..tail.len() - (delim.len() - 1));
            }

            let mut chunk = [0u8; 8192];
            let n = tokio::time::timeout(self.timeout, self.inner.read_buf_into(&mut chunk))
            .await
            .map_err(|_| Error::Closed)??;
            if n == 0 {
                return Err(Error::Closed);
            }
            tail.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        AsyncWriteExt::write_all(&mut self.inner, bytes).await?;
        AsyncWriteExt::flush(&mut self.inner).await?;
        Ok(())
    }

    /// Server-side TLS handshake in place: on success every subsequent read
    /// and write is encrypted.
    pub async fn upgrade_server(&mut self, acceptor: &TlsAcceptor) -> Result<(), Error> {
        let plain = match std::mem::replace(&mut self.inner, Inner::Plain(Box::new(Null))) {
            Inner::Plain(s) => s,
            Inner::Tls(s) => {
                self.inner = Inner::Tls(s);
                return Err(Error::TlsHandshake("already upgraded".into()));
            }
        };
        let accepted = acceptor
        .accept(plain)
        .await
        .map_err(|e| Error::TlsHandshake(e.to_string()))?;
        self.inner = Inner::Tls(Box::new(TlsStream::Server(accepted)));
        self.tls = true;
        Ok(())
    }

    /// Client-side TLS handshake in place, used by the outbound SMTP
    /// client session after `STARTTLS`.
    pub async fn upgrade_client(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<(), Error> {
        let plain = match std::mem::replace(&mut self.inner, Inner::Plain(Box::new(Null))) {
            Inner::Plain(s) => s,
            Inner::Tls(s) => {
                self.inner = Inner::Tls(s);
                return Err(Error::TlsHandshake("already upgraded".into()));
            }
        };
        let connected = connector
        .connect(server_name, plain)
        .await
        .map_err(|e| Error::TlsHandshake(e.to_string()))?;
        self.inner = Inner::Tls(Box::new(TlsStream::Client(connected)));
        self.tls = true;
        Ok(())
    }
}

/// A zero-sized placeholder swapped into `self.inner` only for the instant
/// between taking ownership of the previous stream and installing the
/// upgraded one (mem::replace needs *some* value). Never read or written.
struct Null;

impl AsyncRead for Null {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Null {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Small helper trait so `read_to_delim` can `.await` a plain read without
/// pulling in `tokio::io::AsyncReadExt` machinery that assumes a `BufReader`.
trait ReadInto {
    fn read_buf_into<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + 'a>>;
}

impl ReadInto for Inner {
    fn read_buf_into<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx| Pin::new(&mut *self).poll_read(cx, &mut read_buf)).await?;
                Ok(read_buf.filled().len())
        })
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_to_delim_returns_content_excluding_delimiter() {
        let (mut client, server) = duplex(4096);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let line = conn.read_to_delim(b"\r\n", 1024).await.unwrap();
        assert_eq!(line, b"EHLO foo");
    }

    #[tokio::test]
    async fn read_to_delim_keeps_pipelined_remainder() {
        let (mut client, server) = duplex(4096);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        client.write_all(b"EHLO foo\r\nMAIL FROM:<a@b>\r\n").await.unwrap();
        let first = conn.read_to_delim(b"\r\n", 1024).await.unwrap();
        let second = conn.read_to_delim(b"\r\n", 1024).await.unwrap();
        assert_eq!(first, b"EHLO foo");
        assert_eq!(second, b"MAIL FROM:<a@b>");
    }

    #[tokio::test]
    async fn read_to_delim_detects_half_close_as_closed() {
        let (client, server) = duplex(4096);
        drop(client);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        let err = conn.read_to_delim(b"\r\n", 1024).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn read_to_delim_enforces_limit() {
        let (mut client, server) = duplex(4096);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        client.write_all(&vec![b'a'; 100]).await.unwrap();
        let err = conn.read_to_delim(b"\r\n", 16).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded));
    }

    #[tokio::test]
    async fn read_to_delim_accepts_content_of_exactly_max_with_terminator_in_same_chunk() {
        let (mut client, server) = duplex(8192);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        let mut sent = vec![b'a'; 16];
        sent.extend_from_slice(b"\r\n.\r\n");
        client.write_all(&sent).await.unwrap();

        let content = conn.read_to_delim(b"\r\n.\r\n", 16).await.unwrap();
        assert_eq!(content, vec![b'a'; 16]);
    }

    #[tokio::test]
    async fn read_to_delim_rejects_content_one_byte_over_max() {
        let (mut client, server) = duplex(8192);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        let mut sent = vec![b'a'; 17];
        sent.extend_from_slice(b"\r\n.\r\n");
        client.write_all(&sent).await.unwrap();

        let err = conn.read_to_delim(b"\r\n.\r\n", 16).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded));
    }

    #[tokio::test]
    async fn discard_to_delim_resyncs_after_oversized_read() {
        let (mut client, server) = duplex(8192);
        let mut conn = Conn::plain(server, Duration::from_secs(5));
        client.write_all(&vec![b'a'; 100]).await.unwrap();
        client.write_all(b"\r\n.\r\nMAIL FROM:<a@b>\r\n").await.unwrap();

        let err = conn.read_to_delim(b"\r\n.\r\n", 16).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded));

        conn.discard_to_delim(b"\r\n.\r\n").await.unwrap();
        let next = conn.read_to_delim(b"\r\n", 1024).await.unwrap();
        assert_eq!(next, b"MAIL FROM:<a@b>");
    }
}
