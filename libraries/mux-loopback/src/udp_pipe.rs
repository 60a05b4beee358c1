//! A datagram-flavored `sillad::Pipe`, in the same spirit as
//! `sillad::tcp::TcpPipe` but over a connected UDP socket. Datagram
//! boundaries are preserved end to end: each `send`/`recv` carries exactly
//! one datagram, which is sufficient for this reference underlay since the
//! framing above it (`crypt::encrypt_pipe`) only ever needs a reliable,
//! ordered byte channel between two known peers — the one-peer-per-socket
//! simplification a loopback reference transport can afford, where a
//! production datagram underlay would instead demultiplex many peers over
//! one socket by address (spec §4.G).

use std::net::SocketAddr;

use async_io::Async;
use bipe::{BipeReader, BipeWriter};
use futures_util::{AsyncReadExt, AsyncWriteExt};
use pin_project::pin_project;
use std::sync::Arc;

const MAX_DATAGRAM: usize = 65507;

/// Binds (or reuses) a UDP socket, connects it to `remote`, and spawns the
/// background tasks that turn it into a `BipeReader`/`BipeWriter` pair
/// carrying whole datagrams.
async fn spawn_io(socket: Async<std::net::UdpSocket>) -> (BipeReader, BipeWriter) {
    let socket = Arc::new(socket);
    let (mut write_incoming, read_incoming) = bipe::bipe(MAX_DATAGRAM * 4);
    let (write_outgoing, mut read_outgoing) = bipe::bipe(MAX_DATAGRAM * 4);

    {
        let socket = socket.clone();
        smolscale::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let n = match socket.read_with(|s| s.recv(&mut buf)).await {
                    Ok(n) => n,
                    Err(_) => break,
                };
                let len = (n as u32).to_le_bytes();
                if write_incoming.write_all(&len).await.is_err() {
                    break;
                }
                if write_incoming.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        })
        .detach();
    }

    smolscale::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let mut len_buf = [0u8; 4];
            if read_outgoing.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_DATAGRAM {
                break;
            }
            if read_outgoing.read_exact(&mut buf[..len]).await.is_err() {
                break;
            }
            if socket.write_with(|s| s.send(&buf[..len])).await.is_err() {
                break;
            }
        }
    })
    .detach();

    (read_incoming, write_outgoing)
}

#[pin_project]
pub struct UdpPipe {
    #[pin]
    read_incoming: BipeReader,
    #[pin]
    write_outgoing: BipeWriter,
    remote: String,
}

impl UdpPipe {
    /// Dials a remote peer by binding an ephemeral local socket and
    /// connecting it, mirroring `sillad::tcp::TcpDialer`.
    pub async fn dial(remote: SocketAddr) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = std::net::UdpSocket::bind(bind_addr)?;
        socket.connect(remote)?;
        let socket = Async::new(socket)?;
        let (read_incoming, write_outgoing) = spawn_io(socket).await;
        Ok(Self {
            read_incoming,
            write_outgoing,
            remote: remote.to_string(),
        })
    }

    /// Wraps a socket already bound (e.g. by a server-side listener) and
    /// connects it to the single peer this reference underlay serves.
    pub async fn from_bound(
        socket: std::net::UdpSocket,
        remote: SocketAddr,
    ) -> std::io::Result<Self> {
        socket.connect(remote)?;
        let socket = Async::new(socket)?;
        let (read_incoming, write_outgoing) = spawn_io(socket).await;
        Ok(Self {
            read_incoming,
            write_outgoing,
            remote: remote.to_string(),
        })
    }
}

impl futures_util::AsyncRead for UdpPipe {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().read_incoming.poll_read(cx, buf)
    }
}

impl futures_util::AsyncWrite for UdpPipe {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().write_outgoing.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().write_outgoing.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().write_outgoing.poll_close(cx)
    }
}

impl sillad::Pipe for UdpPipe {
    fn protocol(&self) -> &str {
        "mux-loopback-udp"
    }

    fn remote_addr(&self) -> Option<&str> {
        Some(&self.remote)
    }
}
