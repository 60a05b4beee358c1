//! The server listen path (spec §4.G): one independent task per endpoint,
//! dispatching on transport kind, authenticating incoming underlays against
//! a candidate cipher list built from the user map.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use async_io::Async;
use futures_lite::{AsyncRead, AsyncWrite};
use mux_cipher::BlockContext;
use mux_types::{Endpoint, MuxError, TransportKind, Users};
use mux_underlay::{DatagramRaw, ServerUnderlayFactory, Underlay};
use pin_project::pin_project;
use sillad::Pipe;
use socket2::{Domain, Socket, Type};

use crate::Controller;

/// Binds a TCP listener with address/port reuse enabled (spec §4.G).
/// `sillad::tcp::TcpListener` itself has no reuse option, so the listen
/// path builds its own socket with `socket2` before handing it to
/// `async-io`.
fn bind_reuse_stream(addr: SocketAddr) -> std::io::Result<Async<std::net::TcpListener>> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Async::new(std::net::TcpListener::from(socket))
}

/// A `sillad::Pipe` over a stream accepted from a reuse-bound listener, in
/// the same shape as `sillad::tcp::TcpPipe` (which this module can't reuse
/// directly since its fields are private to that module).
#[pin_project]
struct ReuseTcpPipe(#[pin] Async<TcpStream>, String);

impl AsyncRead for ReuseTcpPipe {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().0.poll_read(cx, buf)
    }
}

impl AsyncWrite for ReuseTcpPipe {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().0.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().0.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().0.poll_close(cx)
    }
}

impl Pipe for ReuseTcpPipe {
    fn protocol(&self) -> &str {
        "tcp"
    }

    fn remote_addr(&self) -> Option<&str> {
        Some(&self.1)
    }
}

/// Builds the candidate cipher list a server-side underlay authenticates
/// incoming connections against (spec §4.G). Users whose hashed password
/// can't be decoded are skipped with a debug log rather than failing the
/// whole listener. `datagram` selects which transport-flavored derivation
/// to use, so a datagram listener's candidates actually match what a
/// datagram-dialing client derives — spec.md's own walkthrough only spells
/// out the stream case, but a single transport-invariant candidate set
/// would leave datagram underlays unable to authenticate at all.
pub(crate) fn build_candidates(users: &Users, datagram: bool) -> Vec<BlockContext> {
    let mut candidates = Vec::new();
    for user in users.values() {
        let decoded = match &user.hashed_password_hex {
            Some(hex_str) => match hex::decode(hex_str) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::debug!(user = %user.name, err = %err, "skipping user with undecodable hashed password");
                    continue;
                }
            },
            None => Vec::new(),
        };
        let password = if decoded.is_empty() {
            match &user.plaintext_password {
                Some(plaintext) => mux_cipher::hash_password(plaintext, &user.name),
                None => {
                    tracing::debug!(user = %user.name, "skipping user with no usable password material");
                    continue;
                }
            }
        } else {
            decoded
        };
        let ciphers = mux_cipher::block_cipher_list_from_password(&password, datagram);
        candidates.extend(
            ciphers
                .into_iter()
                .map(|cipher| BlockContext::new(user.name.clone(), cipher)),
        );
    }
    candidates
}

#[tracing::instrument(skip(controller, server_factory, users), fields(network = %endpoint.network))]
pub(crate) async fn listen_one(
    controller: Arc<Controller>,
    endpoint: Endpoint,
    server_factory: Arc<dyn ServerUnderlayFactory>,
    users: Users,
) {
    let transport = match endpoint.transport() {
        Ok(t) => t,
        Err(err) => {
            controller.raise_accept_error(err);
            return;
        }
    };
    let local = match endpoint.local_address {
        Some(addr) => addr,
        None => {
            controller.raise_accept_error(MuxError::MissingAddress);
            return;
        }
    };
    match transport {
        TransportKind::Stream => listen_stream(controller, local, endpoint.mtu, server_factory, users).await,
        TransportKind::Datagram => listen_datagram(controller, local, endpoint.mtu, server_factory, users).await,
    }
}

async fn listen_stream(
    controller: Arc<Controller>,
    local: std::net::SocketAddr,
    mtu: u32,
    server_factory: Arc<dyn ServerUnderlayFactory>,
    users: Users,
) {
    let listener = match bind_reuse_stream(local) {
        Ok(l) => l,
        Err(err) => {
            controller.raise_accept_error(MuxError::ListenFailed(err.to_string()));
            return;
        }
    };
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                controller.raise_accept_error(MuxError::ListenFailed(err.to_string()));
                return;
            }
        };
        let raw: Box<dyn Pipe> = Box::new(ReuseTcpPipe(conn, peer.to_string()));
        let candidates = build_candidates(&users, false);
        match server_factory
            .wrap_stream(raw, mtu as usize, candidates)
            .await
        {
            Ok(underlay) => controller.adopt_server_underlay(underlay).await,
            Err(err) => {
                tracing::debug!(err = %err, "failed to authenticate an incoming stream underlay");
            }
        }
    }
}

async fn listen_datagram(
    controller: Arc<Controller>,
    local: std::net::SocketAddr,
    mtu: u32,
    server_factory: Arc<dyn ServerUnderlayFactory>,
    users: Users,
) {
    let candidates = build_candidates(&users, true);
    match server_factory
        .wrap_datagram(DatagramRaw { local }, mtu as usize, candidates)
        .await
    {
        Ok(underlay) => controller.adopt_server_underlay(underlay).await,
        Err(err) => {
            controller.raise_accept_error(MuxError::ListenFailed(err.to_string()));
        }
    }
}

/// Drains `underlay.accept()` into the controller's accept queue until the
/// underlay's own demultiplexer reports end-of-stream or an error (spec
/// §4.G's accept-bridge task).
pub(crate) async fn accept_bridge(controller: Arc<Controller>, underlay: Arc<dyn Underlay>) {
    loop {
        match underlay.accept().await {
            Ok(Some(connection)) => {
                if controller.accept_tx.send(connection).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(err = %err, "underlay accept-bridge ended");
                return;
            }
        }
    }
}
