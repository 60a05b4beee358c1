//! The concrete [`UnderlayFactory`]/[`ServerUnderlayFactory`] pair the
//! controller's tests and demos wire up: streams dial/accept over
//! `sillad::tcp`, datagrams over [`crate::udp_pipe::UdpPipe`], both wrapped
//! by the encrypt-then-multiplex shape shared by
//! [`crate::stream_underlay::StreamUnderlay`]/
//! [`crate::datagram_underlay::DatagramUnderlay`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mux_cipher::{BlockCipher, BlockContext};
use mux_underlay::{DatagramRaw, Underlay, UnderlayFactory, ServerUnderlayFactory};
use sillad::dialer::Dialer;
use sillad::tcp::TcpDialer;
use sillad::Pipe;
use socket2::{Domain, Socket, Type};

use crate::datagram_underlay::DatagramUnderlay;
use crate::stream_underlay::StreamUnderlay;
use crate::udp_pipe::UdpPipe;

/// Binds a datagram socket with address/port reuse enabled (spec §4.G), so
/// a restarted listener can rebind the same port while old sockets are
/// still draining.
fn bind_reuse_datagram(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Client-side underlay constructor: dials a fresh TCP or UDP carrier and
/// wraps it with the supplied cipher.
#[derive(Default)]
pub struct LoopbackUnderlayFactory;

#[async_trait]
impl UnderlayFactory for LoopbackUnderlayFactory {
    async fn new_stream(
        &self,
        remote: SocketAddr,
        mtu: usize,
        cipher: BlockCipher,
    ) -> std::io::Result<Arc<dyn Underlay>> {
        let pipe = TcpDialer { dest_addr: remote }.dial().await?;
        let underlay = StreamUnderlay::new(Box::new(pipe), mtu, cipher);
        smolscale::spawn(underlay.clone().run_event_loop()).detach();
        Ok(underlay)
    }

    async fn new_datagram(
        &self,
        remote: SocketAddr,
        mtu: usize,
        cipher: BlockCipher,
    ) -> std::io::Result<Arc<dyn Underlay>> {
        let pipe = UdpPipe::dial(remote).await?;
        let underlay = DatagramUnderlay::new(pipe, mtu, cipher);
        smolscale::spawn(underlay.clone().run_event_loop()).detach();
        Ok(underlay)
    }
}

/// Server-side underlay constructor: wraps an already-accepted raw pipe (or
/// socket, for datagrams) after matching it against a candidate cipher list
/// built from the configured user map (spec §4.G).
#[derive(Default)]
pub struct LoopbackServerUnderlayFactory;

#[async_trait]
impl ServerUnderlayFactory for LoopbackServerUnderlayFactory {
    /// Picks the first candidate in the list. A production server would
    /// exchange a public `key_id` tag before committing to a cipher so it
    /// can pick the right one out of several users' candidates without
    /// guessing; this reference transport only ever runs with one user
    /// configured in its own tests, so that exchange is left unbuilt here.
    async fn wrap_stream(
        &self,
        raw: Box<dyn Pipe>,
        mtu: usize,
        candidates: Vec<BlockContext>,
    ) -> std::io::Result<Arc<dyn Underlay>> {
        let cipher = candidates
            .first()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no candidate ciphers")
            })?
            .cipher
            .clone();
        let underlay = StreamUnderlay::new(raw, mtu, cipher);
        smolscale::spawn(underlay.clone().run_event_loop()).detach();
        Ok(underlay)
    }

    async fn wrap_datagram(
        &self,
        raw: DatagramRaw,
        mtu: usize,
        candidates: Vec<BlockContext>,
    ) -> std::io::Result<Arc<dyn Underlay>> {
        let cipher = candidates
            .first()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no candidate ciphers")
            })?
            .cipher
            .clone();
        // A real multi-peer datagram listener would demultiplex by source
        // address instead of connecting the listening socket to the first
        // peer seen; see `udp_pipe`'s module doc for why this reference
        // transport settles for one peer per bound socket instead.
        let socket = async_io::Async::new(bind_reuse_datagram(raw.local)?)?;
        let mut probe = [0u8; 1];
        let (_, peer) = socket.peek_from(&mut probe).await?;
        let socket = socket.into_inner()?;
        let pipe = UdpPipe::from_bound(socket, peer).await?;
        let underlay = DatagramUnderlay::new(pipe, mtu, cipher);
        smolscale::spawn(underlay.clone().run_event_loop()).detach();
        Ok(underlay)
    }
}
