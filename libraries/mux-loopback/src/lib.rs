//! A reference `Underlay`/`UnderlayFactory` implementation: TCP or UDP
//! carrying a `picomux::PicoMux` over an AEAD-framed `sillad::Pipe`. Real
//! deployments plug in their own underlay module against the traits in
//! `mux-underlay`; this crate exists so `mux-core`'s tests and demos have
//! something concrete to dial and listen with.

mod crypt;
mod datagram_underlay;
mod factory;
mod scheduler;
mod stream_underlay;
mod tracked_pipe;
mod udp_pipe;

pub use datagram_underlay::DatagramUnderlay;
pub use factory::{LoopbackServerUnderlayFactory, LoopbackUnderlayFactory};
pub use scheduler::LoopbackScheduler;
pub use stream_underlay::StreamUnderlay;
pub use udp_pipe::UdpPipe;

#[cfg(test)]
mod tests {
    use super::*;
    use mux_underlay::{Underlay, UnderlayFactory};
    use sillad::listener::Listener as _;
    use std::net::SocketAddr;

    async fn listen_once(
        mut listener: sillad::tcp::TcpListener,
        mtu: usize,
        cipher: mux_cipher::BlockCipher,
    ) -> std::sync::Arc<dyn Underlay> {
        let pipe: Box<dyn sillad::Pipe> = Box::new(listener.accept().await.unwrap());
        StreamUnderlay::new(pipe, mtu, cipher)
    }

    #[test]
    fn stream_underlay_round_trips_a_session() {
        smolscale::block_on(async move {
            let cipher = mux_cipher::block_cipher_from_password(b"hunter2", false);
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let bound = sillad::tcp::TcpListener::bind(addr).await.unwrap();
            let local = bound.local_addr().await;

            let server_cipher = cipher.clone();
            let server = smolscale::spawn(async move {
                listen_once(bound, 1500, server_cipher).await
            });

            let factory = LoopbackUnderlayFactory;
            let client = factory.new_stream(local, 1500, cipher).await.unwrap();

            let server = server.await;
            smolscale::spawn(server.clone().run_event_loop()).detach();

            let mut client_pipe = client.add_session(42, None).await.unwrap();
            let connection = loop {
                if let Some(conn) = server.accept().await.unwrap() {
                    break conn;
                }
            };
            assert_eq!(connection.id, 42);
            let mut server_pipe = connection.pipe;

            use futures_util::{AsyncReadExt, AsyncWriteExt};
            client_pipe.write_all(b"hello").await.unwrap();
            client_pipe.flush().await.unwrap();
            let mut buf = [0u8; 5];
            server_pipe.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");

            client.close();
            server.close();
        });
    }
}
