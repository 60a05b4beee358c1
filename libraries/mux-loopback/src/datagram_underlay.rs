//! The datagram-flavored reference underlay: identical shape to
//! [`crate::stream_underlay::StreamUnderlay`], but the raw pipe underneath
//! the crypto framing is a [`crate::udp_pipe::UdpPipe`] instead of a TCP
//! connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mux_underlay::{Connection, Scheduler, Session, Underlay};
use picomux::PicoMux;

use crate::scheduler::LoopbackScheduler;
use crate::tracked_pipe::TrackedPipe;
use crate::udp_pipe::UdpPipe;

pub struct DatagramUnderlay {
    mux: PicoMux,
    mtu: usize,
    scheduler: Arc<LoopbackScheduler>,
    done: AtomicBool,
    close_tx: async_channel::Sender<()>,
    close_rx: async_channel::Receiver<()>,
}

impl DatagramUnderlay {
    pub fn new(raw: UdpPipe, mtu: usize, cipher: mux_cipher::BlockCipher) -> Arc<Self> {
        let (plain_read, plain_write) = crate::crypt::encrypt_pipe(raw, cipher);
        let mux = PicoMux::new(plain_read, plain_write);
        let (close_tx, close_rx) = async_channel::bounded(1);
        Arc::new(Self {
            mux,
            mtu,
            scheduler: Arc::new(LoopbackScheduler::new()),
            done: AtomicBool::new(false),
            close_tx,
            close_rx,
        })
    }
}

#[async_trait]
impl Underlay for DatagramUnderlay {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    async fn add_session(
        &self,
        id: u32,
        peer: Option<&str>,
    ) -> std::io::Result<Box<dyn sillad::Pipe>> {
        let metadata = match peer {
            Some(peer) => format!("{id}:{peer}").into_bytes(),
            None => id.to_string().into_bytes(),
        };
        let stream = self.mux.open(&metadata).await?;
        let tracked = TrackedPipe::new(stream, self.scheduler.clone());
        Ok(Box::new(tracked))
    }

    async fn accept(&self) -> std::io::Result<Option<Connection>> {
        match self.mux.accept().await {
            Ok(stream) => {
                let id = crate::stream_underlay::parse_session_id(stream.metadata())
                    .unwrap_or_else(mux_underlay::new_session_id);
                let tracked = TrackedPipe::new(stream, self.scheduler.clone());
                Ok(Some(Session {
                    id,
                    pipe: Box::new(tracked),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn run_event_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let closed = async { let _ = self.close_rx.recv().await; };
        let died = async {
            if let Err(err) = self.mux.wait_until_dead().await {
                tracing::debug!(?err, "datagram underlay mux ended");
            }
        };
        futures_lite::future::race(closed, died).await;
        self.done.store(true, Ordering::SeqCst);
        self.scheduler.begin_teardown();
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.scheduler.begin_teardown();
            self.close_tx.close();
        }
    }
}
