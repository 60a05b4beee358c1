//! The "underlay module" and "cipher module" interfaces the controller
//! consumes (spec §6), expressed as traits. Nothing in this crate has an
//! implementation; see `mux-loopback` for a concrete, testable one.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mux_cipher::BlockContext;
use rand::Rng;
use sillad::Pipe;

/// A logical, user-visible connection: a 32-bit ID plus the byte stream it
/// carries. Owned by the core only for the instant between creation and
/// handoff to the caller (spec §3: "Not owned by the core after creation").
pub struct Session {
    pub id: u32,
    pub pipe: Box<dyn Pipe>,
}

/// A demultiplexed connection handed up from the server side. Identical in
/// shape to [`Session`]; kept as a distinct type alias so call sites read
/// according to which role produced the value (spec §3's "Connection").
pub type Connection = Session;

/// Draws a fresh random 32-bit session ID (spec §4.F step 6).
pub fn new_session_id() -> u32 {
    rand::thread_rng().gen()
}

/// Per-underlay pending/idle/disabled indicators the controller uses for
/// reuse and collection decisions (spec §3, §4.D).
pub trait Scheduler: Send + Sync {
    /// Bumps the pending count. Returns `false` if the underlay is being
    /// torn down and must not accept new sessions.
    fn inc_pending(&self) -> bool;
    /// Releases a pending slot previously granted by `inc_pending`.
    fn dec_pending(&self);
    /// Whether the underlay currently carries no sessions and no pending
    /// attaches, making it eligible for idle collection (spec §4.D).
    fn is_idle(&self) -> bool;
    /// Whether the underlay is excluded from reuse selection (spec §4.F's
    /// "active" filter), independent of idleness.
    fn is_disabled(&self) -> bool;
}

/// An authenticated, encrypted point-to-point carrier capable of
/// multiplexing many sessions (spec §3's "Underlay handle").
#[async_trait]
pub trait Underlay: Send + Sync {
    fn mtu(&self) -> usize;
    fn scheduler(&self) -> &dyn Scheduler;

    /// Attaches a client-side session with the given ID to this underlay,
    /// returning the pipe the caller will use. The ID is picked by the
    /// controller before calling this (spec §4.F step 6); this method's job
    /// is only to open the multiplexed stream and bind it (spec §4.F step 7).
    async fn add_session(&self, id: u32, peer: Option<&str>) -> std::io::Result<Box<dyn Pipe>>;

    /// Hands up the next demultiplexed session on the server side. Returns
    /// `Ok(None)` on orderly end-of-stream (spec §3: "Connection |
    /// end-of-stream").
    async fn accept(&self) -> std::io::Result<Option<Connection>>;

    /// Drives framing/crypto for this underlay until it closes. Spawned as
    /// an independent task by whichever side created the underlay (spec
    /// §4.F, §4.G).
    async fn run_event_loop(self: Arc<Self>) -> anyhow::Result<()>;

    /// Whether `Close()` has already been signalled for this underlay.
    fn is_done(&self) -> bool;

    /// Tears the underlay down. Idempotent (spec §3 invariant 4).
    fn close(&self);
}

/// The raw, not-yet-authenticated material a server-side listener task has
/// accepted for a datagram endpoint: one socket serving every peer (spec
/// §4.G: "datagram underlays multiplex all peers").
pub struct DatagramRaw {
    pub local: SocketAddr,
}

/// Client-side underlay constructors (spec §6's "to the underlay module").
#[async_trait]
pub trait UnderlayFactory: Send + Sync {
    async fn new_stream(
        &self,
        remote: SocketAddr,
        mtu: usize,
        cipher: mux_cipher::BlockCipher,
    ) -> std::io::Result<Arc<dyn Underlay>>;

    async fn new_datagram(
        &self,
        remote: SocketAddr,
        mtu: usize,
        cipher: mux_cipher::BlockCipher,
    ) -> std::io::Result<Arc<dyn Underlay>>;
}

/// Server-side underlay wrappers, taking the raw accepted connection plus
/// the candidate cipher list built from the user map (spec §4.G, §6).
#[async_trait]
pub trait ServerUnderlayFactory: Send + Sync {
    async fn wrap_stream(
        &self,
        raw: Box<dyn Pipe>,
        mtu: usize,
        candidates: Vec<BlockContext>,
    ) -> std::io::Result<Arc<dyn Underlay>>;

    async fn wrap_datagram(
        &self,
        raw: DatagramRaw,
        mtu: usize,
        candidates: Vec<BlockContext>,
    ) -> std::io::Result<Arc<dyn Underlay>>;
}
