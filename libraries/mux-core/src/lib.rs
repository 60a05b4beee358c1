//! The multiplex controller: mediates between logical sessions and a pool
//! of physical underlay carriers. See the per-module docs for the pool
//! (`pool`), counters (`counters`), and server listen path (`listener`).

mod counters;
mod listener;
mod pool;

pub use counters::Counters;
pub use mux_types::{Endpoint, MuxError, NetworkFamily, TransportKind, UserRecord, Users};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_lock::Mutex;
use mux_underlay::{Connection, Scheduler, ServerUnderlayFactory, Underlay, UnderlayFactory};
use rand::Rng;

const CLEANER_TICK: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

enum RoleState {
    Client {
        password: Vec<u8>,
        multiplex_factor: u32,
    },
    Server {
        users: Users,
    },
}

enum Factories {
    Client(Arc<dyn UnderlayFactory>),
    Server(Arc<dyn ServerUnderlayFactory>),
}

struct Inner {
    role_state: RoleState,
    endpoints: Vec<Endpoint>,
    underlays: Vec<Arc<dyn Underlay>>,
    used: bool,
    listener_tasks: Vec<smolscale::Task<()>>,
}

/// The multiplex controller (spec §3's "Controller"). One instance serves
/// either a client or a server role for its entire lifetime.
pub struct Controller {
    self_weak: Weak<Controller>,
    role: Role,
    inner: Mutex<Inner>,
    factories: Factories,
    counters: Arc<Counters>,
    closed: AtomicBool,

    pub(crate) accept_tx: async_channel::Sender<Connection>,
    accept_rx: async_channel::Receiver<Connection>,
    accept_error_tx: async_channel::Sender<MuxError>,
    accept_error_rx: async_channel::Receiver<MuxError>,
    done_tx: async_channel::Sender<()>,
    done_rx: async_channel::Receiver<()>,
}

impl Controller {
    /// Constructs a client-role controller and starts its idle collector.
    pub fn new_client(factory: Arc<dyn UnderlayFactory>) -> Arc<Self> {
        Self::new(
            Role::Client,
            Factories::Client(factory),
            RoleState::Client {
                password: Vec::new(),
                multiplex_factor: 0,
            },
        )
    }

    /// Constructs a server-role controller and starts its idle collector.
    pub fn new_server(factory: Arc<dyn ServerUnderlayFactory>) -> Arc<Self> {
        Self::new(
            Role::Server,
            Factories::Server(factory),
            RoleState::Server {
                users: Users::new(),
            },
        )
    }

    fn new(role: Role, factories: Factories, role_state: RoleState) -> Arc<Self> {
        let (accept_tx, accept_rx) = async_channel::bounded(64);
        let (accept_error_tx, accept_error_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);
        let controller = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            role,
            inner: Mutex::new(Inner {
                role_state,
                endpoints: Vec::new(),
                underlays: Vec::new(),
                used: false,
                listener_tasks: Vec::new(),
            }),
            factories,
            counters: Arc::new(Counters::new()),
            closed: AtomicBool::new(false),
            accept_tx,
            accept_rx,
            accept_error_tx,
            accept_error_rx,
            done_tx,
            done_rx,
        });
        let cleaner = controller.clone();
        smolscale::spawn(async move { cleaner.run_cleaner().await }).detach();
        controller
    }

    /// Recovers an owned `Arc` to this controller for tasks it spawns on
    /// its own behalf. Only called while at least one `Arc<Controller>`
    /// (the one returned by `new_client`/`new_server`) is still alive.
    fn arc_self(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("controller dropped while one of its own tasks was still running")
    }

    async fn run_cleaner(self: Arc<Self>) {
        loop {
            let timer = async_io::Timer::after(CLEANER_TICK);
            let done = self.done_rx.recv();
            futures_lite::future::race(async { timer.await; false }, async {
                let _ = done.await;
                true
            })
            .await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let mut inner = self.inner.lock().await;
            pool::clean_underlays(&mut inner.underlays, &self.counters);
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The controller presents a listener-like surface; it never has a
    /// meaningful local address of its own (spec §6).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn assert_not_used(inner: &Inner, what: &str) {
        assert!(!inner.used, "{what} called after the controller was used");
    }

    pub async fn set_password(&self, password: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        Self::assert_not_used(&inner, "set_password");
        match &mut inner.role_state {
            RoleState::Client { password: p, .. } => *p = password,
            RoleState::Server { .. } => panic!("set_password is a client-only operation"),
        }
    }

    pub async fn set_multiplex_factor(&self, factor: i64) {
        let mut inner = self.inner.lock().await;
        Self::assert_not_used(&inner, "set_multiplex_factor");
        match &mut inner.role_state {
            RoleState::Client {
                multiplex_factor, ..
            } => *multiplex_factor = factor.max(0) as u32,
            RoleState::Server { .. } => {
                panic!("set_multiplex_factor is a client-only operation")
            }
        }
    }

    pub async fn set_users(&self, users: Users) {
        let mut inner = self.inner.lock().await;
        Self::assert_not_used(&inner, "set_users");
        match &mut inner.role_state {
            RoleState::Server { users: u } => *u = users,
            RoleState::Client { .. } => panic!("set_users is a server-only operation"),
        }
    }

    pub async fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        let mut inner = self.inner.lock().await;
        Self::assert_not_used(&inner, "set_endpoints");
        inner.endpoints = endpoints;
    }

    /// Waits on the accept queue, the accept-error slot, and `done`,
    /// whichever fires first (spec §4.A).
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self) -> Result<Connection, MuxError> {
        let from_error = async {
            match self.accept_error_rx.recv().await {
                Ok(err) => Err(err),
                Err(_) => futures_lite::future::pending().await,
            }
        };
        let from_queue = async {
            match self.accept_rx.recv().await {
                Ok(conn) => Ok(conn),
                Err(_) => Err(MuxError::Closed),
            }
        };
        let from_done = async {
            let _ = self.done_rx.recv().await;
            Err(MuxError::Closed)
        };
        futures_lite::future::race(from_error, futures_lite::future::race(from_queue, from_done))
            .await
    }

    /// Idempotent; closes every pooled underlay, empties the pool, and
    /// raises `done` (spec §4.A, §4.H).
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().await;
        for underlay in inner.underlays.drain(..) {
            underlay.close();
        }
        inner.listener_tasks.clear();
        self.done_tx.close();
    }

    pub(crate) fn raise_accept_error(&self, err: MuxError) {
        let _ = self.accept_error_tx.try_send(err);
    }

    /// Shared tail of the server listen path: push a newly accepted underlay
    /// into the pool and spawn its accept-bridge task. The event loop itself
    /// is already spawned by the underlay factory that produced it.
    pub(crate) async fn adopt_server_underlay(&self, underlay: Arc<dyn Underlay>) {
        {
            let mut inner = self.inner.lock().await;
            inner.underlays.push(underlay.clone());
            pool::clean_underlays(&mut inner.underlays, &self.counters);
        }
        self.counters.note_passive_open();
        let this = self.arc_self();
        let bridge_underlay = underlay.clone();
        smolscale::spawn(async move { listener::accept_bridge(this, bridge_underlay).await })
            .detach();
    }

    /// Validates server preconditions, marks the controller used, and
    /// spawns one listener task per endpoint. Never blocks (spec §4.A).
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), MuxError> {
        let server_factory = match &self.factories {
            Factories::Server(f) => f.clone(),
            Factories::Client(_) => panic!("start is a server-only operation"),
        };
        let mut inner = self.inner.lock().await;
        let users = match &inner.role_state {
            RoleState::Server { users } => users.clone(),
            RoleState::Client { .. } => unreachable!("server factory implies server role state"),
        };
        if users.is_empty() {
            return Err(MuxError::NoUsers);
        }
        if inner.endpoints.is_empty() {
            return Err(MuxError::NoEndpoints);
        }
        if inner.endpoints.iter().any(|e| e.local_address.is_none()) {
            return Err(MuxError::MissingAddress);
        }
        inner.used = true;
        let endpoints = inner.endpoints.clone();
        for endpoint in endpoints {
            let controller = self.arc_self();
            let server_factory = server_factory.clone();
            let users = users.clone();
            let task = smolscale::spawn(async move {
                listener::listen_one(controller, endpoint, server_factory, users).await
            });
            inner.listener_tasks.push(task);
        }
        Ok(())
    }

    /// Opens or reuses an underlay and attaches a new session to it (spec
    /// §4.F, "checked before acquiring the lock" for its preconditions).
    #[tracing::instrument(skip(self))]
    pub async fn dial_context(&self) -> Result<Connection, MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::Closed);
        }
        let factory = match &self.factories {
            Factories::Client(f) => f.clone(),
            Factories::Server(_) => panic!("dial_context is a client-only operation"),
        };

        let (password, multiplex_factor, endpoints) = {
            let inner = self.inner.lock().await;
            let (password, multiplex_factor) = match &inner.role_state {
                RoleState::Client {
                    password,
                    multiplex_factor,
                } => (password.clone(), *multiplex_factor),
                RoleState::Server { .. } => {
                    unreachable!("client factory implies client role state")
                }
            };
            (password, multiplex_factor, inner.endpoints.clone())
        };
        if password.is_empty() {
            return Err(MuxError::NoPassword);
        }
        if endpoints.is_empty() {
            return Err(MuxError::NoEndpoints);
        }
        if endpoints.iter().any(|e| e.remote_address.is_none()) {
            return Err(MuxError::MissingAddress);
        }

        let mut inner = self.inner.lock().await;
        inner.used = true;

        pool::clean_underlays(&mut inner.underlays, &self.counters);

        let mut rng = rand::thread_rng();
        let mut underlay = match pool::pick_existing(&inner.underlays, multiplex_factor, &mut rng)
        {
            Some(u) => u,
            None => self.create_and_push(&mut inner, &password, &factory).await?,
        };

        if !underlay.scheduler().inc_pending() {
            underlay = self.create_and_push(&mut inner, &password, &factory).await?;
            if !underlay.scheduler().inc_pending() {
                return Err(MuxError::DialFailed(
                    "freshly created underlay refused a pending session".to_string(),
                ));
            }
        }
        drop(inner);

        let dec_guard = {
            let underlay = underlay.clone();
            scopeguard::guard((), move |_| underlay.scheduler().dec_pending())
        };
        let id = mux_underlay::new_session_id();
        let pipe = underlay
            .add_session(id, None)
            .await
            .map_err(|err| MuxError::AttachFailed(err.to_string()))?;
        drop(dec_guard);
        Ok(Connection { id, pipe })
    }

    async fn create_and_push(
        &self,
        inner: &mut Inner,
        password: &[u8],
        factory: &Arc<dyn UnderlayFactory>,
    ) -> Result<Arc<dyn Underlay>, MuxError> {
        let idx = rand::thread_rng().gen_range(0..inner.endpoints.len());
        let endpoint = inner.endpoints[idx].clone();
        let transport = endpoint
            .transport()
            .map_err(|_| MuxError::UnsupportedNetwork {
                network: endpoint.network.clone(),
            })?;
        let remote = endpoint.remote_address.ok_or(MuxError::MissingAddress)?;
        let datagram = transport == TransportKind::Datagram;
        let cipher = mux_cipher::block_cipher_from_password(password, datagram);
        let underlay = if datagram {
            factory.new_datagram(remote, endpoint.mtu as usize, cipher).await
        } else {
            factory.new_stream(remote, endpoint.mtu as usize, cipher).await
        }
        .map_err(|err| MuxError::DialFailed(err.to_string()))?;

        self.counters.note_active_open();
        inner.underlays.push(underlay.clone());
        Ok(underlay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use mux_cipher::BlockCipher;
    use mux_loopback::{LoopbackServerUnderlayFactory, LoopbackUnderlayFactory};
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    fn endpoint(remote: SocketAddr) -> Endpoint {
        Endpoint {
            network: "tcp".to_string(),
            local_address: None,
            remote_address: Some(remote),
            mtu: 1400,
        }
    }

    fn user(name: &str, password: &str) -> UserRecord {
        UserRecord {
            name: name.to_string(),
            plaintext_password: Some(password.to_string()),
            hashed_password_hex: None,
        }
    }

    async fn spawn_server(addr: SocketAddr) -> Arc<Controller> {
        let server = Controller::new_server(Arc::new(LoopbackServerUnderlayFactory));
        let mut users = Users::new();
        users.insert("alice".to_string(), user("alice", "hunter2"));
        server.set_users(users).await;
        server
            .set_endpoints(vec![Endpoint {
                network: "tcp".to_string(),
                local_address: Some(addr),
                remote_address: None,
                mtu: 1400,
            }])
            .await;
        server.start().await.unwrap();
        server
    }

    async fn free_port() -> SocketAddr {
        let listener = sillad::tcp::TcpListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        listener.local_addr().await
    }

    #[test]
    fn client_reuse_off_opens_distinct_underlays() {
        smolscale::block_on(async move {
            let addr = free_port().await;
            let server = spawn_server(addr).await;

            let client = Controller::new_client(Arc::new(LoopbackUnderlayFactory));
            client.set_password(vec![0u8; 16]).await;
            client.set_multiplex_factor(0).await;
            client.set_endpoints(vec![endpoint(addr)]).await;

            for _ in 0..3 {
                let _pipe = client.dial_context().await.unwrap();
                let _conn = server.accept().await.unwrap();
            }

            assert_eq!(
                client
                    .counters()
                    .underlay_active_opens
                    .load(Ordering::SeqCst),
                3
            );
            server.close().await;
            client.close().await;
        });
    }

    #[test]
    fn client_reuse_high_opens_few_underlays() {
        smolscale::block_on(async move {
            let addr = free_port().await;
            let server = spawn_server(addr).await;

            let client = Controller::new_client(Arc::new(LoopbackUnderlayFactory));
            client.set_password(vec![1u8; 16]).await;
            client.set_multiplex_factor(16).await;
            client.set_endpoints(vec![endpoint(addr)]).await;

            for _ in 0..50 {
                let _pipe = client.dial_context().await.unwrap();
                let _conn = server.accept().await.unwrap();
            }

            assert!(
                client
                    .counters()
                    .underlay_active_opens
                    .load(Ordering::SeqCst)
                    <= 5
            );
            server.close().await;
            client.close().await;
        });
    }

    #[test]
    fn server_bind_failure_surfaces_on_accept() {
        smolscale::block_on(async move {
            let server = Controller::new_server(Arc::new(LoopbackServerUnderlayFactory));
            let mut users = Users::new();
            users.insert("alice".to_string(), user("alice", "hunter2"));
            server.set_users(users).await;
            // port 1 is privileged and unbindable for an unprivileged process
            server
                .set_endpoints(vec![Endpoint {
                    network: "tcp".to_string(),
                    local_address: Some("127.0.0.1:1".parse().unwrap()),
                    remote_address: None,
                    mtu: 1400,
                }])
                .await;
            server.start().await.unwrap();
            let result = server.accept().await;
            assert!(result.is_err());
            server.close().await;
        });
    }

    #[test]
    fn graceful_shutdown_ends_pending_accept() {
        smolscale::block_on(async move {
            let addr = free_port().await;
            let server = spawn_server(addr).await;

            let client = Controller::new_client(Arc::new(LoopbackUnderlayFactory));
            client.set_password(vec![2u8; 16]).await;
            client.set_multiplex_factor(0).await;
            client.set_endpoints(vec![endpoint(addr)]).await;

            let _p1 = client.dial_context().await.unwrap();
            let _c1 = server.accept().await.unwrap();
            let _p2 = client.dial_context().await.unwrap();
            let _c2 = server.accept().await.unwrap();

            server.close().await;
            let result = server.accept().await;
            assert!(matches!(result, Err(MuxError::Closed)));
            server.close().await;

            client.close().await;
        });
    }

    /// A pipe that discards everything written to it and reports
    /// end-of-stream on read, standing in for a session whose data never
    /// actually needs to flow (spec scenario exercises the reuse/retry
    /// bookkeeping, not transport).
    struct NullPipe;

    impl futures_lite::AsyncRead for NullPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(0))
        }
    }

    impl futures_lite::AsyncWrite for NullPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl sillad::Pipe for NullPipe {
        fn protocol(&self) -> &str {
            "null"
        }
        fn remote_addr(&self) -> Option<&str> {
            None
        }
    }

    /// A scheduler that grants its first `inc_pending` and refuses every
    /// call after, standing in for an underlay whose teardown began
    /// concurrently with being picked for reuse.
    struct FlakyScheduler {
        calls: AtomicUsize,
    }

    impl Scheduler for FlakyScheduler {
        fn inc_pending(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) == 0
        }
        fn dec_pending(&self) {}
        fn is_idle(&self) -> bool {
            false
        }
        fn is_disabled(&self) -> bool {
            false
        }
    }

    struct FlakyUnderlay {
        scheduler: FlakyScheduler,
    }

    #[async_trait::async_trait]
    impl Underlay for FlakyUnderlay {
        fn mtu(&self) -> usize {
            1500
        }
        fn scheduler(&self) -> &dyn Scheduler {
            &self.scheduler
        }
        async fn add_session(
            &self,
            _id: u32,
            _peer: Option<&str>,
        ) -> std::io::Result<Box<dyn sillad::Pipe>> {
            Ok(Box::new(NullPipe))
        }
        async fn accept(&self) -> std::io::Result<Option<Connection>> {
            unimplemented!("client-only test double")
        }
        async fn run_event_loop(self: Arc<Self>) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_done(&self) -> bool {
            false
        }
        fn close(&self) {}
    }

    /// Returns one `FlakyUnderlay` on its first `new_stream` call, then
    /// delegates to a real `LoopbackUnderlayFactory` for every call after —
    /// lets a test force `dial_context`'s retry-after-failed-`inc_pending`
    /// branch without a genuine concurrent teardown race.
    struct FlakyThenRealFactory {
        real: LoopbackUnderlayFactory,
        used_fake: std::sync::atomic::AtomicBool,
    }

    impl FlakyThenRealFactory {
        fn new() -> Self {
            Self {
                real: LoopbackUnderlayFactory,
                used_fake: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl UnderlayFactory for FlakyThenRealFactory {
        async fn new_stream(
            &self,
            remote: SocketAddr,
            mtu: usize,
            cipher: BlockCipher,
        ) -> std::io::Result<Arc<dyn Underlay>> {
            if !self.used_fake.swap(true, Ordering::SeqCst) {
                Ok(Arc::new(FlakyUnderlay {
                    scheduler: FlakyScheduler {
                        calls: AtomicUsize::new(0),
                    },
                }))
            } else {
                self.real.new_stream(remote, mtu, cipher).await
            }
        }

        async fn new_datagram(
            &self,
            remote: SocketAddr,
            mtu: usize,
            cipher: BlockCipher,
        ) -> std::io::Result<Arc<dyn Underlay>> {
            self.real.new_datagram(remote, mtu, cipher).await
        }
    }

    #[test]
    fn dial_retries_after_reuse_candidate_fails_inc_pending() {
        smolscale::block_on(async move {
            let addr = free_port().await;
            let server = spawn_server(addr).await;

            let client = Controller::new_client(Arc::new(FlakyThenRealFactory::new()));
            client.set_password(vec![3u8; 16]).await;
            // Huge multiplex factor so the second dial overwhelmingly picks
            // the one existing (flaky) underlay for reuse rather than
            // opening a fresh one on its own.
            client.set_multiplex_factor(1_000_000).await;
            client.set_endpoints(vec![endpoint(addr)]).await;

            // First dial creates the flaky underlay; its inc_pending grants
            // this one attempt and its add_session never touches the
            // network, so nothing reaches the server yet.
            let _p1 = client.dial_context().await.unwrap();

            // Second dial: pick_existing selects the flaky underlay (it's
            // the only active one), inc_pending now refuses it, and
            // dial_context falls back to create_and_push again — which,
            // with the fake already spent, goes to the real factory and
            // actually dials the server.
            let _p2 = client.dial_context().await.unwrap();
            let _conn = server.accept().await.unwrap();

            assert_eq!(
                client
                    .counters()
                    .underlay_active_opens
                    .load(Ordering::SeqCst),
                2
            );
            server.close().await;
            client.close().await;
        });
    }

    #[test]
    fn idle_collector_recycles_stale_underlay_for_next_dial() {
        smolscale::block_on(async move {
            let addr = free_port().await;
            let server = spawn_server(addr).await;

            let client = Controller::new_client(Arc::new(LoopbackUnderlayFactory));
            client.set_password(vec![4u8; 16]).await;
            client.set_multiplex_factor(1_000_000).await;
            client.set_endpoints(vec![endpoint(addr)]).await;

            let pipe = client.dial_context().await.unwrap();
            let _conn = server.accept().await.unwrap();
            drop(pipe);

            // Wait past two cleaner ticks (spec §8's idle-collection
            // scenario) so the periodic collector has swept the
            // now-sessionless underlay out of the pool.
            async_io::Timer::after(CLEANER_TICK * 2 + Duration::from_secs(1)).await;

            let pipe2 = client.dial_context().await.unwrap();
            let _conn2 = server.accept().await.unwrap();
            drop(pipe2);

            assert_eq!(
                client
                    .counters()
                    .underlay_active_opens
                    .load(Ordering::SeqCst),
                2
            );
            server.close().await;
            client.close().await;
        });
    }

    #[test]
    fn role_gate_panics_on_wrong_role_setter() {
        smolscale::block_on(async move {
            let client = Controller::new_client(Arc::new(LoopbackUnderlayFactory));
            let result = std::panic::AssertUnwindSafe(client.set_users(Users::new()))
                .catch_unwind()
                .await;
            assert!(result.is_err());
        });
    }
}
