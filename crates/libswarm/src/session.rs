//! Session event loop.
//!
//! The session task owns the bandwidth tree, runs the allocator tick,
//! drives the port supervisor's timer, and drains the event queue that web
//! completions are posted to. All of that runs serially on one task; the
//! web transport and peer connections interact with it only through the
//! guarded tree handle and the event queue.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bandwidth::{allocator, BandwidthTree, Direction, NodeId};
use crate::config::SessionConfig;
use crate::error::SwarmError;
use crate::portfwd::PortSupervisor;
use crate::web::{
    BandwidthGate, CloseMode, DoneFunc, EventJob, TorrentId, WebConfig, WebTransport,
};

struct SessionShared {
    config: SessionConfig,
    tree: Arc<Mutex<BandwidthTree>>,
    root: NodeId,
    torrents: Arc<Mutex<HashMap<TorrentId, NodeId>>>,
    web: WebTransport,
    event_tx: mpsc::UnboundedSender<EventJob>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<EventJob>>>,
    supervisor: tokio::sync::Mutex<PortSupervisor>,
    sup_kick: Notify,
    open: Arc<AtomicBool>,
    shutdown: Notify,
}

/// Handle to a running session. Clones share the same state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

/// Hands the web transport's write path the owning torrent's root
/// bandwidth node. Lock order is torrents, then tree; nothing may hold
/// both the other way around.
struct SessionGate {
    tree: Arc<Mutex<BandwidthTree>>,
    torrents: Arc<Mutex<HashMap<TorrentId, NodeId>>>,
}

impl BandwidthGate for SessionGate {
    fn clamp(&self, torrent: TorrentId, bytes: usize) -> usize {
        let node = self.torrents.lock().unwrap().get(&torrent).copied();
        match node {
            Some(node) => {
                self.tree
                    .lock()
                    .unwrap()
                    .clamp(0, node, Direction::Down, bytes as u64) as usize
            }
            None => bytes,
        }
    }

    fn consumed(&self, torrent: TorrentId, bytes: usize) {
        let node = self.torrents.lock().unwrap().get(&torrent).copied();
        if let Some(node) = node {
            self.tree
                .lock()
                .unwrap()
                .consumed(0, node, Direction::Down, bytes as u64, true);
        }
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let mut tree = BandwidthTree::new();
        let root = tree.create(None);
        tree.set_limit(
            root,
            Direction::Down,
            config.download_limit_bps,
            config.download_limited,
            true,
        );
        tree.set_limit(
            root,
            Direction::Up,
            config.upload_limit_bps,
            config.upload_limited,
            true,
        );
        let tree = Arc::new(Mutex::new(tree));
        let torrents: Arc<Mutex<HashMap<TorrentId, NodeId>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let mut web_config = WebConfig::from_env(&config.config_dir);
        web_config.bind_v4 = config.bind_v4.map(IpAddr::V4);
        web_config.bind_v6 = config.bind_v6.map(IpAddr::V6);

        let gate = Arc::new(SessionGate {
            tree: tree.clone(),
            torrents: torrents.clone(),
        });
        let web = WebTransport::new(web_config, gate, event_tx.clone(), open.clone());

        let supervisor =
            tokio::sync::Mutex::new(PortSupervisor::with_default_backends(config.peer_port));

        Self {
            shared: Arc::new(SessionShared {
                config,
                tree,
                root,
                torrents,
                web,
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                supervisor,
                sup_kick: Notify::new(),
                open,
                shutdown: Notify::new(),
            }),
        }
    }

    /// Shared bandwidth tree; peer connections attach their nodes through
    /// this handle.
    pub fn bandwidth(&self) -> Arc<Mutex<BandwidthTree>> {
        self.shared.tree.clone()
    }

    /// Root bandwidth node carrying the session-wide limits.
    pub fn root(&self) -> NodeId {
        self.shared.root
    }

    /// Register a torrent, creating its root limiter under the session's.
    pub fn add_torrent(&self, torrent: TorrentId) -> NodeId {
        let node = self.shared.tree.lock().unwrap().create(Some(self.shared.root));
        self.shared.torrents.lock().unwrap().insert(torrent, node);
        info!(torrent, "added torrent limiter");
        node
    }

    pub fn remove_torrent(&self, torrent: TorrentId) {
        let node = self.shared.torrents.lock().unwrap().remove(&torrent);
        if let Some(node) = node {
            self.shared.tree.lock().unwrap().release(node);
            info!(torrent, "removed torrent limiter");
        }
    }

    pub fn torrent_node(&self, torrent: TorrentId) -> Option<NodeId> {
        self.shared.torrents.lock().unwrap().get(&torrent).copied()
    }

    /// Session-wide speed limit for one direction.
    pub fn set_speed_limit(&self, dir: Direction, limit_bps: u64, enabled: bool) {
        self.shared
            .tree
            .lock()
            .unwrap()
            .set_limit(self.shared.root, dir, limit_bps, enabled, true);
    }

    /// Queue a plain HTTP fetch (tracker announce, scrape, ...).
    pub fn fetch(&self, url: impl Into<String>, done: DoneFunc) -> Result<(), SwarmError> {
        self.shared.web.fetch(url, done)
    }

    pub fn fetch_with_cookies(
        &self,
        url: impl Into<String>,
        cookies: impl Into<String>,
        done: DoneFunc,
    ) -> Result<(), SwarmError> {
        self.shared.web.fetch_with_cookies(url, cookies, done)
    }

    /// Queue a webseed range request, throttled through the torrent's
    /// bandwidth node.
    pub fn fetch_webseed(
        &self,
        torrent: TorrentId,
        url: impl Into<String>,
        range: Option<String>,
        done: DoneFunc,
    ) -> Result<(), SwarmError> {
        self.shared.web.fetch_webseed(torrent, url, range, done)
    }

    pub fn web(&self) -> &WebTransport {
        &self.shared.web
    }

    /// Queue a job for serialized execution on the session task.
    pub fn run_in_session(&self, job: EventJob) {
        let _ = self.shared.event_tx.send(job);
    }

    /// Externally visible peer port, once a backend has mapped one.
    pub async fn external_port(&self) -> Option<u16> {
        self.shared.supervisor.lock().await.external_port()
    }

    pub async fn set_port_forwarding(&self, enabled: bool) {
        self.shared.supervisor.lock().await.enable(enabled).await;
        self.shared.sup_kick.notify_one();
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move { session.run().await })
    }

    /// Run the event loop until `close` is called.
    pub async fn run(&self) {
        let mut events = self
            .shared
            .event_rx
            .lock()
            .unwrap()
            .take()
            .expect("session event loop already running");

        let period_ms = self.shared.config.period_ms.max(1);
        let mut alloc = tokio::time::interval(Duration::from_millis(period_ms));
        alloc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        if self.shared.config.port_forwarding {
            self.shared.supervisor.lock().await.enable(true).await;
        }
        let mut sup_deadline = Instant::now();

        info!(period_ms, "session event loop running");

        loop {
            let sup_enabled = self.shared.supervisor.lock().await.is_enabled();

            tokio::select! {
                _ = self.shared.shutdown.notified() => break,
                _ = alloc.tick() => {
                    for dir in Direction::ALL {
                        allocator::allocate(&self.shared.tree, self.shared.root, dir, period_ms);
                    }
                }
                maybe_job = events.recv() => {
                    if let Some(job) = maybe_job {
                        job();
                        while let Ok(job) = events.try_recv() {
                            job();
                        }
                    }
                }
                _ = tokio::time::sleep_until(sup_deadline), if sup_enabled => {
                    let mut sup = self.shared.supervisor.lock().await;
                    sup.pulse().await;
                    sup_deadline = Instant::now() + sup.retime();
                }
                _ = self.shared.sup_kick.notified() => {
                    sup_deadline = Instant::now();
                }
            }
        }

        debug!("session event loop exited");
    }

    /// Close the session: final unmap pulse, immediate web shutdown, then
    /// stop the event loop.
    pub async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.supervisor.lock().await.close().await;
        self.shared.web.close(CloseMode::Immediate).await;
        self.shared.shutdown.notify_one();
        info!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn quiet_config() -> SessionConfig {
        let mut config = SessionConfig::new(0);
        config.period_ms = 100;
        config
    }

    #[tokio::test]
    async fn torrent_limiters_hang_off_the_session_root() {
        let session = Session::new(quiet_config());
        let node = session.add_torrent(1);

        {
            let tree = session.bandwidth();
            let tree = tree.lock().unwrap();
            assert_eq!(tree.parent(node), Some(session.root()));
            assert!(tree.children(session.root()).contains(&node));
        }

        session.remove_torrent(1);
        assert!(session.torrent_node(1).is_none());
    }

    #[tokio::test]
    async fn config_limits_land_on_the_root() {
        let mut config = quiet_config();
        config.download_limit_bps = 123_000;
        config.download_limited = true;
        let session = Session::new(config);

        let tree = session.bandwidth();
        {
            let tree = tree.lock().unwrap();
            assert!(tree.is_limited(session.root(), Direction::Down));
            assert_eq!(tree.desired_speed_bps(session.root(), Direction::Down), 123_000);
            assert!(!tree.is_limited(session.root(), Direction::Up));
        }

        session.set_speed_limit(Direction::Up, 9_000, true);
        let tree = session.bandwidth();
        let tree = tree.lock().unwrap();
        assert!(tree.is_limited(session.root(), Direction::Up));
    }

    #[tokio::test]
    async fn close_stops_the_event_loop() {
        let session = Session::new(quiet_config());
        let running = session.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.close().await;
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("event loop must stop")
            .unwrap();
    }

    /// Serves `total` bytes in small timed pieces so the body arrives as
    /// many chunks.
    async fn trickle_server(total: usize, piece: usize) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = sock.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
                    );
                    let _ = sock.write_all(head.as_bytes()).await;
                    let mut sent = 0usize;
                    while sent < total {
                        let n = piece.min(total - sent);
                        if sock.write_all(&vec![0x42u8; n]).await.is_err() {
                            break;
                        }
                        let _ = sock.flush().await;
                        sent += n;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn webseed_download_is_paced_by_the_session_limit() {
        // 10 kB of tick budget against a 30 kB body: needs at least three
        // allocator ticks to complete.
        let mut config = quiet_config();
        config.download_limit_bps = 100_000;
        config.download_limited = true;
        let session = Session::new(config);
        session.add_torrent(42);
        let running = session.spawn();

        let addr = trickle_server(30_000, 3_000).await;
        let (tx, rx) = oneshot::channel();
        let started = std::time::Instant::now();
        session
            .fetch_webseed(
                42,
                format!("http://{addr}/file.bin"),
                None,
                Box::new(move |done| {
                    let _ = tx.send(done);
                }),
            )
            .unwrap();

        let out = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("webseed must finish once budget refills")
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(out.code, 200);
        assert_eq!(out.body.len(), 30_000);
        assert!(
            elapsed >= Duration::from_millis(150),
            "finished too fast: {elapsed:?}"
        );

        session.close().await;
        let _ = running.await;
    }

    #[tokio::test]
    async fn two_webseeds_on_one_torrent_share_the_root_limit() {
        // Two seeds on one torrent under a 100 kB/s root. Each server
        // offers ~200 kB/s, so the limiter is the binding constraint:
        // 100 kB combined against a 25 kB refill per 250 ms tick cannot
        // land inside the first two periods, and the third refill is what
        // lets the trailing transfer finish.
        let mut config = quiet_config();
        config.period_ms = 250;
        config.download_limit_bps = 100_000;
        config.download_limited = true;
        let session = Session::new(config);
        session.add_torrent(9);
        let running = session.spawn();

        let addr = trickle_server(50_000, 2_000).await;
        let started = std::time::Instant::now();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        session
            .fetch_webseed(
                9,
                format!("http://{addr}/a.bin"),
                None,
                Box::new(move |done| {
                    let _ = tx_a.send(done);
                }),
            )
            .unwrap();
        session
            .fetch_webseed(
                9,
                format!("http://{addr}/b.bin"),
                None,
                Box::new(move |done| {
                    let _ = tx_b.send(done);
                }),
            )
            .unwrap();

        let a = tokio::time::timeout(Duration::from_secs(10), rx_a)
            .await
            .expect("first webseed must finish within the window")
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(10), rx_b)
            .await
            .expect("second webseed must finish within the window")
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(a.code, 200);
        assert_eq!(b.code, 200);
        let combined = a.body.len() + b.body.len();
        assert_eq!(combined, 100_000);
        assert!(
            elapsed >= Duration::from_millis(450),
            "combined {combined} bytes finished too fast for the limit: {elapsed:?}"
        );

        session.close().await;
        let _ = running.await;
    }

    #[tokio::test]
    async fn completion_callbacks_run_even_without_torrents() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
                    .await;
            }
        });

        let session = Session::new(quiet_config());
        let running = session.spawn();

        let (tx, rx) = oneshot::channel();
        session
            .fetch(
                format!("http://{addr}/scrape"),
                Box::new(move |done| {
                    let _ = tx.send(done);
                }),
            )
            .unwrap();

        let out = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&out.body[..], b"hi");

        session.close().await;
        let _ = running.await;
    }
}
