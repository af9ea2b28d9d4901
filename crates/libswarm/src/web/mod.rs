//! Outbound web transport.
//!
//! A single transport task owns every HTTP transfer the engine makes:
//! tracker announces and scrapes, and webseed range requests. Other tasks
//! interact through two operations only: `submit`, which appends to a
//! guarded pending list, and `close`. Completions are handed back to the
//! session's event queue, so callbacks observe the same serialization as
//! the rest of the session state.

mod cookies;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use reqwest::{header, redirect};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::error::SwarmError;

/// Identity of a torrent participating in the bandwidth tree.
pub type TorrentId = u64;

/// Job handed to the session's event queue for serialized execution.
pub type EventJob = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on one transport-loop wait.
const MAX_WAIT_MS: u64 = 200;
/// Tighter bound while winding down.
const CLOSING_WAIT_MS: u64 = 100;

const SCRAPE_TIMEOUT_SECS: u64 = 30;
const ANNOUNCE_TIMEOUT_SECS: u64 = 90;
const CLOSING_TIMEOUT_SECS: u64 = 20;
/// Webseed fragments are large; give them plenty of rope.
const DEFAULT_TIMEOUT_SECS: u64 = 240;

/// How the transport should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Finish everything in flight, then exit.
    DrainWhenIdle,
    /// Cancel in-flight transfers and discard pending tasks.
    Immediate,
}

/// Budget decisions for webseed downloads, backed by the owning torrent's
/// root bandwidth node.
pub trait BandwidthGate: Send + Sync {
    /// Largest share of `bytes` the torrent may receive right now.
    fn clamp(&self, torrent: TorrentId, bytes: usize) -> usize;
    /// Account bytes actually received.
    fn consumed(&self, torrent: TorrentId, bytes: usize);
}

/// A gate that never throttles.
pub struct OpenGate;

impl BandwidthGate for OpenGate {
    fn clamp(&self, _torrent: TorrentId, bytes: usize) -> usize {
        bytes
    }

    fn consumed(&self, _torrent: TorrentId, _bytes: usize) {}
}

/// Outcome delivered to a task's completion callback.
#[derive(Debug)]
pub struct WebDone {
    pub did_connect: bool,
    pub did_timeout: bool,
    /// Final HTTP status; 0 when no response arrived.
    pub code: u16,
    pub body: Bytes,
    /// URL after redirects, when a response was received.
    pub effective_url: Option<String>,
}

pub type DoneFunc = Box<dyn FnOnce(WebDone) + Send + 'static>;

/// One queued request.
pub struct WebTask {
    pub url: String,
    pub torrent: Option<TorrentId>,
    pub range: Option<String>,
    pub cookies: Option<String>,
    pub done: DoneFunc,
}

/// Transport configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Log transfer progress verbosely (`TR_CURL_VERBOSE`).
    pub verbose: bool,
    /// Verify TLS certificates (cleared by `TR_CURL_SSL_NO_VERIFY`).
    pub ssl_verify: bool,
    /// Explicit CA bundle (`CURL_CA_BUNDLE`); the backend's store plus the
    /// operating-system roots otherwise.
    pub ca_bundle: Option<PathBuf>,
    /// Netscape cookie jar, `cookies.txt` in the session config dir.
    pub cookie_file: Option<PathBuf>,
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            ssl_verify: true,
            ca_bundle: None,
            cookie_file: None,
            bind_v4: None,
            bind_v6: None,
        }
    }
}

impl WebConfig {
    /// Resolve the documented environment overrides and pick up the cookie
    /// jar from the session config directory.
    pub fn from_env(config_dir: &Path) -> Self {
        let cookie_file = {
            let path = config_dir.join("cookies.txt");
            path.exists().then_some(path)
        };
        Self {
            verbose: std::env::var_os("TR_CURL_VERBOSE").is_some(),
            ssl_verify: std::env::var_os("TR_CURL_SSL_NO_VERIFY").is_none(),
            ca_bundle: std::env::var_os("CURL_CA_BUNDLE").map(PathBuf::from),
            cookie_file,
            bind_v4: None,
            bind_v6: None,
        }
    }
}

struct Shared {
    pending: Mutex<Vec<WebTask>>,
    close_mode: Mutex<Option<CloseMode>>,
    wake: Notify,
    started: AtomicBool,
    exited: watch::Sender<bool>,
    session_open: Arc<AtomicBool>,
    gate: Arc<dyn BandwidthGate>,
    event_tx: mpsc::UnboundedSender<EventJob>,
    config: WebConfig,
}

/// Handle to the transport. Cloning is cheap; all clones drive the same
/// transport task.
#[derive(Clone)]
pub struct WebTransport {
    shared: Arc<Shared>,
}

impl WebTransport {
    pub fn new(
        config: WebConfig,
        gate: Arc<dyn BandwidthGate>,
        event_tx: mpsc::UnboundedSender<EventJob>,
        session_open: Arc<AtomicBool>,
    ) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                close_mode: Mutex::new(None),
                wake: Notify::new(),
                started: AtomicBool::new(false),
                exited,
                session_open,
                gate,
                event_tx,
                config,
            }),
        }
    }

    /// Fetch a URL (tracker request, favicon, ...). Not speed limited.
    pub fn fetch(&self, url: impl Into<String>, done: DoneFunc) -> Result<(), SwarmError> {
        self.submit(WebTask {
            url: url.into(),
            torrent: None,
            range: None,
            cookies: None,
            done,
        })
    }

    pub fn fetch_with_cookies(
        &self,
        url: impl Into<String>,
        cookies: impl Into<String>,
        done: DoneFunc,
    ) -> Result<(), SwarmError> {
        self.submit(WebTask {
            url: url.into(),
            torrent: None,
            range: None,
            cookies: Some(cookies.into()),
            done,
        })
    }

    /// Fetch a byte range from a webseed; throttled through the torrent's
    /// bandwidth node.
    pub fn fetch_webseed(
        &self,
        torrent: TorrentId,
        url: impl Into<String>,
        range: Option<String>,
        done: DoneFunc,
    ) -> Result<(), SwarmError> {
        self.submit(WebTask {
            url: url.into(),
            torrent: Some(torrent),
            range,
            cookies: None,
            done,
        })
    }

    /// Queue a task for the transport task to adopt on its next pass.
    /// Tasks submitted from one thread are adopted in FIFO order.
    pub fn submit(&self, task: WebTask) -> Result<(), SwarmError> {
        if self.shared.close_mode.lock().unwrap().is_some() {
            return Err(SwarmError::Closing);
        }
        self.shared.pending.lock().unwrap().push(task);
        self.ensure_started();
        self.shared.wake.notify_one();
        Ok(())
    }

    fn ensure_started(&self) {
        if !self.shared.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(transport_loop(self.shared.clone()));
        }
    }

    /// Wind the transport down. `Immediate` returns once the transport
    /// task has exited; pending tasks are dropped without running their
    /// completion callbacks.
    pub async fn close(&self, mode: CloseMode) {
        *self.shared.close_mode.lock().unwrap() = Some(mode);
        self.shared.wake.notify_one();

        if !self.shared.started.load(Ordering::SeqCst) {
            let dropped = self.shared.pending.lock().unwrap().drain(..).count();
            if dropped > 0 {
                debug!(dropped, "discarding web tasks; transport never ran");
            }
            return;
        }

        if mode == CloseMode::Immediate {
            let mut exited = self.shared.exited.subscribe();
            while !*exited.borrow_and_update() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

struct FinishedTransfer {
    done: DoneFunc,
    result: WebDone,
}

type PausedSet = Arc<Mutex<HashMap<u64, Arc<Notify>>>>;

async fn transport_loop(shared: Arc<Shared>) {
    let client = match build_client(&shared.config) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "falling back to a default http client");
            reqwest::Client::new()
        }
    };

    let mut in_flight: FuturesUnordered<BoxFuture<'static, FinishedTransfer>> =
        FuturesUnordered::new();
    let paused: PausedSet = Arc::new(Mutex::new(HashMap::new()));
    let mut next_task_id = 0u64;

    info!(ssl_verify = shared.config.ssl_verify, "web transport running");

    loop {
        let close_mode = *shared.close_mode.lock().unwrap();
        if close_mode == Some(CloseMode::Immediate) {
            break;
        }
        if close_mode == Some(CloseMode::DrainWhenIdle)
            && in_flight.is_empty()
            && shared.pending.lock().unwrap().is_empty()
        {
            break;
        }

        // adopt submitted tasks, oldest first
        let adopted: Vec<WebTask> = shared.pending.lock().unwrap().drain(..).collect();
        for task in adopted {
            let id = next_task_id;
            next_task_id += 1;
            debug!(id, url = %task.url, "adopting web task");
            in_flight.push(run_transfer(client.clone(), shared.clone(), paused.clone(), id, task).boxed());
        }

        // Resume paused transfers. Swapping the set out first keeps a
        // transfer that re-pauses from oscillating within one pass.
        let resumed: Vec<Arc<Notify>> = {
            let mut paused = paused.lock().unwrap();
            paused.drain().map(|(_, notify)| notify).collect()
        };
        for notify in resumed {
            notify.notify_one();
        }

        let wait = Duration::from_millis(if close_mode.is_some() {
            CLOSING_WAIT_MS
        } else {
            MAX_WAIT_MS
        });
        tokio::select! {
            finished = in_flight.next(), if !in_flight.is_empty() => {
                if let Some(finished) = finished {
                    deliver(&shared, finished);
                }
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    // Tasks that never started are dropped without running their
    // completion callbacks.
    let leftovers: Vec<WebTask> = shared.pending.lock().unwrap().drain(..).collect();
    for task in &leftovers {
        debug!(url = %task.url, "discarding pending web task");
    }
    drop(leftovers);
    drop(in_flight);

    info!("web transport exited");
    shared.exited.send_replace(true);
}

/// Post a completion to the event queue, in the order the transport
/// observed it.
fn deliver(shared: &Shared, finished: FinishedTransfer) {
    debug!(
        code = finished.result.code,
        timed_out = finished.result.did_timeout,
        "web task finished"
    );
    let FinishedTransfer { done, result } = finished;
    let job: EventJob = Box::new(move || done(result));
    if shared.event_tx.send(job).is_err() {
        debug!("event queue gone; dropping completion");
    }
}

async fn run_transfer(
    client: reqwest::Client,
    shared: Arc<Shared>,
    paused: PausedSet,
    id: u64,
    task: WebTask,
) -> FinishedTransfer {
    let timeout_secs = timeout_for_url(&task.url, shared.session_open.load(Ordering::SeqCst));
    let started = Instant::now();

    let mut request = client
        .get(&task.url)
        .timeout(Duration::from_secs(timeout_secs));
    if let Some(range) = &task.range {
        // range bytes must be directly usable by the caller: no
        // compressed payloads
        request = request
            .header(header::RANGE, range.clone())
            .header(header::ACCEPT_ENCODING, "identity");
    }
    if let Some(cookies) = &task.cookies {
        request = request.header(header::COOKIE, cookies.clone());
    }

    let verbose = shared.config.verbose;
    let torrent = task.torrent;
    let outcome: Result<(u16, String, Vec<u8>), reqwest::Error> = async {
        let mut response = request.send().await?;
        let code = response.status().as_u16();
        let effective_url = response.url().to_string();
        let mut body = Vec::new();

        while let Some(chunk) = response.chunk().await? {
            if let Some(torrent) = torrent {
                if !chunk.is_empty() {
                    // webseed downloads are speed limited: park until the
                    // torrent's node grants bytes again
                    while shared.gate.clamp(torrent, chunk.len()) == 0 {
                        let resume = Arc::new(Notify::new());
                        paused.lock().unwrap().insert(id, resume.clone());
                        resume.notified().await;
                    }
                    shared.gate.consumed(torrent, chunk.len());
                }
            }
            if verbose {
                debug!(id, bytes = chunk.len(), "body chunk");
            }
            body.extend_from_slice(&chunk);
        }

        Ok((code, effective_url, body))
    }
    .await;

    let result = match outcome {
        Ok((code, effective_url, body)) => WebDone {
            did_connect: true,
            did_timeout: false,
            code,
            body: Bytes::from(body),
            effective_url: Some(effective_url),
        },
        Err(err) => {
            let code = err.status().map(|status| status.as_u16()).unwrap_or(0);
            let elapsed = started.elapsed().as_secs_f64();
            let did_timeout =
                code == 0 && (err.is_timeout() || elapsed >= timeout_secs as f64);
            let did_connect = code > 0 || !err.is_connect();
            debug!(id, error = %err, did_timeout, "web task failed");
            WebDone {
                did_connect,
                did_timeout,
                code,
                body: Bytes::new(),
                effective_url: None,
            }
        }
    };

    FinishedTransfer { done: task.done, result }
}

/// Announce and scrape exchanges are tiny and trackers flaky, so they get
/// short leashes; webseed payloads get the long default. A closing session
/// keeps everything on a short fuse.
fn timeout_for_url(url: &str, session_open: bool) -> u64 {
    if !session_open {
        CLOSING_TIMEOUT_SECS
    } else if url.contains("scrape") {
        SCRAPE_TIMEOUT_SECS
    } else if url.contains("announce") {
        ANNOUNCE_TIMEOUT_SECS
    } else {
        DEFAULT_TIMEOUT_SECS
    }
}

fn build_client(config: &WebConfig) -> Result<reqwest::Client, SwarmError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("libswarm/", env!("CARGO_PKG_VERSION")))
        .referer(true)
        .gzip(true)
        .redirect(redirect::Policy::custom(|attempt| attempt.follow()))
        .connection_verbose(config.verbose);

    if !config.ssl_verify {
        builder = builder.danger_accept_invalid_certs(true);
    } else if let Some(path) = &config.ca_bundle {
        let pem = std::fs::read(path)?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
            builder = builder.add_root_certificate(cert);
        }
        info!(bundle = %path.display(), "verifying tls against explicit ca bundle");
    }

    if let Some(file) = &config.cookie_file {
        if let Some(jar) = cookies::load_jar(file) {
            builder = builder.cookie_provider(Arc::new(jar));
        }
    }

    if let Some(addr) = config.bind_v4 {
        builder = builder.local_address(addr);
    } else if let Some(addr) = config.bind_v6 {
        builder = builder.local_address(addr);
    }

    Ok(builder.build()?)
}
