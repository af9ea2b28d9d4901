use libswarm::{Direction, Session, SessionConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn init_tracing() {
    if tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .finish(),
    )
    .is_err()
    {
        // tracing already initialized
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://example.com/".to_string());
    let limit_bps: u64 = std::env::var("SWARM_DOWN_BPS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50_000);

    let mut config = SessionConfig::default();
    config.download_limit_bps = limit_bps;
    config.download_limited = true;
    config.port_forwarding = std::env::var_os("SWARM_PORT_FORWARDING").is_some();

    let session = Session::new(config);
    session.set_speed_limit(Direction::Down, limit_bps, true);
    session.add_torrent(1);
    let running = session.spawn();

    info!(url, limit_bps, "fetching through the torrent limiter");
    let (tx, rx) = tokio::sync::oneshot::channel();
    session.fetch_webseed(
        1,
        url,
        None,
        Box::new(move |done| {
            let _ = tx.send(done);
        }),
    )?;

    let done = rx.await?;
    info!(
        code = done.code,
        bytes = done.body.len(),
        connected = done.did_connect,
        timed_out = done.did_timeout,
        "transfer finished"
    );

    session.close().await;
    let _ = running.await;
    Ok(())
}
