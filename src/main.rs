//! `framed-tcp-server`: a length-prefixed TCP framing server.
//!
//! This binary is deliberately thin: load configuration, initialize
//! logging, construct a [`framed_tcp_server::Server`], start it, and
//! block until a shutdown signal arrives. Payload decoding and
//! application behavior for received frames are out of scope here — a
//! caller embeds this crate as a library and registers its own handler
//! via `on_packet_received` to do anything with the frames it delivers.

mod config;

use config::Config;
use framed_tcp_server::Server;
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long a graceful shutdown gets to drain connections before a second
/// Ctrl-C (or silence past this deadline) escalates to a forced close.
const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!(
        listen = %config.listen,
        port = config.port,
        max_body_len = config.max_body_len,
        max_connections = config.max_connections,
        "starting framed-tcp-server"
    );

    let server = Server::new(config.to_server_config());
    server.start(config.port)?;

    let shutdown_signal = install_shutdown_signal_handler()?;
    shutdown_signal
        .recv()
        .expect("signal channel closed unexpectedly");

    // Stop admitting new connections and let live ones drain as soon as
    // the first signal arrives, rather than waiting out the whole grace
    // period before telling the server anything.
    info!("shutdown signal received, draining connections");
    server.stop(false);

    if wait_for_forced_shutdown(&shutdown_signal) {
        server.stop(true);
    }

    info!("shutdown complete");
    Ok(())
}

/// Install the Ctrl-C/SIGTERM handler and return the channel it signals.
fn install_shutdown_signal_handler() -> Result<mpsc::Receiver<()>, ctrlc::Error> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    Ok(rx)
}

/// Having already started a graceful shutdown, wait up to
/// `GRACEFUL_SHUTDOWN_GRACE` for a second signal; a second signal, or
/// silence past the deadline, escalates to a forced shutdown — mirroring
/// the common "press again to force quit" convention.
fn wait_for_forced_shutdown(shutdown_signal: &mpsc::Receiver<()>) -> bool {
    match shutdown_signal.recv_timeout(GRACEFUL_SHUTDOWN_GRACE) {
        Ok(()) => {
            info!("second shutdown signal received, forcing close");
            true
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            info!("graceful shutdown deadline elapsed, forcing close");
            true
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => false,
    }
}
