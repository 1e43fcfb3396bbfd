//! rudis: an in-memory key/value server.
//!
//! Single-threaded, readiness-driven event loop over non-blocking sockets,
//! speaking a length-prefixed binary protocol. Mutations are logged to an
//! append-only file that is replayed at startup.

mod aof;
mod buffer;
mod clock;
mod commands;
mod conn;
mod pool;
mod protocol;
mod server;
mod store;
mod zset;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::aof::Aof;
use crate::server::{Server, Shared};

const LISTEN_ADDR: &str = "0.0.0.0:1234";
const AOF_PATH: &str = "redis.aof";

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// SIGINT/SIGTERM raise the shutdown flag; poll returns with EINTR and the
/// loop exits at the top of the next tick.
fn install_signal_handlers() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("sigaction(SIGINT)")?;
        sigaction(Signal::SIGTERM, &action).context("sigaction(SIGTERM)")?;
    }
    Ok(())
}

fn make_listener() -> anyhow::Result<Socket> {
    let listener =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("socket()")?;
    listener.set_reuse_address(true).context("SO_REUSEADDR")?;
    let addr: SocketAddr = LISTEN_ADDR.parse().expect("static address");
    listener
        .bind(&addr.into())
        .with_context(|| format!("bind({LISTEN_ADDR})"))?;
    listener.set_nonblocking(true).context("set_nonblocking")?;
    listener.listen(libc::SOMAXCONN).context("listen()")?;
    Ok(listener)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    install_signal_handlers()?;

    let mut shared = Shared::new(Aof::open(PathBuf::from(AOF_PATH)));
    aof::replay(&mut shared);

    let listener = make_listener()?;
    info!("listening on {LISTEN_ADDR}");

    let mut server = Server::new(listener, shared);
    let result = server.run(&SHUTDOWN);
    server.shutdown();
    result.context("event loop")
}
