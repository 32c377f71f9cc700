//! CLI entry point: one authoritative server or one replica client on a
//! demo topic, driven by a poll-based readiness loop over the fds the
//! backend reports.

mod backend;
mod dump;
mod frontend;
mod proto;
mod transport;
mod types;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use backend::{AuthorityBackend, ReplicaBackend, SelectParams};
use frontend::{AuthorityFrontend, KvFrontend, ReplicaFrontend};
use types::QueryStatus;

const DEMO_TOPIC: &str = "example0";

/// Loop iterations between counter bumps and state dumps.
const STATUS_INTERVAL: u64 = 10;

/// Fallback wait when the backend reports no deadline.
const IDLE_TICK: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(about = "Replicated topic-scoped key-value store")]
struct Args {
    /// Run as the authoritative server
    #[arg(short = 's', long = "server", conflicts_with = "client")]
    server: bool,

    /// Run as a non-authoritative client
    #[arg(short = 'c', long = "client")]
    client: bool,

    /// First of the three consecutive TCP ports (reply, publish, pull)
    #[arg(short = 'p', long = "port", default_value_t = 10000)]
    port: u16,

    /// Instance label, used in the demo counter key (default: process id)
    #[arg(short = 'n', long = "name")]
    name: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let name = args.name.clone().unwrap_or_else(|| std::process::id().to_string());
    let addrs = channel_addrs(args.port)?;

    if args.server {
        run_server(&addrs, &name)
    } else {
        run_client(&addrs, &name)
    }
}

/// Three consecutive loopback ports, URI style.
fn channel_addrs(first_port: u16) -> Result<[String; 3]> {
    if first_port > u16::MAX - 2 {
        bail!("port {first_port} leaves no room for three consecutive ports");
    }
    Ok([0u16, 1, 2].map(|i| format!("tcp://127.0.0.1:{}", first_port + i)))
}

/// Block until any reported fd is ready or the deadline (or idle tick)
/// passes.
fn wait_ready(params: &SelectParams) -> Result<()> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;

    let mut fds: Vec<PollFd> = Vec::with_capacity(params.read_fds.len() + params.write_fds.len());
    // The backend owns these fds and is not touched until poll returns, so
    // borrowing them raw for the duration of the call is sound.
    for &fd in &params.read_fds {
        fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN));
    }
    for &fd in &params.write_fds {
        fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLOUT));
    }

    let wait = params
        .deadline
        .map(|d| d.saturating_duration_since(Instant::now()).min(IDLE_TICK))
        .unwrap_or(IDLE_TICK);
    let timeout = PollTimeout::from(wait.as_millis().min(u16::MAX as u128) as u16);

    match poll(&mut fds, timeout) {
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::EINTR) => Ok(()),
        Err(e) => Err(e).context("readiness wait failed"),
    }
}

fn run_server(addrs: &[String; 3], name: &str) -> Result<()> {
    let frontend = Rc::new(RefCell::new(AuthorityFrontend::new(DEMO_TOPIC)));
    let backend = Rc::new(RefCell::new(AuthorityBackend::new()));
    AuthorityFrontend::add_backend(&frontend, &backend);

    let counter_key = format!("io_count_{name}");
    frontend.borrow_mut().insert(counter_key.as_bytes(), 0);

    backend
        .borrow_mut()
        .listen(&addrs[0], &addrs[1], &addrs[2])
        .context("failed to listen")?;
    info!(topic = DEMO_TOPIC, reply = %addrs[0], publish = %addrs[1], pull = %addrs[2], "serving");

    let mut ticks: u64 = 0;
    loop {
        let params = backend.borrow().select_params();
        wait_ready(&params)?;
        backend.borrow_mut().process_io();
        ticks += 1;

        if ticks % STATUS_INTERVAL == 0 {
            frontend.borrow_mut().increment(counter_key.as_bytes(), STATUS_INTERVAL as i64);
            println!("{}", frontend.borrow().dump().to_json());
        }
    }
}

fn run_client(addrs: &[String; 3], name: &str) -> Result<()> {
    let frontend = Rc::new(RefCell::new(ReplicaFrontend::new(DEMO_TOPIC)));
    let backend = Rc::new(RefCell::new(ReplicaBackend::new()));

    backend
        .borrow_mut()
        .connect(&addrs[0], &addrs[1], &addrs[2])
        .context("failed to connect")?;
    if !ReplicaFrontend::pair(&frontend, &backend) {
        bail!("failed to pair frontend with backend");
    }
    info!(topic = DEMO_TOPIC, request = %addrs[0], subscribe = %addrs[1], push = %addrs[2], "connected");

    let counter_key = format!("io_count_{name}");
    frontend.borrow_mut().insert(counter_key.as_bytes(), 0);

    let mut ticks: u64 = 0;
    loop {
        let params = backend.borrow().select_params();
        wait_ready(&params)?;
        backend.borrow_mut().process_io();
        ticks += 1;

        if ticks % STATUS_INTERVAL == 0 {
            frontend.borrow_mut().increment(counter_key.as_bytes(), STATUS_INTERVAL as i64);
            frontend.borrow_mut().lookup_async(
                b"io_count_server",
                Duration::from_secs(5),
                Box::new(|key, value, status| {
                    let key = String::from_utf8_lossy(key);
                    match (status, value) {
                        (QueryStatus::Success, Some(v)) => info!(%key, value = v, "lookup"),
                        (QueryStatus::Success, None) => info!(%key, "lookup: key absent"),
                        (status, _) => info!(%key, ?status, "lookup failed"),
                    }
                }),
            );
            println!("{}", frontend.borrow().dump().to_json());
        }
    }
}
