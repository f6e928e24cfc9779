//! ssh-bastion: a transparent SSH proxy. See each module for the component
//! of spec.md / SPEC_FULL.md it implements.

pub mod audit;
pub mod bridge;
pub mod command_extractor;
pub mod config;
pub mod consts;
pub mod directory;
pub mod downstream;
pub mod error;
pub mod session_log;
pub mod session_request;
pub mod supervisor;
pub mod test_hooks;
pub mod upstream;

use std::sync::Arc;

use anyhow::Context;
use russh::keys::PrivateKey;
use tracing::info;

use crate::audit::{AuditSink, MySqlAuditSink};
use crate::config::Config;
use crate::directory::{DirectoryResolver, MySqlDirectoryResolver};
use crate::downstream::ProxyServer;

/// Loads the persistent host key the downstream server adapter presents to
/// every client. Loaded once at startup and shared across all accepted
/// connections (SPEC_FULL.md §4.D) — a stable host-key identity is a
/// user-visible contract, so this never regenerates a missing key.
pub fn load_host_key(path: &str) -> anyhow::Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading server key file {:?}", path))?;
    PrivateKey::from_openssh(&pem).with_context(|| format!("parsing server key file {:?}", path))
}

/// Builds the `russh` server config (one host key, spec keepalive interval)
/// and the `ProxyServer` that accepts connections against it.
pub fn build_server(
    host_key: PrivateKey,
    directory: Arc<dyn DirectoryResolver>,
    audit: Arc<dyn AuditSink>,
    config: &Config,
) -> (Arc<russh::server::Config>, ProxyServer) {
    let server_config = russh::server::Config {
        keys: vec![host_key],
        keepalive_interval: Some(crate::consts::DOWNSTREAM_KEEPALIVE_INTERVAL),
        ..Default::default()
    };

    let proxy_server = ProxyServer {
        directory,
        audit,
        log_dir: config.log_dir.clone(),
        target_ssh_port: config.target_ssh_port,
        max_command_length: config.max_command_length,
    };

    (Arc::new(server_config), proxy_server)
}

/// Binds the listening TCP socket with an explicit accept-queue backlog
/// (`MAX_CONNECTIONS`, spec.md §6) — `tokio::net::TcpListener::bind` always
/// uses the OS default backlog, so the socket is built with `socket2` and
/// handed to tokio afterwards.
fn bind_listener(addr: &str, backlog: usize) -> anyhow::Result<tokio::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let sock_addr: std::net::SocketAddr = addr.parse().context("parsing bind address")?;
    let domain = if sock_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).context("creating listen socket")?;
    socket.set_reuse_address(true).context("setting SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("setting listen socket non-blocking")?;
    socket.bind(&sock_addr.into()).context("binding listen socket")?;
    socket.listen(backlog as i32).context("listening on socket")?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).context("handing listen socket to tokio")
}

/// Opens the MariaDB/MySQL pool backing both the directory resolver (A) and
/// the audit sink (B), per SPEC_FULL.md §4.A/§4.B — a single pool, shared,
/// since both components only ever issue short queries against it.
pub async fn connect_pool(config: &Config) -> anyhow::Result<sqlx::MySqlPool> {
    let url = format!(
        "mysql://{}:{}@{}:{}/{}",
        config.db_username, config.db_password, config.db_host, config.db_port, config.db_name
    );
    sqlx::MySqlPool::connect(&url)
        .await
        .context("connecting to directory/audit database")
}

/// Wires up the resolver and audit sink against a shared pool, then runs the
/// accept loop until the process is killed. This is the single entry point
/// `main.rs` calls after parsing its one CLI argument.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let host_key = load_host_key(&config.server_key_file)?;
    let pool = connect_pool(&config).await?;

    let directory: Arc<dyn DirectoryResolver> = Arc::new(MySqlDirectoryResolver::new(pool.clone()));
    let audit: Arc<dyn AuditSink> = Arc::new(MySqlAuditSink::new(pool));

    let (server_config, mut proxy_server) = build_server(host_key, directory, audit, &config);

    let bind_addr = config.bind_addr();
    let socket = bind_listener(&bind_addr, config.max_connections)
        .with_context(|| format!("binding to {}", bind_addr))?;
    info!(addr = %bind_addr, max_connections = config.max_connections, "ssh-bastion listening");

    test_hooks::emit!("listening");

    use russh::server::Server as _;
    tokio::select! {
        result = proxy_server.run_on_socket(server_config, &socket) => {
            result.context("running ssh server")?;
        }
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, no longer accepting downstream connections");
        }
    }

    Ok(())
}

/// Waits for whichever of SIGTERM/SIGINT/SIGQUIT arrives first, mirroring
/// the teacher's `daemon/signals.rs` (which reacts to the same
/// `signal_hook::consts::TERM_SIGNALS` set). In-flight bridged sessions are
/// tokio tasks detached from this future, so they finish on their own after
/// `run` returns; this crate has no persistent on-disk session state for
/// the signal handler to clean up the way the teacher's socket file cleanup
/// does.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("installing SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}
