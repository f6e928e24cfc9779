//! End-to-end tests that drive the full downstream-auth → upstream-dial →
//! bridge path with two real in-process `russh` endpoints: this crate's
//! proxy, and a tiny stand-in SSH server playing the role of the tenant VM.
//! No external process or database is involved — the directory resolver
//! and audit sink are the in-memory fakes from `ssh_bastion::{directory,
//! audit}::testing`. Covers spec.md §8 scenarios S1, S2, S3, S4, S5.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::PrivateKey;
use russh::server::{Auth, Handler as ServerHandler, Msg, Server as _, Session};
use russh::{client, Channel, ChannelId, ChannelMsg};
use tokio::net::TcpListener;

use ssh_bastion::audit::testing::FakeAuditSink;
use ssh_bastion::config::Config;
use ssh_bastion::directory::testing::FakeDirectoryResolver;

const TARGET_USERNAME: &str = "alice";
const TARGET_PASSWORD: &str = "correct-horse";

/// A minimal SSH server standing in for the tenant VM the proxy dials.
/// Accepts exactly one username/password pair and echoes back whatever it
/// receives on the channel, which is enough to prove bytes made the round
/// trip through the bridge in both directions.
#[derive(Clone)]
struct FakeTarget {
    received_execs: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether `channel_eof` sends an explicit `ExitStatus` before closing.
    /// `false` exercises the "clean close, no status" path some real
    /// `sftp-server` processes take (spec §4.F: downstream should still see
    /// exit-status 0, not the bridge's I/O-error fallback).
    send_exit_status: bool,
}

impl russh::server::Server for FakeTarget {
    type Handler = FakeTargetHandler;

    fn new_client(&mut self, _peer_addr: Option<std::net::SocketAddr>) -> Self::Handler {
        FakeTargetHandler {
            received_execs: self.received_execs.clone(),
            is_exec_like: false,
            send_exit_status: self.send_exit_status,
        }
    }
}

struct FakeTargetHandler {
    received_execs: Arc<Mutex<Vec<Vec<u8>>>>,
    is_exec_like: bool,
    send_exit_status: bool,
}

#[async_trait]
impl ServerHandler for FakeTargetHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == TARGET_USERNAME && password == TARGET_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        self.is_exec_like = true;
        self.received_execs.lock().unwrap().push(data.to_vec());
        session.channel_success(channel)?;
        session.data(channel, russh::CryptoVec::from(data.to_vec()))?;
        Ok(())
    }

    async fn subsystem_request(&mut self, channel: ChannelId, _name: &str, session: &mut Session) -> Result<(), Self::Error> {
        self.is_exec_like = true;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        session.data(channel, russh::CryptoVec::from(data.to_vec()))?;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        if self.is_exec_like && self.send_exit_status {
            session.exit_status_request(channel, 0)?;
        }
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}

async fn spawn_fake_target() -> (std::net::SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
    spawn_fake_target_with(true).await
}

async fn spawn_fake_target_with(send_exit_status: bool) -> (std::net::SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
    let received_execs = Arc::new(Mutex::new(Vec::new()));
    let key = PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519).unwrap();
    let config = Arc::new(russh::server::Config { keys: vec![key], ..Default::default() });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = FakeTarget { received_execs: received_execs.clone(), send_exit_status };
    tokio::spawn(async move {
        let _ = server.run_on_socket(config, &listener).await;
    });
    (addr, received_execs)
}

struct TestClient;

#[async_trait]
impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Harness {
    proxy_addr: std::net::SocketAddr,
    audit: Arc<FakeAuditSink>,
    log_dir: tempfile::TempDir,
}

/// `target_ssh_port` is a single crate-wide config value, so tests that
/// need a live fake target pin it to that target's freshly bound port and
/// resolve the vm id to the target's bare IP.
async fn spawn_proxy(vms: HashMap<u64, String>, target_ssh_port: u16) -> Harness {
    let host_key = PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519).unwrap();
    let directory: Arc<dyn ssh_bastion::directory::DirectoryResolver> = Arc::new(FakeDirectoryResolver::new(vms));
    let audit = Arc::new(FakeAuditSink::default());
    let log_dir = tempfile::tempdir().unwrap();

    let config = Config {
        bind_address: "127.0.0.1".to_string(),
        bind_port: 0,
        max_connections: 16,
        server_key_file: String::new(),
        db_host: String::new(),
        db_port: 0,
        db_username: String::new(),
        db_password: String::new(),
        db_name: String::new(),
        max_command_length: 10_000,
        target_ssh_port,
        log_dir: log_dir.path().to_string_lossy().to_string(),
    };

    let (server_config, mut proxy_server) = ssh_bastion::build_server(
        host_key,
        directory,
        audit.clone() as Arc<dyn ssh_bastion::audit::AuditSink>,
        &config,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = proxy_server.run_on_socket(server_config, &listener).await;
    });

    Harness { proxy_addr, audit, log_dir }
}

async fn connect_downstream(proxy_addr: std::net::SocketAddr) -> client::Handle<TestClient> {
    let config = Arc::new(client::Config::default());
    client::connect(config, proxy_addr, TestClient).await.expect("connect to proxy")
}

#[tokio::test]
async fn s1_shell_happy_path_bridges_bytes_and_audits_command() {
    let (target_addr, _) = spawn_fake_target().await;
    let mut vms = HashMap::new();
    vms.insert(42, target_addr.ip().to_string());
    let harness = spawn_proxy(vms, target_addr.port()).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_pty(false, "xterm", 80, 24, 0, 0, &[]).await.unwrap();
    channel.request_shell(false).await.unwrap();
    channel.data(Cursor::new(b"ls -la\r\n".to_vec())).await.unwrap();

    // The fake target echoes bytes straight back; wait for them to make the
    // full round trip through the bridge.
    let mut echoed = Vec::new();
    while echoed.len() < b"ls -la\r\n".len() {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => echoed.extend_from_slice(&data),
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(echoed, b"ls -la\r\n");

    // The audit record and session-file line are produced by the downstream
    // `data` callback synchronously with the forward, so they are visible
    // by the time the echo has rounded the trip.
    let records = harness.audit.records.lock().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].vm_id, 42);
    assert_eq!(records[0].username, TARGET_USERNAME);
    assert_eq!(records[0].command, "ls -la");
    drop(records);

    let mut log_files = std::fs::read_dir(harness.log_dir.path()).unwrap();
    let entry = log_files.next().expect("session log file created").unwrap();
    let contents = std::fs::read_to_string(entry.path()).unwrap();
    assert!(contents.contains("Command: ls -la"), "log contents: {contents}");
}

#[tokio::test]
async fn s2_exec_mode_bridges_without_auditing_and_propagates_exit_status() {
    let (target_addr, received_execs) = spawn_fake_target().await;
    let mut vms = HashMap::new();
    vms.insert(42, target_addr.ip().to_string());
    let harness = spawn_proxy(vms, target_addr.port()).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(false, &b"scp -t /tmp/x"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let mut exit_status = None;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                exit_status = Some(status);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(exit_status, Some(0));
    assert_eq!(received_execs.lock().unwrap().as_slice(), &[b"scp -t /tmp/x".to_vec()]);

    // Exec mode never runs the command extractor.
    assert!(harness.audit.records.lock().await.is_empty());
}

#[tokio::test]
async fn s3_sftp_subsystem_bridges_and_exits_clean() {
    let (target_addr, _) = spawn_fake_target().await;
    let mut vms = HashMap::new();
    vms.insert(42, target_addr.ip().to_string());
    let harness = spawn_proxy(vms, target_addr.port()).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(false, "sftp").await.unwrap();
    channel.eof().await.unwrap();

    let mut exit_status = None;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                exit_status = Some(status);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(exit_status, Some(0));
    assert!(harness.audit.records.lock().await.is_empty());
}

#[tokio::test]
async fn subsystem_clean_close_without_explicit_status_reports_zero() {
    // The upstream here closes the channel without ever sending
    // `ChannelMsg::ExitStatus` — spec §4.F still requires downstream to see
    // exit-status 0 for a clean close, not the bridge's I/O-error fallback.
    let (target_addr, _) = spawn_fake_target_with(false).await;
    let mut vms = HashMap::new();
    vms.insert(42, target_addr.ip().to_string());
    let harness = spawn_proxy(vms, target_addr.port()).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(false, "sftp").await.unwrap();
    channel.eof().await.unwrap();

    let mut exit_status = None;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                exit_status = Some(status);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(exit_status, Some(0), "clean close with no explicit status must report 0, not the error fallback");
}

#[tokio::test]
async fn s4_unknown_vm_rejects_without_upstream_dial() {
    let harness = spawn_proxy(HashMap::new(), 0).await;
    let mut session = connect_downstream(harness.proxy_addr).await;
    let authed = session.authenticate_password("999-alice", "whatever").await.unwrap();
    assert!(!authed.success());
    assert!(harness.audit.records.lock().await.is_empty());
}

#[tokio::test]
async fn upstream_dial_failure_sends_exit_status_one_for_exec() {
    // Resolve to a real IP with nothing listening on the target port, so the
    // upstream dial fails (connection refused) rather than never completing.
    let mut vms = HashMap::new();
    vms.insert(42, "127.0.0.1".to_string());
    let unused_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let harness = spawn_proxy(vms, unused_port).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(false, &b"scp -t /tmp/x"[..]).await.unwrap();

    let mut exit_status = None;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                exit_status = Some(status);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(exit_status, Some(1), "spec §7: UpstreamDialFail on exec/subsystem sends exit-status 1");
    assert!(harness.audit.records.lock().await.is_empty());
}

#[tokio::test]
async fn s5_malformed_username_rejects_without_parsing_vm_id() {
    let harness = spawn_proxy(HashMap::new(), 0).await;
    let mut session = connect_downstream(harness.proxy_addr).await;
    let authed = session.authenticate_password("alice", "whatever").await.unwrap();
    assert!(!authed.success());
}

#[tokio::test]
async fn malformed_vm_id_prefix_rejects() {
    let harness = spawn_proxy(HashMap::new(), 0).await;
    let mut session = connect_downstream(harness.proxy_addr).await;
    let authed = session.authenticate_password("not-a-number-alice", "whatever").await.unwrap();
    assert!(!authed.success());
}

#[tokio::test(start_paused = true)]
async fn s6_no_session_after_auth_times_out_and_closes_transport() {
    let (target_addr, _) = spawn_fake_target().await;
    let mut vms = HashMap::new();
    vms.insert(42, target_addr.ip().to_string());
    let harness = spawn_proxy(vms, target_addr.port()).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    // Open the session channel but never request shell/exec/subsystem.
    let mut channel = session.channel_open_session().await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;

    // The AWAIT_SESSION watchdog closes the channel once the 30s bound
    // elapses with no session request; the client observes EOF/close
    // rather than any data or exit status.
    let mut saw_close = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Close)) | Ok(None) => {
                saw_close = true;
                break;
            }
            Ok(Some(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(saw_close, "expected the channel to be closed after the AWAIT_SESSION timeout");
}

#[tokio::test]
async fn s7_long_command_splits_into_max_command_length_chunks() {
    let (target_addr, _) = spawn_fake_target().await;
    let mut vms = HashMap::new();
    vms.insert(42, target_addr.ip().to_string());
    let harness = spawn_proxy(vms, target_addr.port()).await;

    let mut session = connect_downstream(harness.proxy_addr).await;
    let username = format!("42-{}", TARGET_USERNAME);
    let authed = session.authenticate_password(&username, TARGET_PASSWORD).await.unwrap();
    assert!(authed.success());

    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_pty(false, "xterm", 80, 24, 0, 0, &[]).await.unwrap();
    channel.request_shell(false).await.unwrap();

    let long_command: String = std::iter::repeat('a').take(25_000).collect();
    let mut payload = long_command.clone().into_bytes();
    payload.push(b'\n');
    channel.data(Cursor::new(payload.clone())).await.unwrap();

    // Wait for the fake target's echo to round-trip in full, which proves
    // the extractor already observed the trailing newline and emitted its
    // audit records synchronously in the `data` callback.
    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        match tokio::time::timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => echoed.extend_from_slice(&data),
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(echoed, payload);

    let records = harness.audit.records.lock().await;
    assert_eq!(records.len(), 3);
    for record in records.iter() {
        assert_eq!(record.vm_id, 42);
        assert_eq!(record.username, TARGET_USERNAME);
    }
    let reassembled: String = records.iter().map(|r| r.command.as_str()).collect();
    assert_eq!(reassembled, long_command);
}
