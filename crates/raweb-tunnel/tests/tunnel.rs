//! End-to-end: browser WebSocket → tunnel → fake guacd.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use raweb_guacd::{
    ActiveSessionRegistry, HealthProbe, ImageIdentity, RuntimeError, RuntimeHost, Supervisor,
    SupervisorConfig,
};
use raweb_protocol::{Instruction, InstructionReader, TargetAddress};
use raweb_tunnel::auth::TrustedHeaderAuthenticator;
use raweb_tunnel::error::code;
use raweb_tunnel::resolver::{ResolveFailure, ResourceRequest, ResourceResolver};
use raweb_tunnel::target_probe::{ProbeFailure, TargetProbe};
use raweb_tunnel::{DaemonEndpoint, SessionSettings, TunnelContext, TunnelServer, UpgradePolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Browser = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DESKTOP: &str = "full address:s:127.0.0.1:3389\r\nscreen mode id:i:2\r\n";
const FORBIDDEN_REMOTE_APP: &str = "full address:s:127.0.0.1\r\n\
remoteapplicationmode:i:1\r\n\
remoteapplicationprogram:s:||calc\r\n\
remoteapplicationfile:s:C:\\notes.txt\r\n";
const UNRESOLVABLE: &str = "full address:s:rdp-host.invalid:3389\r\n";
const GATEWAYED: &str = "full address:s:127.0.0.1:3389\r\n\
gatewayhostname:s:gw.example:8443\r\n\
gatewayusagemethod:i:1\r\n";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct MemoryResolver(HashMap<String, String>);

impl ResourceResolver for MemoryResolver {
    fn resolve<'a>(&'a self, request: &'a ResourceRequest) -> BoxFuture<'a, Result<String, ResolveFailure>> {
        Box::pin(async move {
            self.0
                .get(&request.path)
                .cloned()
                .ok_or_else(|| ResolveFailure::not_found(&request.path))
        })
    }
}

struct TrustingProbe;

impl TargetProbe for TrustingProbe {
    fn probe<'a>(&'a self, _target: &'a TargetAddress) -> BoxFuture<'a, Result<(), ProbeFailure>> {
        Box::pin(async { Ok(()) })
    }
}

/// What the fake guacd saw on one connection, reported when it closes.
#[derive(Debug, Default)]
struct DaemonLog {
    instructions: Vec<Instruction>,
    raw_after_ready: Vec<u8>,
}

struct FakeGuacd {
    addr: String,
    log: mpsc::Receiver<DaemonLog>,
    /// Signalled when `connect` arrives, before `ready` is sent.
    connected: Arc<Notify>,
}

impl FakeGuacd {
    async fn next_log(&mut self) -> DaemonLog {
        tokio::time::timeout(Duration::from_secs(5), self.log.recv())
            .await
            .unwrap()
            .unwrap()
    }
}

const GUACD_ARGS: [&str; 10] = [
    "hostname",
    "port",
    "username",
    "password",
    "width",
    "security",
    "gateway-hostname",
    "gateway-port",
    "gateway-username",
    "gateway-password",
];

async fn fake_guacd(version: &'static str) -> FakeGuacd {
    fake_guacd_with(version, Duration::ZERO).await
}

/// Plays guacd with the given `args` version, answering `connect` with
/// `ready` after `ready_delay`. Connections that send nothing (health
/// checks) are not logged.
async fn fake_guacd_with(version: &'static str, ready_delay: Duration) -> FakeGuacd {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, log) = mpsc::channel(4);
    let connected = Arc::new(Notify::new());

    let on_connect = Arc::clone(&connected);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let on_connect = Arc::clone(&on_connect);
            tokio::spawn(async move {
                let log = play_guacd(stream, version, ready_delay, &on_connect).await;
                if !log.instructions.is_empty() {
                    let _ = tx.send(log).await;
                }
            });
        }
    });

    FakeGuacd {
        addr,
        log,
        connected,
    }
}

async fn play_guacd(
    mut stream: TcpStream,
    version: &'static str,
    ready_delay: Duration,
    on_connect: &Notify,
) -> DaemonLog {
    let mut reader = InstructionReader::new();
    let mut log = DaemonLog::default();
    let mut buf = [0u8; 4096];
    let mut ready = false;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if ready {
            log.raw_after_ready.extend_from_slice(&buf[..n]);
            continue;
        }
        for instruction in reader.push(&buf[..n]).unwrap() {
            let reply = match instruction.opcode() {
                "select" => Some(Instruction::new(
                    "args",
                    std::iter::once(version).chain(GUACD_ARGS),
                )),
                "connect" => {
                    on_connect.notify_one();
                    tokio::time::sleep(ready_delay).await;
                    ready = true;
                    Some(Instruction::new("ready", ["$4f1e-conn"]))
                }
                _ => None,
            };
            log.instructions.push(instruction);
            if let Some(reply) = reply {
                if stream.write_all(reply.encode().as_bytes()).await.is_err() {
                    return log;
                }
            }
            if ready && stream.write_all(b"4.sync,3.123;").await.is_err() {
                return log;
            }
        }
    }
    log
}

/// Runtime whose install and launch take a moment, so the browser sees
/// each lifecycle step. The "daemon" is a sleeping shell process.
#[derive(Default)]
struct SlowRuntime {
    installed: StdMutex<Vec<String>>,
}

const STEP: Duration = Duration::from_millis(200);

impl RuntimeHost for SlowRuntime {
    fn instance_prefix(&self) -> &str {
        "raweb-guacd"
    }

    fn check_platform(&self) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async { Ok(()) })
    }

    fn check_components(&self) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async { Ok(()) })
    }

    fn image_identity(&self) -> BoxFuture<'_, Result<ImageIdentity, RuntimeError>> {
        Box::pin(async { Ok(ImageIdentity::new("guacd.tar".into(), "raweb-guacd", 10, 20)) })
    }

    fn installed_instances(&self) -> BoxFuture<'_, Result<Vec<String>, RuntimeError>> {
        Box::pin(async move { Ok(self.installed.lock().unwrap().clone()) })
    }

    fn install<'a>(&'a self, identity: &'a ImageIdentity) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            tokio::time::sleep(STEP).await;
            self.installed.lock().unwrap().push(identity.instance.clone());
            Ok(())
        })
    }

    fn uninstall<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.installed.lock().unwrap().retain(|n| n != instance);
            Ok(())
        })
    }

    fn terminate<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async { Ok(()) })
    }

    fn launch_daemon<'a>(&'a self, _instance: &'a str) -> BoxFuture<'a, Result<Child, RuntimeError>> {
        Box::pin(async move {
            tokio::time::sleep(STEP).await;
            let child = tokio::process::Command::new("sh")
                .args(["-c", "sleep 60"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            Ok(child)
        })
    }
}

/// Supervisor over [`SlowRuntime`] whose health checks go to `daemon_addr`.
fn managed(daemon_addr: &str) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        Arc::new(SlowRuntime::default()),
        HealthProbe::new(daemon_addr).with_timeout(Duration::from_millis(100)),
        SupervisorConfig {
            probe_interval: Duration::from_millis(20),
        },
    ))
}

async fn closed_addr() -> String {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestTunnel {
    addr: SocketAddr,
    registry: Arc<ActiveSessionRegistry>,
    cancel: CancellationToken,
}

impl Drop for TestTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_tunnel(daemon_addr: &str) -> TestTunnel {
    start_tunnel_with(DaemonEndpoint::External(daemon_addr.to_string()), Duration::from_secs(5)).await
}

async fn start_tunnel_with(daemon: DaemonEndpoint, ready_timeout: Duration) -> TestTunnel {
    let resources = HashMap::from([
        ("desktop".to_string(), DESKTOP.to_string()),
        ("notes".to_string(), FORBIDDEN_REMOTE_APP.to_string()),
        ("unresolvable".to_string(), UNRESOLVABLE.to_string()),
        ("gatewayed".to_string(), GATEWAYED.to_string()),
    ]);
    let registry = Arc::new(ActiveSessionRegistry::without_shutdown());
    let ctx = TunnelContext {
        resolver: Arc::new(MemoryResolver(resources)),
        probe: Arc::new(TrustingProbe),
        daemon,
        registry: registry.clone(),
        settings: SessionSettings {
            ready_timeout,
            keepalive_interval: Duration::from_secs(60),
            daemon_connect_timeout: Duration::from_secs(2),
        },
    };
    let policy = UpgradePolicy {
        ws_path: "/guacd-tunnel".into(),
        auth: Arc::new(TrustedHeaderAuthenticator::new(http::HeaderName::from_static(
            "x-raweb-user",
        ))),
    };
    let cancel = CancellationToken::new();
    let server = TunnelServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(ctx), policy, cancel.clone());
    let (listener, addr) = server.bind().await.unwrap();
    tokio::spawn(async move { server.serve(listener).await });
    TestTunnel {
        addr,
        registry,
        cancel,
    }
}

impl TestTunnel {
    fn request(&self, query: &str, user: Option<&str>, protocol: bool) -> http::Request<()> {
        let url = format!("ws://{}/guacd-tunnel?{query}", self.addr);
        let mut req = url.into_client_request().unwrap();
        if protocol {
            req.headers_mut()
                .insert(http::header::SEC_WEBSOCKET_PROTOCOL, "guacamole".parse().unwrap());
        }
        if let Some(user) = user {
            req.headers_mut().insert("x-raweb-user", user.parse().unwrap());
        }
        req
    }

    async fn open(&self, path: &str) -> Client {
        let req = self.request(&format!("path={path}&origin=rdp"), Some("alice"), true);
        let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        Client {
            ws,
            reader: InstructionReader::new(),
            queue: VecDeque::new(),
        }
    }

    /// Wait for every connection to leave the registry.
    async fn registry_drains(&self) {
        for _ in 0..100 {
            if self.registry.is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connections left in registry: {:?}", self.registry.snapshot().await);
    }

    async fn upgrade_status(&self, req: http::Request<()>) -> u16 {
        match tokio_tungstenite::connect_async(req).await {
            Ok(_) => 101,
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => resp.status().as_u16(),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

struct Client {
    ws: Browser,
    reader: InstructionReader,
    queue: VecDeque<Instruction>,
}

impl Client {
    /// Next instruction other than `nop`, or `None` once the socket closes.
    async fn next(&mut self) -> Option<Instruction> {
        loop {
            while let Some(instruction) = self.queue.pop_front() {
                if instruction.opcode() != "nop" {
                    return Some(instruction);
                }
            }
            let msg = tokio::time::timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("tunnel went silent");
            match msg {
                Some(Ok(Message::Text(text))) => self.queue.extend(self.reader.push(text.as_bytes()).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    async fn expect(&mut self, opcode: &str) -> Instruction {
        let instruction = self.next().await.unwrap_or_else(|| panic!("closed while waiting for {opcode}"));
        assert_eq!(instruction.opcode(), opcode, "got {instruction}");
        instruction
    }

    async fn send(&mut self, opcode: &str, value: &str) {
        let text = Instruction::new(opcode, [value]).encode();
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    async fn answer_prompts(&mut self) {
        self.answer_credentials().await;
        self.answer_display().await;
    }

    async fn answer_credentials(&mut self) {
        self.expect("raweb-demand-credentials").await;
        // All three in one message, the way the browser batches them.
        self.send_raw("6.domain,4.CORP;8.username,5.alice;8.password,6.secret;")
            .await;
    }

    async fn answer_display(&mut self) {
        self.expect("raweb-demand-display-info").await;
        self.send("displayWidth", "1280").await;
        self.send("displayHeight", "720").await;
        self.send("displayDPI", "96").await;
        self.expect("raweb-demand-timezone").await;
        self.send("timezone", "Europe/Berlin").await;
    }

    /// Read until the error instruction, returning its code.
    async fn error_code(&mut self) -> u32 {
        let error = self.expect("error").await;
        self.expect("disconnect").await;
        error.arg(1).unwrap().parse().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn negotiates_and_relays() {
    let mut guacd = fake_guacd("VERSION_1_5_0").await;
    let tunnel = start_tunnel(&guacd.addr).await;
    let mut client = tunnel.open("desktop").await;

    client.answer_prompts().await;

    let id = client.expect("").await;
    assert_eq!(id.arg(0), Some("$4f1e-conn"));
    let sync = client.expect("sync").await;
    assert_eq!(sync.arg(0), Some("123"));
    assert_eq!(tunnel.registry.len().await, 1);

    client.send_raw("5.mouse,2.10,2.20;").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.ws.close(None).await.unwrap();

    let log = guacd.next_log().await;
    let opcodes: Vec<&str> = log.instructions.iter().map(Instruction::opcode).collect();
    assert_eq!(
        opcodes,
        ["select", "size", "audio", "video", "image", "timezone", "connect"]
    );
    assert_eq!(log.instructions[0].args(), ["rdp"]);
    assert_eq!(log.instructions[1].args(), ["1280", "720", "96"]);
    assert_eq!(log.instructions[5].args(), ["Europe/Berlin"]);
    assert_eq!(
        log.instructions[6].args(),
        ["VERSION_1_5_0", "127.0.0.1", "3389", "alice", "secret", "1280", "any", "", "", "", ""]
    );
    assert_eq!(log.raw_after_ready, b"5.mouse,2.10,2.20;");
    tunnel.registry_drains().await;
}

#[tokio::test]
async fn unsupported_daemon_version_sends_no_connect() {
    let mut guacd = fake_guacd("VERSION_1_1_0").await;
    let tunnel = start_tunnel(&guacd.addr).await;
    let mut client = tunnel.open("desktop").await;

    client.answer_prompts().await;
    assert_eq!(client.error_code().await, code::PROTOCOL_MISMATCH);

    let log = guacd.next_log().await;
    let opcodes: Vec<&str> = log.instructions.iter().map(Instruction::opcode).collect();
    assert_eq!(opcodes, ["select"]);
    assert!(tunnel.registry.is_empty().await);
}

#[tokio::test]
async fn remote_app_file_is_rejected_before_prompting() {
    let tunnel = start_tunnel("127.0.0.1:9").await;
    let mut client = tunnel.open("notes").await;
    assert_eq!(client.error_code().await, code::REMOTE_APP_FILE_FORBIDDEN);
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn unknown_resource_reports_resolver_status() {
    let tunnel = start_tunnel("127.0.0.1:9").await;
    let mut client = tunnel.open("missing").await;
    assert_eq!(client.error_code().await, 404);
}

#[tokio::test]
async fn unexpected_prompt_answer_fails_session() {
    let tunnel = start_tunnel("127.0.0.1:9").await;
    let mut client = tunnel.open("desktop").await;
    client.expect("raweb-demand-credentials").await;
    client.send("displayWidth", "1280").await;
    assert_eq!(client.error_code().await, code::UNEXPECTED_CLIENT_MESSAGE);
}

#[tokio::test]
async fn unreachable_daemon_is_reported() {
    let tunnel = start_tunnel(&closed_addr().await).await;
    let mut client = tunnel.open("desktop").await;
    client.answer_prompts().await;
    assert_eq!(client.error_code().await, code::DAEMON_REFUSED);
}

#[tokio::test]
async fn upgrade_rejections() {
    let tunnel = start_tunnel("127.0.0.1:9").await;

    let no_user = tunnel.request("path=desktop", None, true);
    assert_eq!(tunnel.upgrade_status(no_user).await, 401);

    let no_protocol = tunnel.request("path=desktop", Some("alice"), false);
    assert_eq!(tunnel.upgrade_status(no_protocol).await, 400);

    let no_path = tunnel.request("origin=rdp", Some("alice"), true);
    assert_eq!(tunnel.upgrade_status(no_path).await, 400);

    let bad_origin = tunnel.request("path=desktop&origin=smb", Some("alice"), true);
    assert_eq!(tunnel.upgrade_status(bad_origin).await, 400);

    let mut wrong_path = tunnel.request("path=desktop", Some("alice"), true);
    *wrong_path.uri_mut() = format!("ws://{}/other?path=desktop", tunnel.addr).parse().unwrap();
    assert_eq!(tunnel.upgrade_status(wrong_path).await, 404);
}

#[tokio::test]
async fn browser_leaving_during_handshake_is_not_registered() {
    let guacd = fake_guacd_with("VERSION_1_5_0", Duration::from_millis(400)).await;
    let tunnel = start_tunnel(&guacd.addr).await;
    let mut client = tunnel.open("desktop").await;

    // Answer every prompt up front without reading any of them.
    client
        .send_raw(
            "6.domain,0.;8.username,5.alice;8.password,6.secret;\
             12.displayWidth,4.1280;13.displayHeight,3.720;10.displayDPI,2.96;\
             8.timezone,3.UTC;",
        )
        .await;
    tokio::time::timeout(Duration::from_secs(5), guacd.connected.notified())
        .await
        .unwrap();
    drop(client);

    tokio::time::sleep(Duration::from_millis(600)).await;
    tunnel.registry_drains().await;
}

#[tokio::test]
async fn unresolvable_host_warns_and_continues() {
    let mut guacd = fake_guacd("VERSION_1_5_0").await;
    let tunnel = start_tunnel(&guacd.addr).await;
    let mut client = tunnel.open("unresolvable").await;

    let warning = client.expect("raweb-console-error").await;
    assert_eq!(warning.arg(2), Some(code::HOSTNAME_RESOLUTION.to_string().as_str()));
    client.answer_prompts().await;
    assert_eq!(client.expect("").await.arg(0), Some("$4f1e-conn"));
    client.ws.close(None).await.unwrap();

    let log = guacd.next_log().await;
    let connect = log.instructions.last().unwrap();
    assert_eq!(connect.opcode(), "connect");
    // guacd gets the name to resolve itself.
    assert_eq!(connect.arg(1), Some("rdp-host.invalid"));
}

#[tokio::test]
async fn gateway_credentials_are_collected_and_forwarded() {
    let mut guacd = fake_guacd("VERSION_1_5_0").await;
    let tunnel = start_tunnel(&guacd.addr).await;
    let mut client = tunnel.open("gatewayed").await;

    client.answer_credentials().await;
    client.expect("raweb-demand-gateway-credentials").await;
    client
        .send_raw("14.gateway-domain,2.GW;16.gateway-username,6.gwuser;16.gateway-password,6.gwpass;")
        .await;
    client.answer_display().await;
    client.expect("").await;
    client.ws.close(None).await.unwrap();

    let log = guacd.next_log().await;
    assert_eq!(
        log.instructions.last().unwrap().args(),
        [
            "VERSION_1_5_0",
            "127.0.0.1",
            "3389",
            "alice",
            "secret",
            "1280",
            "any",
            "gw.example",
            "8443",
            "gwuser",
            "gwpass"
        ]
    );
}

#[tokio::test]
async fn empty_username_is_missing_credentials() {
    let tunnel = start_tunnel("127.0.0.1:9").await;
    let mut client = tunnel.open("desktop").await;

    client.expect("raweb-demand-credentials").await;
    client
        .send_raw("6.domain,4.CORP;8.username,0.;8.password,6.secret;")
        .await;
    assert_eq!(client.error_code().await, code::MISSING_CREDENTIALS);
}

#[tokio::test]
async fn managed_daemon_reports_progress_then_connects() {
    let mut guacd = fake_guacd("VERSION_1_5_0").await;
    let supervisor = managed(&guacd.addr);
    let tunnel = start_tunnel_with(DaemonEndpoint::Managed(Arc::clone(&supervisor)), Duration::from_secs(5)).await;
    let mut client = tunnel.open("desktop").await;

    client.answer_prompts().await;
    client.expect("raweb-msg-installing-service").await;
    client.expect("raweb-msg-starting-service").await;
    client.expect("raweb-msg-service-started").await;
    assert_eq!(client.expect("").await.arg(0), Some("$4f1e-conn"));
    client.ws.close(None).await.unwrap();

    assert_eq!(guacd.next_log().await.instructions[0].opcode(), "select");
    tunnel.registry_drains().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn managed_daemon_start_timeout_is_reported() {
    let supervisor = managed(&closed_addr().await);
    let tunnel =
        start_tunnel_with(DaemonEndpoint::Managed(Arc::clone(&supervisor)), Duration::from_millis(600)).await;
    let mut client = tunnel.open("desktop").await;

    client.answer_prompts().await;
    client.expect("raweb-msg-installing-service").await;
    client.expect("raweb-msg-starting-service").await;
    assert_eq!(client.error_code().await, code::START_TIMEOUT);
    assert!(tunnel.registry.is_empty().await);
}
