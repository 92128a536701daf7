//! End-to-end pool behavior against an in-process fake audio node and a
//! fake gateway that loops voice-server assignments straight back into
//! the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use aqueduct_core::{
    Gateway, JoinError, JoinOptions, NodeConfig, NodePool, PlayOptions, PoolConfig, SessionEvent,
    VoiceServerAssignment,
};

const PASSWORD: &str = "youshallnotpass";
const ASSIGNED_ENDPOINT: &str = "us-east42.example.com";

/// A websocket server standing in for a remote audio node: records every
/// payload it receives and can push stats or drop its connections.
struct FakeNode {
    port: u16,
    received: Arc<Mutex<Vec<(Instant, Value)>>>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
    auth_header: Arc<Mutex<Option<String>>>,
}

impl FakeNode {
    async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let received: Arc<Mutex<Vec<(Instant, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let auth_header: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        {
            let received = Arc::clone(&received);
            let clients = Arc::clone(&clients);
            let auth_header = Arc::clone(&auth_header);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let auth = Arc::clone(&auth_header);
                    let socket = match tokio_tungstenite::accept_hdr_async(
                        stream,
                        |request: &Request, response: Response| {
                            *auth.lock().expect("auth lock") = request
                                .headers()
                                .get("Authorization")
                                .and_then(|value| value.to_str().ok())
                                .map(String::from);
                            Ok(response)
                        },
                    )
                    .await
                    {
                        Ok(socket) => socket,
                        Err(_) => continue,
                    };

                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                    clients.lock().expect("clients lock").push(tx);
                    let received = Arc::clone(&received);
                    tokio::spawn(async move {
                        let (mut sink, mut stream) = socket.split();
                        loop {
                            tokio::select! {
                                outbound = rx.recv() => match outbound {
                                    Some(message) => {
                                        let closing = matches!(message, Message::Close(_));
                                        if sink.send(message).await.is_err() || closing {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                                inbound = stream.next() => match inbound {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                                            received
                                                .lock()
                                                .expect("received lock")
                                                .push((Instant::now(), value));
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                },
                            }
                        }
                    });
                }
            });
        }

        Ok(Self {
            port,
            received,
            clients,
            auth_header,
        })
    }

    fn config(&self) -> NodeConfig {
        NodeConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            password: PASSWORD.to_string(),
            region: None,
            secure: false,
        }
    }

    fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn send_json(&self, value: Value) {
        let text = value.to_string();
        for client in self.clients.lock().expect("clients lock").iter() {
            let _ = client.send(Message::text(text.clone()));
        }
    }

    /// Close every live connection from the server side.
    fn kill_connections(&self) {
        for client in self.clients.lock().expect("clients lock").drain(..) {
            let _ = client.send(Message::Close(None));
        }
    }

    fn ops(&self) -> Vec<String> {
        self.received
            .lock()
            .expect("received lock")
            .iter()
            .filter_map(|(_, value)| value.get("op").and_then(Value::as_str).map(String::from))
            .collect()
    }

    fn payloads(&self) -> Vec<Value> {
        self.received
            .lock()
            .expect("received lock")
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Receipt times of every payload carrying the given `op`.
    fn op_times(&self, op: &str) -> Vec<Instant> {
        self.received
            .lock()
            .expect("received lock")
            .iter()
            .filter(|(_, value)| value["op"] == op)
            .map(|(at, _)| *at)
            .collect()
    }
}

/// Shard layer stand-in. When responding, every channel join is answered
/// with a voice-server assignment fed back into the pool.
struct FakeGateway {
    pool: OnceLock<NodePool>,
    responding: AtomicBool,
    fail_sends: AtomicBool,
    leaves: Mutex<Vec<String>>,
}

impl FakeGateway {
    fn new(responding: bool) -> Self {
        Self {
            pool: OnceLock::new(),
            responding: AtomicBool::new(responding),
            fail_sends: AtomicBool::new(false),
            leaves: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    fn shard_id(&self, _guild_id: &str) -> u64 {
        0
    }

    async fn voice_state_update(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        _self_mute: bool,
        _self_deaf: bool,
    ) -> anyhow::Result<()> {
        if channel_id.is_none() {
            self.leaves
                .lock()
                .expect("leaves lock")
                .push(guild_id.to_string());
            return Ok(());
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("shard send failed");
        }
        if !self.responding.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(pool) = self.pool.get().cloned() else {
            return Ok(());
        };
        let guild_id = guild_id.to_string();
        tokio::spawn(async move {
            pool.voice_server_update(VoiceServerAssignment {
                guild_id,
                session_id: "s-1".to_string(),
                token: "voice-token".to_string(),
                endpoint: Some(ASSIGNED_ENDPOINT.to_string()),
            })
            .await;
        });
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("condition not reached within 5s")
}

async fn build_pool(
    config: PoolConfig,
    nodes: &[&FakeNode],
    responding: bool,
) -> anyhow::Result<(NodePool, Arc<FakeGateway>)> {
    let gateway = Arc::new(FakeGateway::new(responding));
    let pool = NodePool::new(
        config,
        nodes.iter().map(|node| node.config()).collect(),
        gateway.clone(),
    );
    let _ = gateway.pool.set(pool.clone());
    for node in nodes {
        let address = node.address();
        wait_until(|| pool.node(&address).is_some_and(|node| node.is_connected())).await?;
    }
    Ok((pool, gateway))
}

#[tokio::test]
async fn join_resolves_against_assignment() -> anyhow::Result<()> {
    let node = FakeNode::start().await?;
    let (pool, _gateway) = build_pool(PoolConfig::new("9000"), &[&node], true).await?;

    let session = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;

    assert!(session.is_ready());
    assert_eq!(session.guild_id(), "g1");
    assert_eq!(session.channel_id(), "c1");
    assert!(!pool.has_pending_join("g1"));

    wait_until(|| node.ops().contains(&"voiceUpdate".to_string())).await?;
    let payloads = node.payloads();
    let handshake = &payloads[0];
    assert_eq!(handshake["op"], "voiceUpdate");
    assert_eq!(handshake["sessionId"], "s-1");
    assert_eq!(handshake["event"]["token"], "voice-token");
    assert_eq!(handshake["event"]["endpoint"], ASSIGNED_ENDPOINT);
    assert_eq!(
        node.auth_header.lock().expect("auth lock").as_deref(),
        Some(PASSWORD)
    );

    // A ready session on the same channel is reused without a new handshake.
    let reused = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;
    assert_eq!(reused.channel_id(), "c1");
    assert!(!pool.has_pending_join("g1"));
    assert_eq!(
        node.ops()
            .iter()
            .filter(|op| op.as_str() == "voiceUpdate")
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn join_without_assignment_times_out() -> anyhow::Result<()> {
    let node = FakeNode::start().await?;
    let mut config = PoolConfig::new("9000");
    config.join_timeout_ms = 200;
    let (pool, _gateway) = build_pool(config, &[&node], false).await?;

    let result = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await?;
    assert_eq!(result.map(|_| ()), Err(JoinError::Timeout));
    assert!(!pool.has_pending_join("g1"));
    Ok(())
}

#[tokio::test]
async fn gateway_failure_rejects_the_join() -> anyhow::Result<()> {
    let node = FakeNode::start().await?;
    let (pool, gateway) = build_pool(PoolConfig::new("9000"), &[&node], true).await?;
    gateway.fail_sends.store(true, Ordering::SeqCst);

    let result = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await?;
    match result {
        Err(JoinError::Gateway(message)) => {
            assert!(message.contains("shard send failed"), "message was {message:?}");
        }
        Err(other) => panic!("expected a gateway error, got {other:?}"),
        Ok(_) => panic!("join should not resolve"),
    }
    assert!(!pool.has_pending_join("g1"));

    // The failure is scoped to that join; the next one succeeds.
    gateway.fail_sends.store(false, Ordering::SeqCst);
    let session = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;
    assert!(session.is_ready());
    Ok(())
}

#[tokio::test]
async fn join_with_no_nodes_fails_fast() -> anyhow::Result<()> {
    let gateway = Arc::new(FakeGateway::new(true));
    let pool = NodePool::new(PoolConfig::new("9000"), Vec::new(), gateway.clone());
    let _ = gateway.pool.set(pool.clone());

    let result = pool.join("g1", "c1", JoinOptions::default()).await;
    assert_eq!(result.map(|_| ()), Err(JoinError::NoAvailableNodes));
    Ok(())
}

#[tokio::test]
async fn commands_arrive_in_issue_order() -> anyhow::Result<()> {
    let node = FakeNode::start().await?;
    let (pool, _gateway) = build_pool(PoolConfig::new("9000"), &[&node], true).await?;
    let session = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;

    session.play("QAAAtrack", PlayOptions::default());
    session.set_pause(true);
    session.seek(5_000);
    session.set_volume(80);
    session.stop();

    wait_until(|| node.ops().len() >= 6).await?;
    let ops = node.ops();
    assert_eq!(ops[0], "voiceUpdate");
    assert_eq!(&ops[1..6], ["play", "pause", "seek", "volume", "stop"]);

    // Optional play fields stay off the wire when unset.
    let play = &node.payloads()[1];
    assert_eq!(play["track"], "QAAAtrack");
    assert!(play.get("startTime").is_none());
    assert!(play.get("noReplace").is_none());
    Ok(())
}

#[tokio::test]
async fn newer_join_supersedes_pending() -> anyhow::Result<()> {
    let node = FakeNode::start().await?;
    let (pool, gateway) = build_pool(PoolConfig::new("9000"), &[&node], false).await?;

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { pool.join("g1", "c1", JoinOptions::default()).await }
    });
    wait_until(|| pool.has_pending_join("g1")).await?;

    gateway.responding.store(true, Ordering::SeqCst);
    let second = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c2", JoinOptions::default()),
    )
    .await??;
    assert_eq!(second.channel_id(), "c2");

    match timeout(Duration::from_secs(5), first).await?? {
        Err(JoinError::Disconnected(Some(reason))) => {
            assert!(reason.contains("superseded"), "reason was {reason:?}");
        }
        Err(other) => panic!("first join should be superseded, got {other:?}"),
        Ok(_) => panic!("first join should not resolve"),
    }
    Ok(())
}

#[tokio::test]
async fn load_selection_prefers_lowest_penalty() -> anyhow::Result<()> {
    let busy = FakeNode::start().await?;
    let idle = FakeNode::start().await?;
    let (pool, _gateway) = build_pool(PoolConfig::new("9000"), &[&busy, &idle], true).await?;

    let stats = |load: f64| {
        json!({
            "op": "stats",
            "players": 0,
            "playingPlayers": 0,
            "uptime": 60_000,
            "cpu": { "cores": 1, "systemLoad": load, "lavalinkLoad": 0.0 },
        })
    };
    busy.send_json(stats(0.9));
    idle.send_json(stats(0.05));
    {
        let busy_address = busy.address();
        wait_until(|| {
            pool.node(&busy_address)
                .is_some_and(|node| node.penalty() > 50.0)
        })
        .await?;
    }

    let session = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;
    assert_eq!(session.node().address(), idle.address());
    Ok(())
}

#[tokio::test]
async fn draining_nodes_are_excluded() -> anyhow::Result<()> {
    let draining = FakeNode::start().await?;
    let healthy = FakeNode::start().await?;
    let (pool, _gateway) = build_pool(PoolConfig::new("9000"), &[&draining, &healthy], true).await?;
    pool.node(&draining.address())
        .expect("node registered")
        .set_draining(true);

    let session = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;
    assert_eq!(session.node().address(), healthy.address());

    // Pinning to a draining node is refused rather than silently rerouted.
    let pinned = JoinOptions {
        node: Some(draining.address()),
        ..JoinOptions::default()
    };
    let result = pool.join("g2", "c2", pinned).await;
    assert_eq!(result.map(|_| ()), Err(JoinError::NoAvailableNodes));
    Ok(())
}

#[tokio::test]
async fn leave_tears_down_session() -> anyhow::Result<()> {
    let node = FakeNode::start().await?;
    let (pool, gateway) = build_pool(PoolConfig::new("9000"), &[&node], true).await?;
    let session = timeout(
        Duration::from_secs(5),
        pool.join("g1", "c1", JoinOptions::default()),
    )
    .await??;
    let mut events = session.subscribe();

    pool.leave("g1").await;

    assert!(pool.session("g1").is_none());
    assert_eq!(
        gateway.leaves.lock().expect("leaves lock").as_slice(),
        ["g1"]
    );
    wait_until(|| {
        let ops = node.ops();
        ops.contains(&"destroy".to_string()) && ops.contains(&"stop".to_string())
    })
    .await?;

    let event = timeout(Duration::from_secs(5), events.recv()).await??;
    assert!(matches!(event, SessionEvent::Disconnect { .. }));
    Ok(())
}

#[tokio::test]
async fn dead_node_sessions_migrate_rate_limited() -> anyhow::Result<()> {
    let doomed = FakeNode::start().await?;
    let survivor = FakeNode::start().await?;
    let (pool, _gateway) = build_pool(PoolConfig::new("9000"), &[&doomed, &survivor], true).await?;

    let guilds = ["g1", "g2", "g3"];
    let mut sessions = Vec::new();
    for guild in guilds {
        let pinned = JoinOptions {
            node: Some(doomed.address()),
            ..JoinOptions::default()
        };
        let session = timeout(Duration::from_secs(5), pool.join(guild, "c1", pinned)).await??;
        assert_eq!(session.node().address(), doomed.address());
        session.play(format!("QAAAtrack-{guild}"), PlayOptions::default());
        sessions.push(session);
    }
    wait_until(|| doomed.op_times("play").len() == guilds.len()).await?;

    let mut events = sessions[0].subscribe();
    doomed.kill_connections();

    // The first session announces its re-home once migration settles it.
    loop {
        let event = timeout(Duration::from_secs(5), events.recv()).await??;
        if matches!(event, SessionEvent::Reconnect) {
            break;
        }
    }
    wait_until(|| survivor.op_times("play").len() == guilds.len()).await?;

    for (guild, session) in guilds.iter().zip(&sessions) {
        assert_eq!(session.node().address(), survivor.address());
        assert_eq!(
            session.track().as_deref(),
            Some(format!("QAAAtrack-{guild}").as_str())
        );
        assert!(pool.session(guild).is_some());
    }

    // Resumed just past the pre-outage position.
    for play in survivor
        .payloads()
        .into_iter()
        .filter(|payload| payload["op"] == "play")
    {
        let start_time = play["startTime"].as_u64().expect("startTime set");
        assert!(start_time >= 2_000, "startTime was {start_time}");
    }

    // One re-home per rate window after the immediate first.
    let plays = survivor.op_times("play");
    for pair in plays.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(200), "gap was {gap:?}");
    }
    Ok(())
}
