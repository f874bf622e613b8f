use crate::state::{Action, ClientState, Event, StateMachine};
use crate::transport::{Connection, Connector, Frame, WsConnector};
use coinpulse_core::*;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Topic carried by client-side connection errors delivered to `error`
/// subscribers.
pub const CONNECTION_TOPIC: &str = "connection";

type Callback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Returned by [`SyncClient::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct ClientInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ClientState>,
    /// Token of the running driver task, `None` when idle or disconnected.
    driver: Mutex<Option<CancellationToken>>,
    callbacks: Mutex<HashMap<MessageType, Vec<(SubscriptionHandle, Callback)>>>,
    /// Topics to (re-)issue on every open socket.
    topics: Mutex<BTreeSet<String>>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    last_update: Mutex<Option<Instant>>,
    next_handle: AtomicU64,
}

/// Persistent client connection to the broadcast hub.
///
/// Messages are dispatched to local callbacks by message type. On an
/// unexpected close the client reconnects after a fixed delay, up to
/// `max_retries` consecutive attempts, and re-issues its topic
/// subscriptions once the socket is back. When attempts run out the client
/// enters [`ClientState::Failed`] and every `error` subscriber is invoked
/// once with a `max_retries_exceeded` payload.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                state,
                driver: Mutex::new(None),
                callbacks: Mutex::new(HashMap::new()),
                topics: Mutex::new(BTreeSet::new()),
                outgoing: Mutex::new(None),
                last_update: Mutex::new(None),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Client over a real WebSocket.
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WsConnector::new()))
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Open the connection, or join an attempt already in progress.
    ///
    /// Resolves once the socket is open. Failed dials go through the same
    /// retry loop as later losses, so this only errors when retries are
    /// exhausted or [`SyncClient::disconnect`] is called meanwhile.
    pub async fn connect(&self) -> Result<(), SyncError> {
        let mut rx = self.inner.state.subscribe();
        {
            let mut driver = self.inner.driver.lock();
            let state = *self.inner.state.borrow();
            if state == ClientState::Connected {
                return Ok(());
            }
            if driver.is_none() || state == ClientState::Failed {
                let token = CancellationToken::new();
                *driver = Some(token.clone());
                self.inner.state.send_replace(ClientState::Connecting);
                info!(url = %self.inner.config.url, "Connecting");
                tokio::spawn(drive(self.inner.clone(), token));
            }
        }

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ClientState::Connected => return Ok(()),
                ClientState::Failed => {
                    return Err(SyncError::MaxRetriesExceeded(self.inner.config.max_retries))
                }
                ClientState::Disconnected if self.inner.driver.lock().is_none() => {
                    return Err(SyncError::ConnectionLost("disconnected".to_string()))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(SyncError::ConnectionLost("client dropped".to_string()));
            }
        }
    }

    /// Close the socket, cancel any pending reconnect and stay down until the
    /// next [`SyncClient::connect`].
    pub fn disconnect(&self) {
        let mut driver = self.inner.driver.lock();
        if let Some(token) = driver.take() {
            token.cancel();
        }
        self.inner.outgoing.lock().take();
        self.inner.state.send_replace(ClientState::Disconnected);
        info!("Disconnected");
    }

    // -----------------------------------------------------------------------
    // Local callback registry
    // -----------------------------------------------------------------------

    pub fn subscribe<F>(&self, kind: MessageType, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        self.inner
            .callbacks
            .lock()
            .entry(kind)
            .or_default()
            .push((handle, Arc::new(callback)));
        handle
    }

    /// Returns `false` if the handle was not registered for `kind`.
    pub fn unsubscribe(&self, kind: MessageType, handle: SubscriptionHandle) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let Some(list) = callbacks.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != handle);
        before != list.len()
    }

    // -----------------------------------------------------------------------
    // Remote topic subscriptions
    // -----------------------------------------------------------------------

    /// Ask the hub for a topic. Remembered across reconnects.
    pub fn subscribe_topic(&self, topic: impl Into<String>) {
        let topic = topic.into();
        if !self.inner.topics.lock().insert(topic.clone()) {
            return;
        }
        self.inner.send_control(&ControlMessage::Subscribe { topic });
    }

    pub fn unsubscribe_topic(&self, topic: &str) {
        if !self.inner.topics.lock().remove(topic) {
            return;
        }
        self.inner.send_control(&ControlMessage::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.lock().iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Staleness
    // -----------------------------------------------------------------------

    /// When the last `initialData` or `update` arrived.
    pub fn last_update(&self) -> Option<Instant> {
        *self.inner.last_update.lock()
    }

    pub fn is_stale(&self) -> bool {
        match self.last_update() {
            Some(at) => at.elapsed() > self.inner.config.stale_after(),
            None => true,
        }
    }
}

impl ClientInner {
    /// Publish a state unless the driver owning `token` was cancelled.
    fn publish(&self, token: &CancellationToken, state: ClientState) -> bool {
        let _driver = self.driver.lock();
        if token.is_cancelled() {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn send_control(&self, msg: &ControlMessage) {
        let Some(tx) = self.outgoing.lock().clone() else {
            debug!(topic = msg.topic(), "Not connected, control message deferred");
            return;
        };
        Self::send_on(&tx, msg);
    }

    fn send_on(tx: &mpsc::Sender<String>, msg: &ControlMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                if tx.try_send(json).is_err() {
                    warn!(topic = msg.topic(), "Failed to queue control message");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode control message"),
        }
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => self.dispatch(&msg),
            Err(e) => warn!(error = %e, "Ignoring malformed server message"),
        }
    }

    fn dispatch(&self, msg: &ServerMessage) {
        if msg.kind != MessageType::Error {
            *self.last_update.lock() = Some(Instant::now());
        }
        let callbacks: Vec<Callback> = self
            .callbacks
            .lock()
            .get(&msg.kind)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            // A failing subscriber must not take the connection down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| callback(msg))).is_err() {
                warn!(kind = %msg.kind, topic = %msg.topic, "Subscriber callback panicked");
            }
        }
    }

    /// Re-issue subscriptions, then read until the socket closes, the server
    /// goes silent for longer than the heartbeat timeout, or the driver is
    /// cancelled.
    async fn run_connection(&self, conn: Connection, token: &CancellationToken) {
        let Connection {
            outgoing,
            mut incoming,
        } = conn;

        let topics: Vec<String> = {
            let _driver = self.driver.lock();
            if token.is_cancelled() {
                return;
            }
            let topics = self.topics.lock();
            *self.outgoing.lock() = Some(outgoing.clone());
            topics.iter().cloned().collect()
        };
        for topic in topics {
            Self::send_on(&outgoing, &ControlMessage::Subscribe { topic });
        }
        drop(outgoing);

        let timeout = self.config.heartbeat_timeout();
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(timeout_secs = timeout.as_secs(), "Server went silent");
                    break;
                }
                frame = incoming.recv() => match frame {
                    Some(frame) => {
                        deadline = Instant::now() + timeout;
                        if let Frame::Text(text) = frame {
                            self.handle_frame(&text);
                        }
                    }
                    None => break,
                },
            }
        }

        let _driver = self.driver.lock();
        if !token.is_cancelled() {
            self.outgoing.lock().take();
        }
    }
}

/// Drives the state machine: dials, reads, waits and gives up.
async fn drive(inner: Arc<ClientInner>, token: CancellationToken) {
    let max_retries = inner.config.max_retries;
    let delay = inner.config.reconnect_delay();
    let mut machine = StateMachine::new(max_retries);
    let mut socket: Option<Connection> = None;
    let mut action = machine.on(Event::Connect);

    loop {
        action = match action {
            Action::Dial => {
                let dialled = tokio::select! {
                    _ = token.cancelled() => break,
                    result = inner.connector.connect(&inner.config.url) => result,
                };
                match dialled {
                    Ok(conn) => {
                        socket = Some(conn);
                        machine.on(Event::Opened)
                    }
                    Err(e) => {
                        warn!(error = %e, attempt = machine.retries(), "Connection attempt failed");
                        machine.on(Event::DialFailed)
                    }
                }
            }
            Action::Resubscribe => {
                let Some(conn) = socket.take() else { break };
                if !inner.publish(&token, machine.state()) {
                    break;
                }
                info!(url = %inner.config.url, "Connected");
                inner.run_connection(conn, &token).await;
                if token.is_cancelled() {
                    break;
                }
                warn!("Connection lost");
                machine.on(Event::Lost)
            }
            Action::Wait { attempt } => {
                if !inner.publish(&token, machine.state()) {
                    break;
                }
                info!(
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let next = machine.on(Event::RetryElapsed);
                if !inner.publish(&token, machine.state()) {
                    break;
                }
                next
            }
            Action::GiveUp { attempts } => {
                if inner.publish(&token, machine.state()) {
                    warn!(attempts, "Reconnect attempts exhausted");
                    let err = SyncError::MaxRetriesExceeded(attempts);
                    inner.dispatch(&ServerMessage::error(CONNECTION_TOPIC, &err));
                }
                break;
            }
            Action::Close | Action::None => break,
        };
    }
    debug!("Client driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Server end of a fake socket.
    struct FakeServer {
        from_client: mpsc::Receiver<String>,
        to_client: mpsc::Sender<Frame>,
    }

    impl FakeServer {
        async fn next_control(&mut self) -> ControlMessage {
            let text = self.from_client.recv().await.expect("client still connected");
            serde_json::from_str(&text).unwrap()
        }

        async fn push(&self, msg: ServerMessage) {
            self.to_client
                .send(Frame::Text(serde_json::to_string(&msg).unwrap()))
                .await
                .unwrap();
        }

        async fn ping(&self) {
            self.to_client.send(Frame::Ping).await.unwrap();
        }
    }

    struct FakeConnector {
        dials: AtomicUsize,
        accepting: AtomicBool,
        accepted: mpsc::UnboundedSender<FakeServer>,
    }

    impl FakeConnector {
        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        fn set_accepting(&self, accepting: bool) {
            self.accepting.store(accepting, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<Connection, SyncError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(SyncError::ConnectionLost(format!("{} refused", url)));
            }
            let (out_tx, out_rx) = mpsc::channel(16);
            let (in_tx, in_rx) = mpsc::channel(16);
            let _ = self.accepted.send(FakeServer {
                from_client: out_rx,
                to_client: in_tx,
            });
            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }

    fn fixture(max_retries: u32) -> (SyncClient, Arc<FakeConnector>, mpsc::UnboundedReceiver<FakeServer>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            dials: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            accepted,
        });
        let config = ClientConfig {
            url: "ws://fake/ws".to_string(),
            max_retries,
            reconnect_delay_ms: 3000,
            stale_after_secs: 30,
            heartbeat_timeout_secs: 60,
        };
        (SyncClient::new(config, connector.clone()), connector, servers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_dial() {
        let (client, connector, _servers) = fixture(5);
        let (a, b) = tokio::join!(client.connect(), client.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.dials(), 1);
        assert_eq!(client.state(), ClientState::Connected);

        client.connect().await.unwrap();
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries_and_reports_once() {
        let (client, connector, mut servers) = fixture(5);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        client.subscribe(MessageType::Error, move |msg| {
            assert_eq!(msg.topic, CONNECTION_TOPIC);
            assert_eq!(msg.data["error"], "max_retries_exceeded");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        client.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        connector.set_accepting(false);
        let started = Instant::now();
        drop(server);

        client
            .watch_state()
            .wait_for(|s| *s == ClientState::Failed)
            .await
            .unwrap();
        assert_eq!(connector.dials(), 1 + 5);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.dials(), 6);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_retries_then_fails() {
        let (client, connector, _servers) = fixture(2);
        connector.set_accepting(false);
        let err = client.connect().await.unwrap_err();
        assert_eq!(err, SyncError::MaxRetriesExceeded(2));
        assert_eq!(connector.dials(), 3);
        assert_eq!(client.state(), ClientState::Failed);

        // Failed is left only by an explicit connect.
        connector.set_accepting(true);
        client.connect().await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_reconnect() {
        let (client, connector, mut servers) = fixture(5);
        client.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        client.subscribe_topic("solana-price");
        assert_eq!(
            server.next_control().await,
            ControlMessage::Subscribe {
                topic: "solana-price".to_string()
            }
        );

        drop(server);
        let mut server = servers.recv().await.unwrap();
        assert_eq!(
            server.next_control().await,
            ControlMessage::Subscribe {
                topic: "solana-price".to_string()
            }
        );
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(connector.dials(), 2);

        client.unsubscribe_topic("solana-price");
        assert_eq!(
            server.next_control().await,
            ControlMessage::Unsubscribe {
                topic: "solana-price".to_string()
            }
        );
        assert!(client.topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_suppresses_reconnect() {
        let (client, connector, mut servers) = fixture(5);
        client.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        client.disconnect();
        assert!(server.from_client.recv().await.is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.dials(), 1);
        assert_eq!(client.state(), ClientState::Disconnected);

        client.connect().await.unwrap();
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (client, connector, mut servers) = fixture(5);
        client.connect().await.unwrap();
        drop(servers.recv().await.unwrap());

        client
            .watch_state()
            .wait_for(|s| *s == ClientState::Disconnected)
            .await
            .unwrap();
        client.disconnect();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.dials(), 1);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_by_message_type() {
        let (client, _connector, mut servers) = fixture(5);
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, ServerMessage)>();

        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let tx = tx.clone();
            handles.push(client.subscribe(MessageType::Update, move |msg| {
                let _ = tx.send((name, msg.clone()));
            }));
        }
        let init_tx = tx.clone();
        client.subscribe(MessageType::InitialData, move |msg| {
            let _ = init_tx.send(("init", msg.clone()));
        });

        client.connect().await.unwrap();
        let server = servers.recv().await.unwrap();

        server.push(ServerMessage::update("solana-price", json!({"amount": "140"}))).await;
        let (first, msg) = rx.recv().await.unwrap();
        let (second, _) = rx.recv().await.unwrap();
        assert_eq!((first, second), ("a", "b"));
        assert_eq!(msg.data["amount"], "140");

        assert!(client.unsubscribe(MessageType::Update, handles[0]));
        assert!(!client.unsubscribe(MessageType::Update, handles[0]));

        server.push(ServerMessage::update("solana-price", json!({"amount": "141"}))).await;
        server.push(ServerMessage::initial_data("bitcoin-price", json!({"amount": "60000"}))).await;
        assert_eq!(rx.recv().await.unwrap().0, "b");
        let (name, msg) = rx.recv().await.unwrap();
        assert_eq!(name, "init");
        assert_eq!(msg.topic, "bitcoin-price");
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_tracks_last_update() {
        let (client, _connector, mut servers) = fixture(5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe(MessageType::Update, move |_| {
            let _ = tx.send(());
        });
        assert!(client.is_stale());
        assert!(client.last_update().is_none());

        client.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        server.push(ServerMessage::update("solana-price", json!({}))).await;
        rx.recv().await.unwrap();
        assert!(!client.is_stale());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(client.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_does_not_stop_dispatch() {
        let (client, connector, mut servers) = fixture(5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe(MessageType::InitialData, |_| panic!("subscriber bug"));
        client.subscribe(MessageType::Update, move |msg| {
            let _ = tx.send(msg.clone());
        });

        client.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        server.push(ServerMessage::initial_data("solana-price", json!({"amount": "140"}))).await;
        server.push(ServerMessage::update("solana-price", json!({"amount": "141"}))).await;

        let update = rx.recv().await.unwrap();
        assert_eq!(update.data["amount"], "141");
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_is_treated_as_lost() {
        let (client, connector, mut servers) = fixture(5);
        client.connect().await.unwrap();
        let mut silent = servers.recv().await.unwrap();
        let started = Instant::now();

        // The stale socket is released and a fresh one dialled.
        assert!(silent.from_client.recv().await.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        let _fresh = servers.recv().await.unwrap();
        assert_eq!(connector.dials(), 2);
        client
            .watch_state()
            .wait_for(|s| *s == ClientState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_pings_keep_connection_alive() {
        let (client, connector, mut servers) = fixture(5);
        client.connect().await.unwrap();
        let server = servers.recv().await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            server.ping().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_driver_never_installs_its_socket() {
        let (client, connector, mut servers) = fixture(5);
        let conn = connector.connect("ws://fake/ws").await.unwrap();
        let mut server = servers.recv().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        client.inner.run_connection(conn, &token).await;

        assert!(client.inner.outgoing.lock().is_none());
        assert!(server.from_client.recv().await.is_none());
    }
}
