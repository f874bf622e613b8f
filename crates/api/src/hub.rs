use coinpulse_core::*;
use coinpulse_data::UpstreamClient;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Transport-level ping; the socket answers with a pong.
    Ping,
    /// The hub dropped the connection; the writer should close the socket.
    Close,
}

struct Connection {
    tx: mpsc::Sender<Outbound>,
    /// Cleared on every ping, set again by the pong.
    alive: bool,
    topics: HashSet<String>,
    heartbeat: CancellationToken,
}

struct Topic {
    config: TopicConfig,
    subscribers: HashSet<ConnectionId>,
    /// Subscribers that have not received any value yet. They get the next
    /// successful push as `initialData` instead of `update`.
    awaiting_initial: HashSet<ConnectionId>,
    /// Set once the first poll tick has completed.
    primed: bool,
    poll: CancellationToken,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    topics: HashMap<String, Topic>,
}

struct HubInner {
    state: Mutex<HubState>,
    upstream: Arc<UpstreamClient>,
    config: Arc<CoinpulseConfig>,
    shutdown: CancellationToken,
}

/// Multiplexes upstream polling onto many viewer connections.
///
/// A topic is polled only while it has at least one subscriber, and each
/// poll tick performs a single fetch that is fanned out to every subscriber.
/// Every poll loop and heartbeat runs as its own task owning a cancellation
/// token, so unsubscribing, disconnecting or closing the hub tears timers
/// down completely. The state lock is never held across an await point.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(upstream: Arc<UpstreamClient>, config: Arc<CoinpulseConfig>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                upstream,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a new connection and start its heartbeat. The returned
    /// receiver yields everything destined for that connection's socket.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.inner.config.hub.outbound_buffer);
        let heartbeat = self.inner.shutdown.child_token();

        self.inner.state.lock().connections.insert(
            id,
            Connection {
                tx,
                alive: true,
                topics: HashSet::new(),
                heartbeat: heartbeat.clone(),
            },
        );
        info!(connection = %id, "Connection registered");

        tokio::spawn(self.clone().run_heartbeat(id, heartbeat));
        (id, rx)
    }

    /// Record a pong from the connection.
    pub fn heartbeat_ack(&self, id: ConnectionId) {
        if let Some(conn) = self.inner.state.lock().connections.get_mut(&id) {
            conn.alive = true;
        }
    }

    /// Forget a connection and drop it from every topic it watched.
    pub fn disconnect(&self, id: ConnectionId) {
        let mut state = self.inner.state.lock();
        let Some(conn) = state.connections.remove(&id) else {
            return;
        };
        conn.heartbeat.cancel();
        for topic in &conn.topics {
            Self::remove_subscriber(&mut state, topic, id);
        }
        info!(connection = %id, topics = conn.topics.len(), "Connection removed");
    }

    async fn run_heartbeat(self, id: ConnectionId, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.hub.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first ping goes out one
        // interval after connect.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let dead = {
                let mut state = self.inner.state.lock();
                let Some(conn) = state.connections.get_mut(&id) else {
                    return;
                };
                if conn.alive {
                    // Only a ping that was actually queued can go unanswered.
                    match conn.tx.try_send(Outbound::Ping) {
                        Ok(()) => {
                            conn.alive = false;
                            false
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(connection = %id, "Outbound queue full, ping skipped");
                            false
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => true,
                    }
                } else {
                    let _ = conn.tx.try_send(Outbound::Close);
                    true
                }
            };

            if dead {
                warn!(connection = %id, "Heartbeat missed, closing connection");
                self.disconnect(id);
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe a connection to a configured topic.
    ///
    /// The first subscriber activates the topic and its poll loop, which
    /// delivers `initialData` right away. Later subscribers get the cached
    /// value immediately when one exists. Unknown topics are answered with
    /// an `error` push.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Result<(), SyncError> {
        let Some(config) = self.inner.config.topic(topic).cloned() else {
            let err = SyncError::UnknownTopic(topic.to_string());
            self.send_to(id, ServerMessage::error(topic, &err));
            return Err(err);
        };

        let mut state = self.inner.state.lock();
        let Some(conn) = state.connections.get_mut(&id) else {
            return Err(SyncError::ConnectionLost(id.to_string()));
        };
        if !conn.topics.insert(topic.to_string()) {
            debug!(connection = %id, topic, "Already subscribed");
            return Ok(());
        }
        let conn_tx = conn.tx.clone();

        if let Some(existing) = state.topics.get_mut(topic) {
            existing.subscribers.insert(id);
            match self.inner.upstream.cached(&existing.config.resource, &existing.config.params) {
                Some(value) => {
                    let _ = conn_tx.try_send(Outbound::Message(ServerMessage::initial_data(topic, value)));
                }
                None if !existing.primed => {
                    // The first fetch is still in flight and will include us.
                    existing.awaiting_initial.insert(id);
                }
                None => {
                    existing.awaiting_initial.insert(id);
                    tokio::spawn(self.clone().prime_subscriber(id, topic.to_string(), existing.config.clone()));
                }
            }
            debug!(connection = %id, topic, subscribers = existing.subscribers.len(), "Subscribed");
            return Ok(());
        }

        let poll = self.inner.shutdown.child_token();
        let mut entry = Topic {
            config: config.clone(),
            subscribers: HashSet::new(),
            awaiting_initial: HashSet::new(),
            primed: false,
            poll: poll.clone(),
        };
        entry.subscribers.insert(id);
        entry.awaiting_initial.insert(id);
        state.topics.insert(topic.to_string(), entry);
        drop(state);

        info!(
            topic,
            interval_secs = config.refresh_interval_secs,
            "Topic activated"
        );
        tokio::spawn(self.clone().run_topic(topic.to_string(), config, poll));
        Ok(())
    }

    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) {
        let mut state = self.inner.state.lock();
        let removed = state
            .connections
            .get_mut(&id)
            .map(|conn| conn.topics.remove(topic))
            .unwrap_or(false);
        if removed {
            Self::remove_subscriber(&mut state, topic, id);
            debug!(connection = %id, topic, "Unsubscribed");
        }
    }

    /// Drop `id` from a topic, deactivating the topic and cancelling its
    /// poll loop when it was the last subscriber.
    fn remove_subscriber(state: &mut HubState, topic: &str, id: ConnectionId) {
        let Some(entry) = state.topics.get_mut(topic) else {
            return;
        };
        entry.subscribers.remove(&id);
        entry.awaiting_initial.remove(&id);
        if entry.subscribers.is_empty() {
            if let Some(entry) = state.topics.remove(topic) {
                entry.poll.cancel();
                info!(topic, "Topic deactivated");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Polling & fan-out
    // -----------------------------------------------------------------------

    async fn run_topic(self, topic: String, config: TopicConfig, token: CancellationToken) {
        let mut ticker = tokio::time::interval(config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.inner.upstream.fetch(&config.resource, &config.params) => result,
            };
            self.deliver(&topic, &token, result);
        }
        debug!(topic = %topic, "Poll loop stopped");
    }

    /// Push one fetch result to every current subscriber of `topic`.
    /// Results from a cancelled poll loop are discarded, even when the topic
    /// has since been reactivated by a new subscriber.
    fn deliver(&self, topic: &str, poll: &CancellationToken, result: Result<Value, SyncError>) {
        let mut dead = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if poll.is_cancelled() {
                return;
            }
            let HubState {
                connections,
                topics,
            } = &mut *state;
            let Some(entry) = topics.get_mut(topic) else {
                return;
            };
            entry.primed = true;

            for id in &entry.subscribers {
                let Some(conn) = connections.get(id) else {
                    continue;
                };
                let msg = match &result {
                    Ok(value) if entry.awaiting_initial.contains(id) => {
                        ServerMessage::initial_data(topic, value.clone())
                    }
                    Ok(value) => ServerMessage::update(topic, value.clone()),
                    Err(err) => ServerMessage::error(topic, err),
                };
                match conn.tx.try_send(Outbound::Message(msg)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(connection = %id, topic, "Outbound queue full, dropping push");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
            if result.is_ok() {
                entry.awaiting_initial.clear();
            }
            debug!(topic, subscribers = entry.subscribers.len(), ok = result.is_ok(), "Pushed");
        }

        for id in dead {
            self.disconnect(id);
        }
    }

    /// Fetch for a late subscriber of an active topic whose cache is empty.
    async fn prime_subscriber(self, id: ConnectionId, topic: String, config: TopicConfig) {
        let result = self.inner.upstream.fetch(&config.resource, &config.params).await;
        let mut state = self.inner.state.lock();
        let HubState {
            connections,
            topics,
        } = &mut *state;
        let (Some(conn), Some(entry)) = (connections.get(&id), topics.get_mut(&topic)) else {
            return;
        };
        if !entry.awaiting_initial.contains(&id) {
            return;
        }
        let msg = match result {
            Ok(value) => {
                entry.awaiting_initial.remove(&id);
                ServerMessage::initial_data(topic.as_str(), value)
            }
            Err(err) => ServerMessage::error(topic.as_str(), &err),
        };
        let _ = conn.tx.try_send(Outbound::Message(msg));
    }

    fn send_to(&self, id: ConnectionId, msg: ServerMessage) {
        if let Some(conn) = self.inner.state.lock().connections.get(&id) {
            let _ = conn.tx.try_send(Outbound::Message(msg));
        }
    }

    // -----------------------------------------------------------------------
    // Introspection & shutdown
    // -----------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.state.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_topic_active(&self, topic: &str) -> bool {
        self.inner.state.lock().topics.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    /// Cancel every poll loop and heartbeat and ask all sockets to close.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        for conn in state.connections.values() {
            let _ = conn.tx.try_send(Outbound::Close);
        }
        state.connections.clear();
        state.topics.clear();
        info!("Broadcast hub closed");
    }
}
