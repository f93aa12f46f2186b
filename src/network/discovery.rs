//! Peer discovery and liveness tracking
//!
//! Every node announces itself at a fixed interval to the configured targets
//! (normally the LAN broadcast address) and answers each announcement it hears
//! with a unicast reply. The resulting [`PeerTable`] is the single point of
//! synchronization for the peer set.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::network::udp::{Inbound, Transport};
use crate::protocol::{self, Message, Presence, Role};
use crate::session::SessionEvent;

/// What we know about one remote node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub node_id: Uuid,
    pub role: Role,
    pub display_name: String,
    pub last_seen: Instant,
}

/// Live peer set, keyed by address
///
/// Cloning shares the same table. All access goes through one mutex so
/// readers always see a consistent snapshot.
#[derive(Clone)]
pub struct PeerTable {
    inner: Arc<Mutex<HashMap<SocketAddr, PeerRecord>>>,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert or refresh the record for `address`. Returns the record if the
    /// peer was not live before.
    pub fn upsert(&self, address: SocketAddr, presence: &Presence, now: Instant) -> Option<PeerRecord> {
        let mut peers = self.inner.lock();
        let was_live = peers
            .get(&address)
            .is_some_and(|record| self.is_live(record, now));

        let record = PeerRecord {
            address,
            node_id: presence.node_id,
            role: presence.role,
            display_name: presence.display_name.clone(),
            last_seen: now,
        };
        peers.insert(address, record.clone());

        (!was_live).then_some(record)
    }

    /// Peers heard from within the timeout, ordered by address
    pub fn snapshot(&self, now: Instant) -> Vec<PeerRecord> {
        let peers = self.inner.lock();
        let mut live: Vec<PeerRecord> = peers
            .values()
            .filter(|record| self.is_live(record, now))
            .cloned()
            .collect();
        live.sort_by_key(|record| record.address);
        live
    }

    /// Addresses of live peers playing `role`
    pub fn addresses(&self, role: Role, now: Instant) -> Vec<SocketAddr> {
        self.snapshot(now)
            .into_iter()
            .filter(|record| record.role == role)
            .map(|record| record.address)
            .collect()
    }

    /// Remove and return every expired record
    pub fn sweep(&self, now: Instant) -> Vec<PeerRecord> {
        let mut peers = self.inner.lock();
        let expired: Vec<SocketAddr> = peers
            .values()
            .filter(|record| !self.is_live(record, now))
            .map(|record| record.address)
            .collect();
        expired
            .into_iter()
            .filter_map(|address| peers.remove(&address))
            .collect()
    }

    /// Records currently stored, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn is_live(&self, record: &PeerRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.last_seen) <= self.timeout
    }
}

/// Periodic presence announcements plus the inbound presence tracker
pub struct DiscoveryService {
    transport: Transport,
    peers: PeerTable,
    node_id: Uuid,
    announce: Vec<SocketAddr>,
    interval: Duration,
    events: broadcast::Sender<SessionEvent>,
    presence_rx: Mutex<Option<mpsc::Receiver<Inbound<Presence>>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(
        transport: Transport,
        peers: PeerTable,
        node_id: Uuid,
        config: &NetworkConfig,
        presence_rx: mpsc::Receiver<Inbound<Presence>>,
        events: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            peers,
            node_id,
            announce: config.announce.clone(),
            interval: config.presence_interval(),
            events,
            presence_rx: Mutex::new(Some(presence_rx)),
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Begin announcing and tracking peers. Returns `false` if already started.
    pub fn start(&self, role: Role, display_name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return false;
        }
        let Some(presence_rx) = self.presence_rx.lock().take() else {
            return false;
        };

        let presence = Presence::new(self.node_id, role, display_name);
        tracing::info!(
            "Discovery started as {} '{}' every {:?}",
            role,
            presence.display_name,
            self.interval
        );

        tasks.push(tokio::spawn(announce_loop(
            self.transport.clone(),
            presence.clone(),
            self.announce.clone(),
            self.interval,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(track_loop(
            self.transport.clone(),
            self.peers.clone(),
            presence,
            presence_rx,
            self.events.clone(),
            self.cancel.clone(),
        )));
        true
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty() && !self.cancel.is_cancelled()
    }

    /// Snapshot of currently live peers
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot(Instant::now())
    }

    /// Stop both workers and wait for them to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn announce_loop(
    transport: Transport,
    presence: Presence,
    targets: Vec<SocketAddr>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let packet = protocol::encode(&Message::Presence(presence));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for target in &targets {
            // Retried on the next tick
            if let Err(e) = transport.send_bytes(*target, &packet).await {
                tracing::warn!("Presence announcement failed: {}", e);
            }
        }
    }
}

async fn track_loop(
    transport: Transport,
    peers: PeerTable,
    own: Presence,
    mut presence_rx: mpsc::Receiver<Inbound<Presence>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let reply = protocol::encode(&Message::Presence(own.as_reply()));
    let sweep_every = (peers.timeout() / 4).max(Duration::from_millis(10));
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = presence_rx.recv() => {
                let Some(inbound) = inbound else { break };
                // Our own broadcast looped back
                if inbound.message.node_id == own.node_id {
                    continue;
                }

                if let Some(record) = peers.upsert(inbound.from, &inbound.message, inbound.received_at) {
                    tracing::info!(
                        "Peer joined: {} '{}' at {}",
                        record.role,
                        record.display_name,
                        record.address
                    );
                    let _ = events.send(SessionEvent::PeerJoined(record));
                }

                if !inbound.message.reply {
                    if let Err(e) = transport.send_bytes(inbound.from, &reply).await {
                        tracing::debug!("Presence reply failed: {}", e);
                    }
                }
            }
            _ = sweep.tick() => {
                for record in peers.sweep(Instant::now()) {
                    tracing::info!(
                        "Peer timed out: {} '{}' at {}",
                        record.role,
                        record.display_name,
                        record.address
                    );
                    let _ = events.send(SessionEvent::PeerLeft(record));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::Routes;
    use proptest::prelude::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], port))
    }

    fn presence(role: Role) -> Presence {
        Presence::new(Uuid::new_v4(), role, "peer")
    }

    #[test]
    fn test_upsert_reports_join_once() {
        let table = PeerTable::new(Duration::from_secs(3));
        let now = Instant::now();
        let p = presence(Role::Receiver);
        assert!(table.upsert(addr(1), &p, now).is_some());
        assert!(table.upsert(addr(1), &p, now + Duration::from_secs(1)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_one_record_per_address() {
        let table = PeerTable::new(Duration::from_secs(3));
        let now = Instant::now();
        table.upsert(addr(1), &presence(Role::Receiver), now);
        // A restarted node at the same address replaces the old record
        table.upsert(addr(1), &presence(Role::Sender), now);
        let snapshot = table.snapshot(now);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].role, Role::Sender);
    }

    #[test]
    fn test_expired_peer_hidden_before_sweep() {
        let table = PeerTable::new(Duration::from_secs(3));
        let start = Instant::now();
        table.upsert(addr(1), &presence(Role::Receiver), start);
        table.upsert(addr(2), &presence(Role::Receiver), start + Duration::from_secs(2));

        let later = start + Duration::from_secs(4);
        assert_eq!(table.addresses(Role::Receiver, later), vec![addr(2)]);
        assert_eq!(table.len(), 2);

        let removed = table.sweep(later);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].address, addr(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rejoin_after_expiry_is_reported() {
        let table = PeerTable::new(Duration::from_secs(1));
        let start = Instant::now();
        let p = presence(Role::Sender);
        table.upsert(addr(1), &p, start);
        assert!(table
            .upsert(addr(1), &p, start + Duration::from_secs(5))
            .is_some());
    }

    #[test]
    fn test_addresses_filter_by_role() {
        let table = PeerTable::new(Duration::from_secs(3));
        let now = Instant::now();
        table.upsert(addr(3), &presence(Role::Receiver), now);
        table.upsert(addr(1), &presence(Role::Sender), now);
        table.upsert(addr(2), &presence(Role::Receiver), now);
        assert_eq!(table.addresses(Role::Receiver, now), vec![addr(2), addr(3)]);
        assert_eq!(table.addresses(Role::Sender, now), vec![addr(1)]);
    }

    proptest! {
        #[test]
        fn peer_present_iff_heard_within_timeout(
            events in proptest::collection::vec((0u16..4, 0u64..10_000), 0..40),
            query_at in 0u64..12_000,
        ) {
            let timeout = Duration::from_millis(3000);
            let table = PeerTable::new(timeout);
            let start = Instant::now();
            let p = presence(Role::Receiver);

            let mut sorted = events.clone();
            sorted.sort_by_key(|&(_, at)| at);
            let heard: Vec<_> = sorted.into_iter().filter(|&(_, at)| at <= query_at).collect();
            for &(peer, at) in &heard {
                table.upsert(addr(peer), &p, start + Duration::from_millis(at));
            }

            let now = start + Duration::from_millis(query_at);
            table.sweep(now);
            let live: Vec<SocketAddr> = table.snapshot(now).into_iter().map(|r| r.address).collect();

            for peer in 0u16..4 {
                let expected = heard
                    .iter()
                    .any(|&(p, at)| p == peer && query_at - at <= 3000);
                prop_assert_eq!(live.contains(&addr(peer)), expected);
            }
        }
    }

    #[tokio::test]
    async fn test_announcement_is_answered() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(16);

        let sender_transport = Transport::bind(loopback).unwrap();
        let receiver_transport = Transport::bind(loopback).unwrap();

        let mut sender_config = NetworkConfig {
            presence_interval_ms: 50,
            ..NetworkConfig::default()
        };
        sender_config.announce = vec![receiver_transport.local_addr()];
        let receiver_config = NetworkConfig {
            presence_interval_ms: 50,
            announce: Vec::new(),
            ..NetworkConfig::default()
        };

        let mut services = Vec::new();
        for (transport, config, role) in [
            (&sender_transport, &sender_config, Role::Sender),
            (&receiver_transport, &receiver_config, Role::Receiver),
        ] {
            let (tx, rx) = mpsc::channel(16);
            let _dispatch = transport.spawn_dispatch(Routes::new().presence(tx), cancel.clone());
            let service = DiscoveryService::new(
                transport.clone(),
                PeerTable::new(config.peer_timeout()),
                Uuid::new_v4(),
                config,
                rx,
                events.clone(),
                cancel.clone(),
            );
            assert!(service.start(role, "node"));
            assert!(!service.start(role, "node"));
            services.push(service);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && (services[0].peers().is_empty() || services[1].peers().is_empty())
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let seen_by_sender = services[0].peers();
        assert_eq!(seen_by_sender.len(), 1);
        assert_eq!(seen_by_sender[0].address, receiver_transport.local_addr());
        assert_eq!(seen_by_sender[0].role, Role::Receiver);
        assert_eq!(services[1].peers()[0].role, Role::Sender);

        for service in &services {
            service.stop().await;
            assert!(!service.is_running());
        }
    }
}
