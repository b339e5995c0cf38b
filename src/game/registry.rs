//! Registry of running matches and the task that drives each one

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::store::StatsRecorder;
use crate::util::time::{tick_period, TickClock};
use crate::ws::protocol::ClientPacket;

use super::broadcast::{Peer, PeerId};
use super::map::GameMap;
use super::r#match::{format_id, Game, JoinError, TickOutcome};

/// Matches allowed to run at once
pub const MAX_GAMES: usize = 256;

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Work delivered to a match task
#[derive(Debug)]
pub enum MatchCommand {
    /// Reserve a player token
    Allocate {
        username: String,
        reply: oneshot::Sender<Result<u32, JoinError>>,
    },
    /// A validated packet from a connection
    Packet {
        peer: Peer,
        token: u32,
        packet: ClientPacket,
    },
    /// A connection closed
    Disconnect { peer_id: PeerId, token: u32 },
    /// Save stats, say goodbye and stop
    Shutdown { done: oneshot::Sender<()> },
}

/// Handle to a running match
#[derive(Debug, Clone)]
pub struct MatchHandle {
    pub id: u32,
    pub creator: String,
    pub map_name: String,
    command_tx: mpsc::Sender<MatchCommand>,
    player_count: Arc<AtomicUsize>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    /// Queue a command, `false` once the match has stopped
    pub async fn send(&self, command: MatchCommand) -> bool {
        self.command_tx.send(command).await.is_ok()
    }

    pub async fn allocate_player(&self, username: &str) -> Result<u32, JoinError> {
        let (reply, response) = oneshot::channel();
        let command = MatchCommand::Allocate {
            username: username.to_string(),
            reply,
        };
        if !self.send(command).await {
            return Err(JoinError::NoSuchGame);
        }
        response.await.unwrap_or(Err(JoinError::NoSuchGame))
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<u32, MatchHandle>,
    create_lock: Mutex<()>,
    tick_rate: u32,
    stats: StatsRecorder,
}

impl MatchRegistry {
    pub fn new(tick_rate: u32, stats: StatsRecorder) -> Self {
        Self {
            matches: DashMap::new(),
            create_lock: Mutex::new(()),
            tick_rate,
            stats,
        }
    }

    /// Start a new match task, `None` at capacity
    pub fn create(
        self: &Arc<Self>,
        creator: &str,
        map_name: &str,
        map: Arc<GameMap>,
    ) -> Option<MatchHandle> {
        let _guard = self.create_lock.lock();
        if self.matches.len() >= MAX_GAMES {
            warn!(creator, "Match limit reached");
            return None;
        }

        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen();
            if !self.matches.contains_key(&candidate) {
                break candidate;
            }
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let player_count = Arc::new(AtomicUsize::new(0));
        let handle = MatchHandle {
            id,
            creator: creator.to_string(),
            map_name: map_name.to_string(),
            command_tx,
            player_count: player_count.clone(),
        };
        self.matches.insert(id, handle.clone());

        let game = Game::new(id, map, self.stats.clone(), rng.gen());
        let task = tokio::spawn(run_match(game, command_rx, self.tick_rate, player_count));
        self.supervise(id, task);

        info!(match_id = %format_id(id), creator, map = map_name, "Match created");
        Some(handle)
    }

    /// Drop the match from the registry once its task ends, however it ends
    fn supervise(self: &Arc<Self>, id: u32, task: JoinHandle<()>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(match_id = %format_id(id), "Match task panicked");
                } else {
                    warn!(match_id = %format_id(id), "Match task cancelled");
                }
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        });
    }

    pub fn get(&self, id: u32) -> Option<MatchHandle> {
        self.matches.get(&id).map(|m| m.value().clone())
    }

    pub fn get_by_creator(&self, creator: &str) -> Option<MatchHandle> {
        self.matches
            .iter()
            .find(|m| m.value().creator == creator)
            .map(|m| m.value().clone())
    }

    pub fn remove(&self, id: u32) -> Option<MatchHandle> {
        self.matches.remove(&id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().player_count())
            .sum()
    }

    pub async fn allocate_player(&self, id: u32, username: &str) -> Result<u32, JoinError> {
        let handle = self.get(id).ok_or(JoinError::NoSuchGame)?;
        handle.allocate_player(username).await
    }

    /// Stop every match, waiting up to `timeout` for them to finish
    pub async fn shutdown_all(&self, timeout: Duration) {
        let handles: Vec<MatchHandle> = self.matches.iter().map(|m| m.value().clone()).collect();
        if handles.is_empty() {
            return;
        }
        info!(matches = handles.len(), "Shutting down matches");

        let stop_all = async {
            let mut pending = Vec::with_capacity(handles.len());
            for handle in &handles {
                let (done, finished) = oneshot::channel();
                if handle.send(MatchCommand::Shutdown { done }).await {
                    pending.push(finished);
                }
            }
            futures::future::join_all(pending).await;
        };

        if tokio::time::timeout(timeout, stop_all).await.is_err() {
            warn!("Timed out waiting for matches to shut down");
        }
    }
}

/// Own `game` for its whole life: apply commands as they arrive and tick it
/// at `tick_rate` until it is destroyed or shut down
async fn run_match(
    mut game: Game,
    mut commands: mpsc::Receiver<MatchCommand>,
    tick_rate: u32,
    player_count: Arc<AtomicUsize>,
) {
    let match_id = format_id(game.id());
    info!(match_id = %match_id, tick_rate, "Match task started");

    let mut ticker = interval(tick_period(tick_rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut clock = TickClock::new(Instant::now().into_std());

    let done = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(done) = apply(&mut game, command) {
                        break Some(done);
                    }
                }
                None => {
                    game.terminate();
                    break None;
                }
            },
            _ = ticker.tick() => {
                let now = Instant::now().into_std();
                let dt = clock.step(now);
                if game.tick(dt, now) == TickOutcome::Destroy {
                    game.terminate();
                    break None;
                }
            }
        }
        player_count.store(game.num_players(), Ordering::Relaxed);
    };

    player_count.store(0, Ordering::Relaxed);
    if let Some(done) = done {
        let _ = done.send(());
    }
    info!(match_id = %match_id, "Match task finished");
}

/// Returns the shutdown acknowledgement once the match has been torn down
fn apply(game: &mut Game, command: MatchCommand) -> Option<oneshot::Sender<()>> {
    match command {
        MatchCommand::Allocate { username, reply } => {
            let _ = reply.send(game.allocate_player(&username));
        }
        MatchCommand::Packet {
            peer,
            token,
            packet,
        } => game.handle_packet(&peer, token, packet, Instant::now().into_std()),
        MatchCommand::Disconnect { peer_id, token } => game.disconnect(peer_id, token),
        MatchCommand::Shutdown { done } => {
            game.shutdown();
            return Some(done);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::broadcast::PeerMessage;
    use crate::game::map::test_arena;
    use crate::ws::protocol::{
        encode_client_frame, split_server_frame, ClientPacketType, Handshake, ServerPacketType,
        HANDSHAKE_MAGIC,
    };
    use crate::ws::session::{ClientSession, ServerSequence};
    use tokio_test::assert_ok;

    fn registry() -> (Arc<MatchRegistry>, mpsc::UnboundedReceiver<crate::store::stats::StatsUpdate>) {
        let (stats, stats_rx) = StatsRecorder::channel();
        (Arc::new(MatchRegistry::new(60, stats)), stats_rx)
    }

    /// A connection as the socket handler would drive it
    struct TestClient {
        session: ClientSession,
        peer: Peer,
        rx: mpsc::Receiver<PeerMessage>,
        out_sequence: ServerSequence,
        in_sequence: u32,
    }

    impl TestClient {
        fn connect(token: u32, game_id: u32) -> Self {
            let mut frame = Vec::new();
            for word in [token, game_id, HANDSHAKE_MAGIC] {
                frame.extend_from_slice(&word.to_le_bytes());
            }
            let handshake = Handshake::parse(&frame).unwrap();
            let (peer, rx) = Peer::channel();
            Self {
                session: ClientSession::new(handshake, peer.id()),
                peer,
                rx,
                out_sequence: ServerSequence::default(),
                in_sequence: 0,
            }
        }

        async fn send(&mut self, handle: &MatchHandle, kind: ClientPacketType, payload: &[u8]) {
            let frame =
                encode_client_frame(kind, self.in_sequence, self.session.player_token(), payload);
            self.in_sequence += 1;
            let packet = self.session.accept_frame(&frame).unwrap();
            let command = MatchCommand::Packet {
                peer: self.peer.clone(),
                token: self.session.player_token(),
                packet,
            };
            assert!(handle.send(command).await);
        }

        /// Next frame as (type, sequence, payload)
        async fn next(&mut self) -> (ServerPacketType, u32, Vec<u8>) {
            let message = tokio::time::timeout(Duration::from_secs(60), self.rx.recv())
                .await
                .expect("no frame in time")
                .expect("peer closed");
            match message {
                PeerMessage::Packet(packet) => {
                    let frame = self.out_sequence.stamp(&packet);
                    let (kind, seq, payload) = split_server_frame(&frame).unwrap();
                    (kind, seq, payload.to_vec())
                }
                PeerMessage::Close => panic!("unexpected close"),
            }
        }

        async fn next_of(&mut self, kind: ServerPacketType) -> Vec<u8> {
            loop {
                let (got, _, payload) = self.next().await;
                if got == kind {
                    return payload;
                }
            }
        }

        fn drain_kinds(&mut self) -> Vec<ServerPacketType> {
            let mut kinds = Vec::new();
            while let Ok(PeerMessage::Packet(packet)) = self.rx.try_recv() {
                kinds.push(packet.kind());
            }
            kinds
        }
    }

    fn update_payload(keys: u32, rotation: f32, timestamp: f32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&keys.to_le_bytes());
        payload.extend_from_slice(&rotation.to_le_bytes());
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload
    }

    #[tokio::test(start_paused = true)]
    async fn two_players_ready_up_play_and_shut_down() {
        let (registry, mut stats_rx) = registry();
        let map = Arc::new(test_arena().unwrap());
        let handle = registry.create("alice", "test", map).unwrap();
        assert_eq!(registry.get_by_creator("alice").map(|h| h.id), Some(handle.id));

        let alice = assert_ok!(registry.allocate_player(handle.id, "alice").await);
        let bob = assert_ok!(registry.allocate_player(handle.id, "bob").await);
        let mut a = TestClient::connect(alice, handle.id);
        let mut b = TestClient::connect(bob, handle.id);

        a.send(&handle, ClientPacketType::Ready, &[1]).await;
        let (kind, seq, hello) = a.next().await;
        assert_eq!((kind, seq), (ServerPacketType::Hello, 0));
        let a_id = hello[1];
        b.send(&handle, ClientPacketType::Ready, &[1]).await;
        let (kind, _, _) = b.next().await;
        assert_eq!(kind, ServerPacketType::Hello);

        // countdown, then the match starts
        for client in [&mut a, &mut b] {
            loop {
                let wait = client.next_of(ServerPacketType::Wait).await;
                let word = u32::from_le_bytes(wait[..4].try_into().unwrap());
                if word >> 31 == 0 && word & 0x7FFF_FFFF == 0 {
                    break;
                }
            }
        }
        assert_eq!(handle.player_count(), 2);
        assert_eq!(registry.total_players(), 2);
        assert_eq!(
            registry.allocate_player(handle.id, "carol").await,
            Err(JoinError::AlreadyStarted)
        );

        a.send(&handle, ClientPacketType::Update, &update_payload(1, 0.0, 0.0)).await;
        let update = b.next_of(ServerPacketType::Update).await;
        assert_eq!(update[4], a_id);
        let update = a.next_of(ServerPacketType::Update).await;
        assert_eq!(update[4], a_id);

        a.send(&handle, ClientPacketType::Fire, &[]).await;
        a.send(&handle, ClientPacketType::Fire, &[]).await;
        b.next_of(ServerPacketType::Create).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b.drain_kinds().contains(&ServerPacketType::Create));

        registry.shutdown_all(Duration::from_secs(5)).await;
        assert_eq!(a.next_of(ServerPacketType::Terminate).await.len(), 0);
        assert!(matches!(a.rx.recv().await, Some(PeerMessage::Close)));
        let mut saved = vec![stats_rx.recv().await.unwrap(), stats_rx.recv().await.unwrap()];
        saved.sort_by(|x, y| x.username.cmp(&y.username));
        assert_eq!(saved[0].username, "alice");
        assert_eq!(saved[1].username, "bob");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.get(handle.id).is_none());
        assert_eq!(registry.active_matches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_game_cannot_be_joined() {
        let (registry, _stats) = registry();
        assert_eq!(
            registry.allocate_player(1234, "alice").await,
            Err(JoinError::NoSuchGame)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_match_removes_itself() {
        let (registry, _stats) = registry();
        let handle = registry
            .create("alice", "test", Arc::new(test_arena().unwrap()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(305)).await;
        assert!(registry.get(handle.id).is_none());
    }

    #[tokio::test]
    async fn panicking_match_is_removed_without_affecting_others() {
        let (registry, _stats) = registry();
        let healthy = registry
            .create("alice", "test", Arc::new(test_arena().unwrap()))
            .unwrap();

        let (command_tx, _command_rx) = mpsc::channel(1);
        let doomed = MatchHandle {
            id: healthy.id.wrapping_add(1),
            creator: "bob".to_string(),
            map_name: "test".to_string(),
            command_tx,
            player_count: Arc::new(AtomicUsize::new(0)),
        };
        registry.matches.insert(doomed.id, doomed.clone());
        let task = tokio::spawn(async { panic!("corrupted match") });
        registry.supervise(doomed.id, task);

        for _ in 0..100 {
            if registry.get(doomed.id).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.get(doomed.id).is_none());
        assert!(registry.get(healthy.id).is_some());
        assert_ok!(healthy.allocate_player("carol").await);
    }

    #[tokio::test]
    async fn creation_stops_at_capacity() {
        let (registry, _stats) = registry();
        let map = Arc::new(test_arena().unwrap());
        for _ in 0..MAX_GAMES {
            assert!(registry.create("someone", "test", map.clone()).is_some());
        }
        assert!(registry.create("someone", "test", map).is_none());
        assert_eq!(registry.active_matches(), MAX_GAMES);
        registry.shutdown_all(Duration::from_secs(5)).await;
    }
}
