//! Match state machine, owned by a single match task

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::store::StatsRecorder;
use crate::ws::protocol::{ClientPacket, ServerPacket};

use super::broadcast::{BroadcastGroup, Peer, PeerId};
use super::map::GameMap;
use super::sprite::{distance, Sprite, SpriteKind, BULLET_DAMAGE, PLAYER_RELOAD_TIME};

pub const MIN_PLAYERS: usize = 2;
pub const MAX_PLAYERS: usize = 4;
pub const MAX_SPRITES: usize = 256;

/// Seconds a match may sit in the lobby before it is abandoned
pub const IDLE_TIME: f32 = 300.0;
/// Countdown once every player is ready
pub const WAIT_TIME: f32 = 10.0;
/// Seconds a finished match lingers before teardown
pub const OVER_TIME: f32 = 10.0;

/// Largest accepted gap between predicted and claimed position
pub const POS_DIFF_THRESHOLD: f32 = 0.5;
/// Updates claiming to be further in the future than this are rejected
pub const TIME_SKEW_THRESHOLD: f32 = -0.1;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    /// Lobby, waiting for enough ready players
    Waiting,
    /// Countdown before start
    Ready,
    /// Match in progress
    Playing,
    /// Match finished, lingering before teardown
    Over,
}

/// Why a player could not be admitted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("That game has already started.")]
    AlreadyStarted,
    #[error("You're already in the game")]
    AlreadyJoined,
    #[error("That game does not exist.")]
    NoSuchGame,
    #[error("That game is full.")]
    GameFull,
}

/// Whether the match should keep running after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Destroy,
}

/// A reserved seat, keyed by player token
#[derive(Debug, Clone)]
struct PlayerHandle {
    username: String,
    sprite_id: Option<u8>,
    kills: u32,
}

pub fn format_id(id: u32) -> String {
    format!("{:08x}", id)
}

/// One isolated simulation: map, players, sprites and lifecycle
pub struct Game {
    id: u32,
    map: Arc<GameMap>,
    phase: GamePhase,
    wait_time: f32,
    started_at: Option<Instant>,
    /// Live sprites, kept sorted by id
    sprites: Vec<Sprite>,
    /// Sprites removed this tick, swept at tick end
    dead: HashSet<u8>,
    players: HashMap<u32, PlayerHandle>,
    group: BroadcastGroup,
    rng: ChaCha8Rng,
    stats: StatsRecorder,
}

impl Game {
    pub fn new(id: u32, map: Arc<GameMap>, stats: StatsRecorder, seed: u64) -> Self {
        Self {
            id,
            map,
            phase: GamePhase::Waiting,
            wait_time: IDLE_TIME,
            started_at: None,
            sprites: Vec::new(),
            dead: HashSet::new(),
            players: HashMap::new(),
            group: BroadcastGroup::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn wait_time(&self) -> f32 {
        self.wait_time
    }

    /// Spawned players still alive
    pub fn num_players(&self) -> usize {
        self.live_sprites()
            .filter(|s| s.as_player().is_some())
            .count()
    }

    /// Seconds since the match entered `Playing`, zero before that
    pub fn game_time(&self, now: Instant) -> f32 {
        self.started_at
            .map(|start| now.saturating_duration_since(start).as_secs_f32())
            .unwrap_or(0.0)
    }

    fn live_sprites(&self) -> impl Iterator<Item = &Sprite> {
        self.sprites.iter().filter(|s| !self.dead.contains(&s.id))
    }

    fn sprite_index(&self, id: u8) -> Option<usize> {
        self.sprites.binary_search_by_key(&id, |s| s.id).ok()
    }

    /// Index of the live sprite belonging to `token`
    fn player_index(&self, token: u32) -> Option<usize> {
        let id = self.players.get(&token)?.sprite_id?;
        if self.dead.contains(&id) {
            return None;
        }
        self.sprite_index(id)
    }

    fn all_ready(&self) -> bool {
        self.live_sprites()
            .filter_map(|s| s.as_player())
            .all(|p| p.ready)
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Reserve a token for `username` before its socket connects
    pub fn allocate_player(&mut self, username: &str) -> Result<u32, JoinError> {
        if !matches!(self.phase, GamePhase::Waiting | GamePhase::Ready) {
            return Err(JoinError::AlreadyStarted);
        }

        if let Some((token, handle)) = self.players.iter().find(|(_, h)| h.username == username) {
            if handle.sprite_id.is_some() {
                return Err(JoinError::AlreadyJoined);
            }
            return Ok(*token);
        }

        if self.players.len() >= MAX_PLAYERS {
            return Err(JoinError::GameFull);
        }

        let token = loop {
            let candidate: u32 = self.rng.gen();
            if !self.players.contains_key(&candidate) {
                break candidate;
            }
        };
        self.players.insert(
            token,
            PlayerHandle {
                username: username.to_string(),
                sprite_id: None,
                kills: 0,
            },
        );
        trace!(match_id = %format_id(self.id), token = %format_id(token), username, "Allocated player");
        Ok(token)
    }

    /// Drop an unspawned reservation
    pub fn deallocate_player(&mut self, token: u32) {
        if let Some(handle) = self.players.get(&token) {
            if handle.sprite_id.is_none() {
                self.players.remove(&token);
                trace!(match_id = %format_id(self.id), token = %format_id(token), "Deallocated player");
            }
        }
    }

    /// Spawn the sprite for an allocated token, or return the existing one
    pub fn new_player(&mut self, token: u32) -> Option<u8> {
        let Some(handle) = self.players.get(&token) else {
            warn!(match_id = %format_id(self.id), token = %format_id(token), "No player with that token");
            return None;
        };
        if let Some(id) = handle.sprite_id {
            return Some(id);
        }

        let current = self.num_players();
        if current >= MAX_PLAYERS {
            warn!(match_id = %format_id(self.id), "Max players reached");
            return None;
        }
        let Some(spawn) = self.map.spawn_position_for_player(current) else {
            warn!(match_id = %format_id(self.id), token = %format_id(token), "No place to spawn player");
            return None;
        };

        let id = self.next_entity_id()?;
        self.add_sprite(Sprite::player(id, token, &spawn))?;
        if let Some(handle) = self.players.get_mut(&token) {
            handle.sprite_id = Some(id);
        }
        debug!(
            match_id = %format_id(self.id),
            token = %format_id(token),
            sprite_id = id,
            x = spawn.x,
            y = spawn.y,
            "Spawned player"
        );
        Some(id)
    }

    /// Fire a bullet from `owner_id`'s position and facing
    pub fn new_bullet(&mut self, owner_id: u8) -> Option<u8> {
        let owner = &self.sprites[self.sprite_index(owner_id)?];
        let owner_token = owner.as_player()?.token;
        let id = self.next_entity_id()?;
        let bullet = Sprite::bullet(id, owner, owner_token);
        self.add_sprite(bullet)
    }

    /// Smallest positive id not in use, `None` once all 255 are taken
    pub fn next_entity_id(&self) -> Option<u8> {
        let mut candidate: u8 = 1;
        for sprite in &self.sprites {
            if sprite.id > candidate {
                break;
            }
            candidate = sprite.id.checked_add(1)?;
        }
        Some(candidate)
    }

    fn add_sprite(&mut self, sprite: Sprite) -> Option<u8> {
        if self.sprites.len() >= MAX_SPRITES {
            warn!(match_id = %format_id(self.id), "Sprite cap reached");
            return None;
        }
        let index = self.sprites.partition_point(|s| s.id < sprite.id);
        self.group
            .send(ServerPacket::create(sprite.descriptor(None), &sprite.transform()), None);
        let id = sprite.id;
        self.sprites.insert(index, sprite);
        Some(id)
    }

    /// Mark a sprite for removal and announce it. Repeated calls are no-ops.
    pub fn remove_sprite(&mut self, id: u8, actor: Option<u8>) -> bool {
        let Some(index) = self.sprite_index(id) else {
            return false;
        };
        if !self.dead.insert(id) {
            return false;
        }
        let descriptor = self.sprites[index].descriptor(actor);
        self.group.send(ServerPacket::destroy(descriptor), None);
        true
    }

    /// Remove `token`'s sprite and release its seat. `actor` is the sprite
    /// named in the DESTROY descriptor, `died` marks a kill.
    pub fn remove_player(&mut self, token: u32, actor: Option<u8>, died: bool) -> bool {
        let Some(sprite_id) = self.players.get(&token).and_then(|h| h.sprite_id) else {
            return false;
        };
        if !self.remove_sprite(sprite_id, actor) {
            return false;
        }
        let Some(handle) = self.players.remove(&token) else {
            return false;
        };
        if self.phase == GamePhase::Playing {
            self.stats
                .record(&handle.username, handle.kills, died);
        }
        info!(
            match_id = %format_id(self.id),
            sprite_id,
            username = %handle.username,
            killed = died,
            "Removed player"
        );
        true
    }

    /// Sweep sprites removed during this tick
    pub fn cleanup(&mut self) {
        if self.dead.is_empty() {
            return;
        }
        let dead = std::mem::take(&mut self.dead);
        self.sprites.retain(|s| !dead.contains(&s.id));
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    pub fn tick(&mut self, dt: f32, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::Continue;
        match self.phase {
            GamePhase::Waiting => {
                if self.num_players() >= MIN_PLAYERS && self.all_ready() {
                    self.wait_time = WAIT_TIME;
                    self.phase = GamePhase::Ready;
                    self.group.send(self.wait_packet(), None);
                    info!(match_id = %format_id(self.id), "All players ready, starting countdown");
                } else if self.wait_time <= 0.0 {
                    self.phase = GamePhase::Over;
                    info!(match_id = %format_id(self.id), "Match idle for too long");
                } else {
                    self.wait_time -= dt;
                }
            }

            GamePhase::Ready => {
                if self.num_players() < MIN_PLAYERS || !self.all_ready() {
                    self.wait_time = IDLE_TIME;
                    self.phase = GamePhase::Waiting;
                    self.group.send(self.wait_packet(), None);
                    info!(match_id = %format_id(self.id), "Countdown aborted");
                } else if self.wait_time <= 0.0 {
                    self.started_at = Some(now);
                    self.wait_time = 0.0;
                    self.phase = GamePhase::Playing;
                    self.group.send(self.wait_packet(), None);
                    info!(
                        match_id = %format_id(self.id),
                        players = self.num_players(),
                        "Match started"
                    );
                } else {
                    self.wait_time -= dt;
                }
            }

            GamePhase::Playing => {
                if self.num_players() <= 1 {
                    self.wait_time = OVER_TIME;
                    self.phase = GamePhase::Over;
                    self.save_all_stats();
                    info!(match_id = %format_id(self.id), "Match over");
                } else {
                    self.tick_sprites(dt);
                }
            }

            GamePhase::Over => {
                if self.num_players() == 0 || self.wait_time <= 0.0 {
                    outcome = TickOutcome::Destroy;
                } else {
                    self.wait_time -= dt;
                }
            }
        }
        self.cleanup();
        outcome
    }

    fn tick_sprites(&mut self, dt: f32) {
        for index in 0..self.sprites.len() {
            let id = self.sprites[index].id;
            if self.dead.contains(&id) {
                continue;
            }

            let sprite = &mut self.sprites[index];
            let hit_wall = sprite.step(&self.map, dt);
            let is_player = match &mut sprite.kind {
                SpriteKind::Player(player) => {
                    if player.reload_time > 0.0 {
                        player.reload_time -= dt;
                    }
                    true
                }
                SpriteKind::Bullet { .. } => false,
            };

            if is_player {
                self.player_collisions(index);
            } else if hit_wall {
                self.remove_sprite(id, None);
            }
        }
    }

    /// Pairwise test of one player against every bullet it overlaps
    fn player_collisions(&mut self, index: usize) {
        let player = &self.sprites[index];
        let Some(token) = player.as_player().map(|p| p.token) else {
            return;
        };
        let player_id = player.id;

        let hits: Vec<(u8, u32)> = self
            .live_sprites()
            .filter(|other| other.id != player_id)
            .filter_map(|other| match other.kind {
                SpriteKind::Bullet { owner_token, .. }
                    if owner_token != token
                        && player.distance_to(other) < player.radius + other.radius =>
                {
                    Some((other.id, owner_token))
                }
                _ => None,
            })
            .collect();

        for (bullet_id, shooter_token) in hits {
            if self.dead.contains(&player_id) {
                break;
            }
            self.remove_sprite(bullet_id, Some(player_id));

            let health = match self.sprites[index].as_player_mut() {
                Some(player) => {
                    player.health -= BULLET_DAMAGE;
                    player.health
                }
                None => break,
            };
            if health <= 0 {
                self.kill_player(token, shooter_token);
            }
        }
    }

    fn kill_player(&mut self, token: u32, shooter_token: u32) {
        let shooter = self.players.get_mut(&shooter_token).map(|shooter| {
            shooter.kills += 1;
            shooter.sprite_id
        });
        let killer = shooter.flatten();
        debug!(
            match_id = %format_id(self.id),
            token = %format_id(token),
            killer = ?killer,
            "Player killed"
        );
        self.remove_player(token, killer, true);
    }

    /// Persist stats for everyone still in the match
    pub fn save_all_stats(&self) {
        for handle in self.players.values().filter(|h| h.sprite_id.is_some()) {
            self.stats.record(&handle.username, handle.kills, false);
        }
    }

    // ------------------------------------------------------------------------
    // Packets
    // ------------------------------------------------------------------------

    fn wait_packet(&self) -> ServerPacket {
        ServerPacket::wait(self.phase == GamePhase::Waiting, self.wait_time)
    }

    fn hello_packet(&self, your_id: u8) -> ServerPacket {
        let sprites: Vec<_> = self
            .live_sprites()
            .map(|s| (s.descriptor(None), s.transform()))
            .collect();
        ServerPacket::hello(
            your_id,
            self.map.width(),
            self.map.height(),
            &sprites,
            self.map.compressed_data(),
        )
    }

    /// Apply a validated packet from `peer`, which authenticated as `token`
    pub fn handle_packet(&mut self, peer: &Peer, token: u32, packet: ClientPacket, now: Instant) {
        if !matches!(packet, ClientPacket::Ready { .. }) && !self.group.contains(peer.id()) {
            warn!(
                match_id = %format_id(self.id),
                peer_id = %peer.id(),
                "Packet from a peer that has not joined"
            );
            return;
        }

        match packet {
            ClientPacket::Ready { ready } => self.handle_ready(peer, token, ready),
            ClientPacket::Leave => {
                debug!(match_id = %format_id(self.id), peer_id = %peer.id(), "Player leaving");
                self.disconnect(peer.id(), token);
            }
            ClientPacket::Update {
                keys,
                rotation,
                timestamp,
                position,
            } => {
                self.handle_update(peer.id(), token, keys, rotation, timestamp, position, now);
            }
            ClientPacket::Fire => self.handle_fire(token),
        }
    }

    fn handle_ready(&mut self, peer: &Peer, token: u32, ready: bool) {
        let Some(sprite_id) = self.new_player(token) else {
            warn!(match_id = %format_id(self.id), peer_id = %peer.id(), "Could not spawn player");
            peer.close();
            return;
        };

        if !self.group.contains(peer.id()) {
            self.group.add(peer.clone());
            peer.send(Arc::new(self.hello_packet(sprite_id)));
            peer.send(Arc::new(self.wait_packet()));
            info!(
                match_id = %format_id(self.id),
                peer_id = %peer.id(),
                sprite_id,
                "Client joined match"
            );
        }

        if let Some(index) = self.sprite_index(sprite_id) {
            if let Some(player) = self.sprites[index].as_player_mut() {
                player.ready = ready;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_update(
        &mut self,
        peer_id: PeerId,
        token: u32,
        keys: u32,
        rotation: f32,
        timestamp: f32,
        position: Option<(f32, f32)>,
        now: Instant,
    ) {
        if self.phase != GamePhase::Playing {
            debug!(match_id = %format_id(self.id), "Update outside of play ignored");
            return;
        }
        let Some(index) = self.player_index(token) else {
            debug!(match_id = %format_id(self.id), token = %format_id(token), "Update for a player without a sprite");
            return;
        };

        let game_time = self.game_time(now);
        let ack = match position {
            Some((x, y)) => self.reconcile(index, keys, rotation, x, y, game_time - timestamp),
            None => {
                let sprite = &mut self.sprites[index];
                sprite.rotation = rotation;
                sprite.set_motion(keys, rotation);
                false
            }
        };

        let sprite = &self.sprites[index];
        let update = ServerPacket::update(game_time, sprite.id, &sprite.transform());
        self.group.send(update, ack.then_some(peer_id));
    }

    /// Check a claimed position `delta` seconds old against the server's.
    /// Accepted claims are adopted and caught up to now; the input's
    /// direction applies either way.
    fn reconcile(&mut self, index: usize, keys: u32, rotation: f32, x: f32, y: f32, delta: f32) -> bool {
        let sprite = &mut self.sprites[index];
        let predicted = sprite.move_and_collide(&self.map, -delta, x, y);
        let diff = distance(predicted.x, predicted.y, sprite.x, sprite.y);
        let ack = delta > TIME_SKEW_THRESHOLD && diff <= POS_DIFF_THRESHOLD;

        sprite.rotation = rotation;
        sprite.set_motion(keys, rotation);
        if ack {
            sprite.x = x;
            sprite.y = y;
            sprite.step(&self.map, delta.max(0.0));
        } else {
            debug!(
                match_id = %format_id(self.id),
                sprite_id = sprite.id,
                delta,
                diff,
                "Rejected client position"
            );
        }
        ack
    }

    fn handle_fire(&mut self, token: u32) {
        if self.phase != GamePhase::Playing {
            debug!(match_id = %format_id(self.id), "Fire outside of play ignored");
            return;
        }
        let Some(index) = self.player_index(token) else {
            return;
        };
        let sprite_id = self.sprites[index].id;
        let Some(player) = self.sprites[index].as_player_mut() else {
            return;
        };
        if player.reload_time > 0.0 || player.is_dead() {
            trace!(match_id = %format_id(self.id), sprite_id, "Still reloading");
            return;
        }
        player.reload_time = PLAYER_RELOAD_TIME;
        self.new_bullet(sprite_id);
    }

    /// Detach a connection: leave the group and give up the seat
    pub fn disconnect(&mut self, peer_id: PeerId, token: u32) {
        self.group.remove(peer_id);
        if !self.remove_player(token, None, false) {
            self.deallocate_player(token);
        }
    }

    /// Forced teardown: keep stats of a running match, then say goodbye
    pub fn shutdown(&mut self) {
        if self.phase == GamePhase::Playing {
            self.save_all_stats();
        }
        self.terminate();
    }

    /// Tell every peer the match is gone
    pub fn terminate(&mut self) {
        info!(match_id = %format_id(self.id), peers = self.group.len(), "Destroying match");
        self.group.send(ServerPacket::terminate(), None);
        self.group.close_all();
    }
}
