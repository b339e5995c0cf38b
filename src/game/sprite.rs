//! Sprites (players and bullets) and grid collision

use std::f32::consts::FRAC_1_SQRT_2;

use crate::ws::protocol::{SpriteDescriptor, SpriteTransform};

use super::map::{GameMap, SpawnPosition};

pub const PLAYER_HEALTH: i32 = 100;
pub const PLAYER_RUN_SPEED: f32 = 3.5;
pub const PLAYER_RELOAD_TIME: f32 = 0.5;
pub const PLAYER_RADIUS: f32 = 0.15;

pub const BULLET_DAMAGE: i32 = 25;
pub const BULLET_SPEED: f32 = 10.0;
pub const BULLET_RADIUS: f32 = 0.01;

/// Maximum grid cells a collision ray walks before giving up
pub const COLL_DOF: u32 = 8;

/// Wire tag of a sprite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpriteType {
    Player = 0,
    Bullet = 1,
}

/// Player-only state
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    /// Token of the player handle this sprite belongs to
    pub token: u32,
    pub health: i32,
    pub reload_time: f32,
    pub ready: bool,
}

impl PlayerState {
    pub fn is_dead(&self) -> bool {
        self.health <= 0
    }
}

/// Variant-specific sprite payload
#[derive(Debug, Clone, PartialEq)]
pub enum SpriteKind {
    Player(PlayerState),
    Bullet { owner_id: u8, owner_token: u32 },
}

/// Result of one move-and-collide pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Movement {
    pub collided: bool,
    pub x: f32,
    pub y: f32,
}

/// A simulated entity in tile-grid units
#[derive(Debug, Clone, PartialEq)]
pub struct Sprite {
    pub id: u8,
    pub radius: f32,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub velocity: f32,
    pub dir_x: f32,
    pub dir_y: f32,
    pub kind: SpriteKind,
}

impl Sprite {
    pub fn player(id: u8, token: u32, spawn: &SpawnPosition) -> Self {
        Self::with_rotation(
            id,
            PLAYER_RADIUS,
            spawn.x,
            spawn.y,
            0.0,
            spawn.rotation,
            SpriteKind::Player(PlayerState {
                token,
                health: PLAYER_HEALTH,
                reload_time: 0.0,
                ready: false,
            }),
        )
    }

    /// A bullet leaving `owner`'s position along its facing
    pub fn bullet(id: u8, owner: &Sprite, owner_token: u32) -> Self {
        Self::with_rotation(
            id,
            BULLET_RADIUS,
            owner.x,
            owner.y,
            BULLET_SPEED,
            owner.rotation,
            SpriteKind::Bullet {
                owner_id: owner.id,
                owner_token,
            },
        )
    }

    fn with_rotation(
        id: u8,
        radius: f32,
        x: f32,
        y: f32,
        velocity: f32,
        rotation: f32,
        kind: SpriteKind,
    ) -> Self {
        Self {
            id,
            radius,
            x,
            y,
            rotation,
            velocity,
            dir_x: rotation.cos(),
            dir_y: rotation.sin(),
            kind,
        }
    }

    pub fn sprite_type(&self) -> SpriteType {
        match self.kind {
            SpriteKind::Player(_) => SpriteType::Player,
            SpriteKind::Bullet { .. } => SpriteType::Bullet,
        }
    }

    pub fn as_player(&self) -> Option<&PlayerState> {
        match &self.kind {
            SpriteKind::Player(player) => Some(player),
            SpriteKind::Bullet { .. } => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut PlayerState> {
        match &mut self.kind {
            SpriteKind::Player(player) => Some(player),
            SpriteKind::Bullet { .. } => None,
        }
    }

    /// Wire descriptor, `actor` being whoever collided with this sprite
    pub fn descriptor(&self, actor: Option<u8>) -> SpriteDescriptor {
        let owner_id = match self.kind {
            SpriteKind::Bullet { owner_id, .. } => owner_id,
            SpriteKind::Player(_) => 0,
        };
        SpriteDescriptor {
            colliding_actor_id: actor.unwrap_or(0),
            owner_id,
            sprite_id: self.id,
            sprite_type: self.sprite_type() as u8,
        }
    }

    pub fn transform(&self) -> SpriteTransform {
        SpriteTransform {
            rotation: self.rotation,
            x: self.x,
            y: self.y,
            vel_x: self.dir_x * self.velocity,
            vel_y: self.dir_y * self.velocity,
        }
    }

    pub fn distance_to(&self, other: &Sprite) -> f32 {
        distance(self.x, self.y, other.x, other.y)
    }

    /// Move from `(x, y)` along the current direction for `delta` seconds,
    /// stopping each axis short of walls. A negative `delta` runs the motion
    /// backwards.
    pub fn move_and_collide(&self, map: &GameMap, delta: f32, x: f32, y: f32) -> Movement {
        let mut space = self.velocity * delta;
        let (mut dir_x, mut dir_y) = (self.dir_x, self.dir_y);
        if space < 0.0 {
            space = -space;
            dir_x = -dir_x;
            dir_y = -dir_y;
        }

        let sign_x = if dir_x < 0.0 { -1.0 } else { 1.0 };
        let sign_y = if dir_y < 0.0 { -1.0 } else { 1.0 };

        let mut v_dist = dir_y.abs() * space;
        let mut h_dist = dir_x.abs() * space;
        let mut collided = false;

        let v_dist_max = trace_ray(map, x, y, 0.0, sign_y);
        if v_dist_max < v_dist + self.radius {
            v_dist = v_dist_max - self.radius;
            collided = true;
        }

        let h_dist_max = trace_ray(map, x, y, sign_x, 0.0);
        if h_dist_max < h_dist + self.radius {
            h_dist = h_dist_max - self.radius;
            collided = true;
        }

        Movement {
            collided,
            x: x + sign_x * h_dist,
            y: y + sign_y * v_dist,
        }
    }

    /// Advance by one timestep, returning whether a wall was hit
    pub fn step(&mut self, map: &GameMap, delta: f32) -> bool {
        let movement = self.move_and_collide(map, delta, self.x, self.y);
        self.x = movement.x;
        self.y = movement.y;
        movement.collided
    }

    /// Derive direction and speed from the pressed keys, facing `rotation`
    pub fn set_motion(&mut self, keys: u32, rotation: f32) {
        let (dir_x, dir_y, velocity) = input_motion(keys, rotation);
        self.dir_x = dir_x;
        self.dir_y = dir_y;
        self.velocity = velocity;
    }
}

pub fn distance(ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    let dx = bx - ax;
    let dy = by - ay;
    (dx * dx + dy * dy).sqrt()
}

/// Low half of `keys` drives forward/back, high half strafes.
/// Returns `(dir_x, dir_y, speed)`.
pub fn input_motion(keys: u32, rotation: f32) -> (f32, f32, f32) {
    let axis = |half: u32| ((half & 0x00FF != 0) as i32 - (half & 0xFF00 != 0) as i32) as f32;
    let long_dir = axis(keys & 0xFFFF);
    let side_dir = axis(keys >> 16);

    let long_x = rotation.cos();
    let long_y = rotation.sin();
    let side_x = -long_y;
    let side_y = long_x;

    let mut dir_x = long_x * long_dir + side_x * side_dir;
    let mut dir_y = long_y * long_dir + side_y * side_dir;
    if long_dir != 0.0 && side_dir != 0.0 {
        dir_x *= FRAC_1_SQRT_2;
        dir_y *= FRAC_1_SQRT_2;
    }

    let velocity = if long_dir != 0.0 || side_dir != 0.0 {
        PLAYER_RUN_SPEED
    } else {
        0.0
    };
    (dir_x, dir_y, velocity)
}

/// Grid DDA from `(x, y)` along `(dir_x, dir_y)`. Returns the distance to the
/// near face of the first blocking cell, or to the last boundary crossed once
/// `COLL_DOF` cells have been walked. Starting inside a wall gives zero.
pub fn trace_ray(map: &GameMap, x: f32, y: f32, dir_x: f32, dir_y: f32) -> f32 {
    let mut cell_x = x.floor();
    let mut cell_y = y.floor();

    // ray length needed to cross one whole cell on each axis
    let delta_x = if dir_x == 0.0 { f32::INFINITY } else { (1.0 / dir_x).abs() };
    let delta_y = if dir_y == 0.0 { f32::INFINITY } else { (1.0 / dir_y).abs() };

    let mut side_x = match dir_x {
        d if d > 0.0 => (cell_x + 1.0 - x) * delta_x,
        d if d < 0.0 => (x - cell_x) * delta_x,
        _ => f32::INFINITY,
    };
    let mut side_y = match dir_y {
        d if d > 0.0 => (cell_y + 1.0 - y) * delta_y,
        d if d < 0.0 => (y - cell_y) * delta_y,
        _ => f32::INFINITY,
    };

    let step_x = if dir_x < 0.0 { -1.0 } else { 1.0 };
    let step_y = if dir_y < 0.0 { -1.0 } else { 1.0 };

    let mut last_step_x = None;
    for _ in 0..COLL_DOF {
        if map.test_block_at(cell_x, cell_y) {
            break;
        }
        if side_x < side_y {
            side_x += delta_x;
            cell_x += step_x;
            last_step_x = Some(true);
        } else {
            side_y += delta_y;
            cell_y += step_y;
            last_step_x = Some(false);
        }
    }

    match last_step_x {
        Some(true) => side_x - delta_x,
        Some(false) => side_y - delta_y,
        None => 0.0,
    }
}
