//! Tile map shared read-only by every match that plays on it

use std::f32::consts::PI;
use std::sync::OnceLock;

/// Editor maps are always this many cells on each side
pub const EDITOR_MAP_SIZE: u32 = 32;
/// Editor maps carry exactly this many spawn slots
pub const EDITOR_SPAWN_COUNT: usize = 4;

const EDITOR_INTERIOR: u32 = EDITOR_MAP_SIZE - 2;
const ROTATION_CODES: f32 = 64.0;

/// Map construction and storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("Trying to create map of size {width}x{height} with {tiles} tiles")]
    SizeMismatch { width: u32, height: u32, tiles: usize },

    #[error("Stored map blob must be {expected} bytes, got {got}")]
    BadBlobLength { expected: usize, got: usize },

    #[error("Only 32x32 maps can be stored, got {width}x{height}")]
    NotEditorSized { width: u32, height: u32 },

    #[error("Stored maps need exactly 4 spawn slots, got {0}")]
    SpawnCount(usize),

    #[error("Spawn slot at ({x}, {y}) is not an interior cell")]
    SpawnOutOfRange { x: u32, y: u32 },

    #[error("Border tile ({x}, {y}) must be a wall")]
    OpenBorder { x: u32, y: u32 },
}

/// A spawn slot: cell center plus facing rotation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnPosition {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    cell_x: u32,
    cell_y: u32,
    rotation_code: u8,
}

impl SpawnPosition {
    /// Build from a grid cell and a 6-bit rotation code (64 steps per turn)
    pub fn from_cell(cell_x: u32, cell_y: u32, rotation_code: u8) -> Self {
        let rotation_code = rotation_code & 0x3F;
        let degrees = rotation_code as f32 * 360.0 / ROTATION_CODES;
        Self {
            x: cell_x as f32 + 0.5,
            y: cell_y as f32 + 0.5,
            rotation: -degrees * PI / 180.0,
            cell_x,
            cell_y,
            rotation_code,
        }
    }

    fn pack(&self) -> u16 {
        (self.cell_x as u16 & 0x1F) | (self.cell_y as u16 & 0x1F) << 5 | (self.rotation_code as u16) << 10
    }

    fn unpack(word: u16) -> Self {
        Self::from_cell(
            (word & 0x1F) as u32,
            ((word >> 5) & 0x1F) as u32,
            (word >> 10) as u8,
        )
    }
}

/// Immutable tile grid, 1 = wall
#[derive(Debug)]
pub struct GameMap {
    width: u32,
    height: u32,
    tiles: Vec<u8>,
    spawns: Vec<SpawnPosition>,
    compressed: OnceLock<Vec<u8>>,
}

impl GameMap {
    pub fn new(
        width: u32,
        height: u32,
        tiles: Vec<u8>,
        spawns: Vec<SpawnPosition>,
    ) -> Result<Self, MapError> {
        if (width as usize) * (height as usize) != tiles.len() {
            return Err(MapError::SizeMismatch {
                width,
                height,
                tiles: tiles.len(),
            });
        }
        Ok(Self {
            width,
            height,
            tiles,
            spawns,
            compressed: OnceLock::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.len()
    }

    /// Whether the cell containing `(x, y)` blocks movement.
    /// Anything outside the grid counts as a wall.
    pub fn test_block_at(&self, x: f32, y: f32) -> bool {
        let x = x.floor();
        let y = y.floor();
        if x < 0.0 || y < 0.0 || x >= self.width as f32 || y >= self.height as f32 {
            return true;
        }
        self.tile(x as u32, y as u32)
    }

    fn tile(&self, x: u32, y: u32) -> bool {
        self.tiles[(x + y * self.width) as usize] & 1 != 0
    }

    /// One bit per tile, eight tiles per byte, LSB first. Computed once.
    pub fn compressed_data(&self) -> &[u8] {
        self.compressed.get_or_init(|| pack_bits(self.tiles.iter().map(|t| t & 1 != 0)))
    }

    /// Spawn slot for the next player given how many are already in the match.
    /// `None` once every slot is taken.
    pub fn spawn_position_for_player(&self, current_players: usize) -> Option<SpawnPosition> {
        if current_players >= self.spawns.len() {
            return None;
        }
        Some(self.spawns[current_players % self.spawns.len()])
    }

    /// Encode into the editor storage format: four packed spawn words followed
    /// by the interior wall bitmap. The border ring is implied.
    pub fn to_storage(&self) -> Result<Vec<u8>, MapError> {
        if self.width != EDITOR_MAP_SIZE || self.height != EDITOR_MAP_SIZE {
            return Err(MapError::NotEditorSized {
                width: self.width,
                height: self.height,
            });
        }
        if self.spawns.len() != EDITOR_SPAWN_COUNT {
            return Err(MapError::SpawnCount(self.spawns.len()));
        }
        for spawn in &self.spawns {
            if !is_interior(spawn.cell_x) || !is_interior(spawn.cell_y) {
                return Err(MapError::SpawnOutOfRange {
                    x: spawn.cell_x,
                    y: spawn.cell_y,
                });
            }
        }
        for y in 0..self.height {
            for x in 0..self.width {
                if (!is_interior(x) || !is_interior(y)) && !self.tile(x, y) {
                    return Err(MapError::OpenBorder { x, y });
                }
            }
        }

        let mut blob = Vec::with_capacity(storage_len());
        for spawn in &self.spawns {
            blob.extend_from_slice(&spawn.pack().to_le_bytes());
        }
        let interior = (1..=EDITOR_INTERIOR)
            .flat_map(|y| (1..=EDITOR_INTERIOR).map(move |x| (x, y)))
            .map(|(x, y)| self.tile(x, y));
        blob.extend(pack_bits(interior));
        Ok(blob)
    }

    /// Decode a blob produced by `to_storage`
    pub fn from_storage(blob: &[u8]) -> Result<Self, MapError> {
        if blob.len() != storage_len() {
            return Err(MapError::BadBlobLength {
                expected: storage_len(),
                got: blob.len(),
            });
        }
        let spawns = blob[..EDITOR_SPAWN_COUNT * 2]
            .chunks_exact(2)
            .map(|word| SpawnPosition::unpack(u16::from_le_bytes([word[0], word[1]])))
            .collect::<Vec<_>>();
        for spawn in &spawns {
            if !is_interior(spawn.cell_x) || !is_interior(spawn.cell_y) {
                return Err(MapError::SpawnOutOfRange {
                    x: spawn.cell_x,
                    y: spawn.cell_y,
                });
            }
        }

        let bits = &blob[EDITOR_SPAWN_COUNT * 2..];
        let size = EDITOR_MAP_SIZE;
        let mut tiles = vec![1u8; (size * size) as usize];
        for y in 1..=EDITOR_INTERIOR {
            for x in 1..=EDITOR_INTERIOR {
                let bit = ((y - 1) * EDITOR_INTERIOR + (x - 1)) as usize;
                tiles[(x + y * size) as usize] = (bits[bit >> 3] >> (bit & 7)) & 1;
            }
        }
        Self::new(size, size, tiles, spawns)
    }
}

fn is_interior(cell: u32) -> bool {
    (1..=EDITOR_INTERIOR).contains(&cell)
}

fn storage_len() -> usize {
    EDITOR_SPAWN_COUNT * 2 + ((EDITOR_INTERIOR * EDITOR_INTERIOR) as usize + 7) / 8
}

fn pack_bits(bits: impl Iterator<Item = bool>) -> Vec<u8> {
    let mut packed = Vec::new();
    for (index, bit) in bits.enumerate() {
        if index & 7 == 0 {
            packed.push(0);
        }
        if bit {
            packed[index >> 3] |= 1 << (index & 7);
        }
    }
    packed
}

/// Small 8x8 test arena with a spawn slot in each room
pub fn test_arena() -> Result<GameMap, MapError> {
    #[rustfmt::skip]
    let tiles = vec![
        1, 1, 1, 1, 1, 1, 1, 1,
        1, 0, 0, 0, 1, 0, 0, 1,
        1, 0, 0, 0, 1, 0, 0, 1,
        1, 0, 0, 0, 1, 0, 0, 1,
        1, 0, 1, 1, 1, 1, 0, 1,
        1, 0, 0, 0, 0, 0, 0, 1,
        1, 0, 0, 0, 0, 0, 0, 1,
        1, 1, 1, 1, 1, 1, 1, 1,
    ];
    let spawns = vec![
        SpawnPosition::from_cell(1, 1, 56),
        SpawnPosition::from_cell(6, 6, 24),
        SpawnPosition::from_cell(6, 1, 40),
        SpawnPosition::from_cell(1, 6, 8),
    ];
    GameMap::new(8, 8, tiles, spawns)
}

/// Open 32x32 editor-sized arena with a pillar in each quadrant
pub fn open_arena() -> Result<GameMap, MapError> {
    let size = EDITOR_MAP_SIZE;
    let mut tiles = vec![0u8; (size * size) as usize];
    for y in 0..size {
        for x in 0..size {
            let border = x == 0 || y == 0 || x == size - 1 || y == size - 1;
            let pillar = [8, 23].contains(&x) && [8, 23].contains(&y);
            if border || pillar {
                tiles[(x + y * size) as usize] = 1;
            }
        }
    }
    let spawns = vec![
        SpawnPosition::from_cell(2, 2, 56),
        SpawnPosition::from_cell(29, 29, 24),
        SpawnPosition::from_cell(29, 2, 40),
        SpawnPosition::from_cell(2, 29, 8),
    ];
    GameMap::new(size, size, tiles, spawns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn new_rejects_mismatched_tiles() {
        let err = GameMap::new(3, 3, vec![0; 8], Vec::new()).unwrap_err();
        assert_eq!(
            err,
            MapError::SizeMismatch {
                width: 3,
                height: 3,
                tiles: 8
            }
        );
    }

    #[test]
    fn outside_the_grid_is_blocked() {
        let map = assert_ok!(GameMap::new(2, 2, vec![0; 4], Vec::new()));
        assert!(!map.test_block_at(0.0, 0.0));
        assert!(!map.test_block_at(1.99, 1.99));
        assert!(map.test_block_at(-0.01, 0.5));
        assert!(map.test_block_at(0.5, -0.5));
        assert!(map.test_block_at(2.0, 0.5));
        assert!(map.test_block_at(0.5, 2.0));
    }

    #[test]
    fn compressed_data_is_lsb_first_and_cached() {
        let tiles = vec![1, 0, 0, 1, 0, 0, 0, 0, 1, 1];
        let map = assert_ok!(GameMap::new(5, 2, tiles, Vec::new()));
        let first = map.compressed_data().to_vec();
        assert_eq!(first, vec![0b0000_1001, 0b0000_0011]);
        assert_eq!(map.compressed_data(), first.as_slice());
        assert!(std::ptr::eq(map.compressed_data(), map.compressed_data()));
    }

    #[test]
    fn spawn_slots_run_out() {
        let map = test_arena().unwrap();
        let first = map.spawn_position_for_player(0).unwrap();
        assert_eq!((first.x, first.y), (1.5, 1.5));
        assert!(map.spawn_position_for_player(3).is_some());
        assert!(map.spawn_position_for_player(4).is_none());
    }

    #[test]
    fn rotation_code_maps_to_negated_radians() {
        let spawn = SpawnPosition::from_cell(3, 4, 16);
        assert!((spawn.rotation + PI / 2.0).abs() < 1e-6);
        assert_eq!(SpawnPosition::unpack(spawn.pack()), spawn);
    }

    #[test]
    fn storage_round_trip_random_layouts() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let size = EDITOR_MAP_SIZE;
        for seed in 0..16u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut tiles = vec![1u8; (size * size) as usize];
            for y in 1..=EDITOR_INTERIOR {
                for x in 1..=EDITOR_INTERIOR {
                    tiles[(x + y * size) as usize] = rng.gen_bool(0.3) as u8;
                }
            }
            let spawns = vec![
                SpawnPosition::from_cell(1, 1, 0),
                SpawnPosition::from_cell(30, 30, 63),
                SpawnPosition::from_cell(30, 1, rng.gen_range(0..64)),
                SpawnPosition::from_cell(1, 30, rng.gen_range(0..64)),
            ];
            let map = assert_ok!(GameMap::new(size, size, tiles, spawns));

            let decoded = assert_ok!(GameMap::from_storage(&assert_ok!(map.to_storage())));
            assert_eq!(decoded.compressed_data(), map.compressed_data(), "seed {}", seed);
            for slot in 0..EDITOR_SPAWN_COUNT {
                assert_eq!(
                    decoded.spawn_position_for_player(slot),
                    map.spawn_position_for_player(slot),
                    "seed {} slot {}",
                    seed,
                    slot
                );
            }
        }
    }

    #[test]
    fn storage_round_trip_preserves_walls() {
        let map = open_arena().unwrap();
        let blob = assert_ok!(map.to_storage());
        assert_eq!(blob.len(), 8 + 113);

        let decoded = assert_ok!(GameMap::from_storage(&blob));
        for y in -1..=32 {
            for x in -1..=32 {
                let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
                assert_eq!(decoded.test_block_at(fx, fy), map.test_block_at(fx, fy));
            }
        }
        for slot in 0..EDITOR_SPAWN_COUNT {
            assert_eq!(
                decoded.spawn_position_for_player(slot),
                map.spawn_position_for_player(slot)
            );
        }
    }

    #[test]
    fn storage_rejects_non_editor_maps() {
        assert_eq!(
            test_arena().unwrap().to_storage(),
            Err(MapError::NotEditorSized {
                width: 8,
                height: 8
            })
        );
        assert!(matches!(
            GameMap::from_storage(&[0; 10]),
            Err(MapError::BadBlobLength { .. })
        ));

        let size = EDITOR_MAP_SIZE;
        let open = assert_ok!(GameMap::new(
            size,
            size,
            vec![0; (size * size) as usize],
            open_arena().unwrap().spawns.clone(),
        ));
        assert_eq!(open.to_storage(), Err(MapError::OpenBorder { x: 0, y: 0 }));
    }
}
