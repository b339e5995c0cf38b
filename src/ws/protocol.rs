//! Binary wire protocol for client-server communication
//!
//! Every frame is little-endian. Client frames start with a header word
//! (`type << 30 | sequence`) followed by the player token; server frames start
//! with a header word (`type << 29 | sequence`) that is stamped per recipient
//! when the frame leaves the connection.

use bytes::{BufMut, Bytes, BytesMut};

/// Magic value closing the connection handshake
pub const HANDSHAKE_MAGIC: u32 = 0xBADC_0FFE;
/// Handshake frame: player token, game id, magic
pub const HANDSHAKE_LEN: usize = 12;

/// Size of the header word on both directions
pub const HEADER_LEN: usize = 4;

const CLIENT_SEQUENCE_MASK: u32 = 0x3FFF_FFFF;
const SERVER_SEQUENCE_MASK: u32 = 0x1FFF_FFFF;

/// descriptor u32, rotation, position, velocity
pub const SPRITE_INIT_LEN: usize = 4 + 4 + 4 * 2 + 4 * 2;
/// sprite id, rotation, position, velocity
pub const SPRITE_UPDATE_LEN: usize = 1 + 4 + 4 * 2 + 4 * 2;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Out of bounds in packet: need {needed} bytes at offset {offset}, have {len}")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("Invalid client packet type: {0}")]
    InvalidClientType(u32),

    #[error("Invalid server packet type: {0}")]
    InvalidServerType(u32),

    #[error("Non-finite float in packet at offset {0}")]
    NonFinite(usize),

    #[error("Handshake frame has the wrong length ({0} bytes)")]
    ShortHandshake(usize),

    #[error("Handshake failed (invalid magic {got:#010x})")]
    BadMagic { got: u32 },
}

// ============================================================================
// Handshake
// ============================================================================

/// First frame of every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub player_token: u32,
    pub game_id: u32,
}

impl Handshake {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PacketError::ShortHandshake(data.len()));
        }
        let mut reader = PacketReader::new(data);
        let player_token = reader.pop_u32()?;
        let game_id = reader.pop_u32()?;
        let magic = reader.pop_u32()?;
        if magic != HANDSHAKE_MAGIC {
            return Err(PacketError::BadMagic { got: magic });
        }
        Ok(Self {
            player_token,
            game_id,
        })
    }
}

// ============================================================================
// Client -> server
// ============================================================================

/// Packet types sent by clients (2 header bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientPacketType {
    Ready = 0,
    Leave = 1,
    Update = 2,
    Fire = 3,
}

impl TryFrom<u32> for ClientPacketType {
    type Error = PacketError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Leave),
            2 => Ok(Self::Update),
            3 => Ok(Self::Fire),
            other => Err(PacketError::InvalidClientType(other)),
        }
    }
}

/// Flat little-endian reader over an inbound frame
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn ensure(&self, size: usize) -> Result<(), PacketError> {
        if self.offset + size > self.data.len() {
            return Err(PacketError::OutOfBounds {
                offset: self.offset,
                needed: size,
                len: self.data.len(),
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        self.ensure(N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        Ok(raw)
    }

    pub fn pop_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn pop_u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    pub fn pop_f32(&mut self) -> Result<f32, PacketError> {
        Ok(f32::from_le_bytes(self.take::<4>()?))
    }

    /// Like `pop_f32`, but NaN and infinities are an error
    pub fn pop_finite_f32(&mut self) -> Result<f32, PacketError> {
        let offset = self.offset;
        let value = self.pop_f32()?;
        if !value.is_finite() {
            return Err(PacketError::NonFinite(offset));
        }
        Ok(value)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Header common to every client frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeader {
    pub kind: ClientPacketType,
    pub sequence: u32,
    pub player_token: u32,
}

impl ClientHeader {
    /// Pop the header word and player token off the front of a frame
    pub fn pop(reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        let type_and_seq = reader.pop_u32()?;
        let kind = ClientPacketType::try_from((type_and_seq >> 30) & 3)?;
        let sequence = type_and_seq & CLIENT_SEQUENCE_MASK;
        let player_token = reader.pop_u32()?;
        Ok(Self {
            kind,
            sequence,
            player_token,
        })
    }
}

/// Decoded client packet payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientPacket {
    Ready { ready: bool },
    Leave,
    Update {
        keys: u32,
        rotation: f32,
        timestamp: f32,
        /// Position the client believes it had at `timestamp`, when sent
        position: Option<(f32, f32)>,
    },
    Fire,
}

impl ClientPacket {
    /// Decode the type-specific payload that follows the header
    pub fn pop(kind: ClientPacketType, reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        Ok(match kind {
            ClientPacketType::Ready => Self::Ready {
                ready: reader.pop_u8()? != 0,
            },
            ClientPacketType::Leave => Self::Leave,
            ClientPacketType::Update => {
                let keys = reader.pop_u32()?;
                let rotation = reader.pop_finite_f32()?;
                let timestamp = reader.pop_finite_f32()?;
                let position = if reader.remaining() >= 8 {
                    Some((reader.pop_finite_f32()?, reader.pop_finite_f32()?))
                } else {
                    None
                };
                Self::Update {
                    keys,
                    rotation,
                    timestamp,
                    position,
                }
            }
            ClientPacketType::Fire => Self::Fire,
        })
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Packet types sent by the server (3 header bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPacketType {
    Hello = 0,
    Update = 1,
    Create = 2,
    Destroy = 3,
    Wait = 4,
    Terminate = 5,
}

impl TryFrom<u32> for ServerPacketType {
    type Error = PacketError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Update),
            2 => Ok(Self::Create),
            3 => Ok(Self::Destroy),
            4 => Ok(Self::Wait),
            5 => Ok(Self::Terminate),
            other => Err(PacketError::InvalidServerType(other)),
        }
    }
}

/// Packed `(actor << 24) | (owner << 16) | (id << 8) | type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpriteDescriptor {
    pub colliding_actor_id: u8,
    pub owner_id: u8,
    pub sprite_id: u8,
    pub sprite_type: u8,
}

impl SpriteDescriptor {
    pub fn pack(self) -> u32 {
        (self.colliding_actor_id as u32) << 24
            | (self.owner_id as u32) << 16
            | (self.sprite_id as u32) << 8
            | self.sprite_type as u32
    }

    #[cfg(test)]
    pub fn unpack(word: u32) -> Self {
        Self {
            colliding_actor_id: (word >> 24) as u8,
            owner_id: (word >> 16) as u8,
            sprite_id: (word >> 8) as u8,
            sprite_type: word as u8,
        }
    }
}

/// Rotation, position and velocity vector of a sprite
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpriteTransform {
    pub rotation: f32,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
}

/// A serialized server frame whose header is written per recipient
#[derive(Debug, Clone)]
pub struct ServerPacket {
    kind: ServerPacketType,
    bytes: BytesMut,
}

impl ServerPacket {
    fn new(kind: ServerPacketType, extra_size: usize) -> Self {
        let mut bytes = BytesMut::with_capacity(HEADER_LEN + extra_size);
        bytes.put_u32_le(0);
        Self { kind, bytes }
    }

    pub fn kind(&self) -> ServerPacketType {
        self.kind
    }

    /// Frame length including header
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Serialize with the recipient's sequence number in the header
    pub fn to_frame(&self, sequence: u32) -> Bytes {
        let header = (self.kind as u32 & 7) << 29 | (sequence & SERVER_SEQUENCE_MASK);
        let mut frame = self.bytes.clone();
        frame[..HEADER_LEN].copy_from_slice(&header.to_le_bytes());
        frame.freeze()
    }

    fn push_u8(&mut self, value: u8) {
        self.bytes.put_u8(value);
    }

    fn push_u32(&mut self, value: u32) {
        self.bytes.put_u32_le(value);
    }

    fn push_f32(&mut self, value: f32) {
        self.bytes.put_f32_le(value);
    }

    fn push_bytes(&mut self, value: &[u8]) {
        self.bytes.put_slice(value);
    }

    fn push_transform(&mut self, transform: &SpriteTransform) {
        self.push_f32(transform.rotation);
        self.push_f32(transform.x);
        self.push_f32(transform.y);
        self.push_f32(transform.vel_x);
        self.push_f32(transform.vel_y);
    }

    fn push_sprite_init(&mut self, descriptor: SpriteDescriptor, transform: &SpriteTransform) {
        self.push_u32(descriptor.pack());
        self.push_transform(transform);
    }

    /// Initial state sent to a player after it spawns
    pub fn hello(
        your_sprite_id: u8,
        map_width: u32,
        map_height: u32,
        sprites: &[(SpriteDescriptor, SpriteTransform)],
        compressed_map: &[u8],
    ) -> Self {
        let size = 1 + 1 + 4 * 2 + sprites.len() * SPRITE_INIT_LEN + compressed_map.len();
        let mut packet = Self::new(ServerPacketType::Hello, size);
        packet.push_u8(sprites.len() as u8);
        packet.push_u8(your_sprite_id);
        packet.push_u32(map_width);
        packet.push_u32(map_height);
        for (descriptor, transform) in sprites {
            packet.push_sprite_init(*descriptor, transform);
        }
        packet.push_bytes(compressed_map);
        packet
    }

    pub fn update(timestamp: f32, sprite_id: u8, transform: &SpriteTransform) -> Self {
        let mut packet = Self::new(ServerPacketType::Update, 4 + SPRITE_UPDATE_LEN);
        packet.push_f32(timestamp);
        packet.push_u8(sprite_id);
        packet.push_transform(transform);
        packet
    }

    pub fn create(descriptor: SpriteDescriptor, transform: &SpriteTransform) -> Self {
        let mut packet = Self::new(ServerPacketType::Create, SPRITE_INIT_LEN);
        packet.push_sprite_init(descriptor, transform);
        packet
    }

    pub fn destroy(descriptor: SpriteDescriptor) -> Self {
        let mut packet = Self::new(ServerPacketType::Destroy, 4);
        packet.push_u32(descriptor.pack());
        packet
    }

    /// Lobby countdown: bit 31 is the waiting flag, the rest whole seconds left
    pub fn wait(is_waiting: bool, seconds_remaining: f32) -> Self {
        let time_left = (seconds_remaining.max(0.0).floor() as u32) & 0x7FFF_FFFF;
        let mut packet = Self::new(ServerPacketType::Wait, 4);
        packet.push_u32(time_left | (is_waiting as u32) << 31);
        packet
    }

    pub fn terminate() -> Self {
        Self::new(ServerPacketType::Terminate, 0)
    }
}

/// Split a server frame into its type, sequence and payload
#[cfg(test)]
pub fn split_server_frame(frame: &[u8]) -> Result<(ServerPacketType, u32, &[u8]), PacketError> {
    let mut reader = PacketReader::new(frame);
    let header = reader.pop_u32()?;
    let kind = ServerPacketType::try_from(header >> 29)?;
    Ok((kind, header & SERVER_SEQUENCE_MASK, &frame[HEADER_LEN..]))
}

/// Build a client frame the way a game client does
#[cfg(test)]
pub fn encode_client_frame(
    kind: ClientPacketType,
    sequence: u32,
    player_token: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    let header = (kind as u32) << 30 | (sequence & CLIENT_SEQUENCE_MASK);
    frame.extend_from_slice(&header.to_le_bytes());
    frame.extend_from_slice(&player_token.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn handshake_requires_magic() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        frame.extend_from_slice(&0x1234u32.to_le_bytes());
        frame.extend_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());

        let handshake = assert_ok!(Handshake::parse(&frame));
        assert_eq!(handshake.player_token, 0xDEAD_BEEF);
        assert_eq!(handshake.game_id, 0x1234);

        frame[8] ^= 0xFF;
        assert!(matches!(
            Handshake::parse(&frame),
            Err(PacketError::BadMagic { .. })
        ));
        assert_eq!(
            Handshake::parse(&frame[..8]),
            Err(PacketError::ShortHandshake(8))
        );
    }

    #[test]
    fn client_header_splits_type_and_sequence() {
        let frame = encode_client_frame(ClientPacketType::Update, 0x3FFF_FFFE, 77, &[]);
        let mut reader = PacketReader::new(&frame);
        let header = assert_ok!(ClientHeader::pop(&mut reader));
        assert_eq!(header.kind, ClientPacketType::Update);
        assert_eq!(header.sequence, 0x3FFF_FFFE);
        assert_eq!(header.player_token, 77);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn update_payload_decodes_in_order() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x0001_0001u32.to_le_bytes());
        payload.extend_from_slice(&1.5f32.to_le_bytes());
        payload.extend_from_slice(&12.25f32.to_le_bytes());
        let mut reader = PacketReader::new(&payload);

        let packet = assert_ok!(ClientPacket::pop(ClientPacketType::Update, &mut reader));
        assert_eq!(
            packet,
            ClientPacket::Update {
                keys: 0x0001_0001,
                rotation: 1.5,
                timestamp: 12.25,
                position: None,
            }
        );

        payload.extend_from_slice(&5.5f32.to_le_bytes());
        payload.extend_from_slice(&6.0f32.to_le_bytes());
        let mut reader = PacketReader::new(&payload);
        match assert_ok!(ClientPacket::pop(ClientPacketType::Update, &mut reader)) {
            ClientPacket::Update { position, .. } => assert_eq!(position, Some((5.5, 6.0))),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn update_rejects_non_finite_floats() {
        let update = |rotation: f32, x: f32| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&rotation.to_le_bytes());
            payload.extend_from_slice(&1.0f32.to_le_bytes());
            payload.extend_from_slice(&x.to_le_bytes());
            payload.extend_from_slice(&2.0f32.to_le_bytes());
            payload
        };

        let payload = update(f32::NAN, 2.0);
        let mut reader = PacketReader::new(&payload);
        assert_eq!(
            ClientPacket::pop(ClientPacketType::Update, &mut reader),
            Err(PacketError::NonFinite(4))
        );

        let payload = update(0.0, f32::INFINITY);
        let mut reader = PacketReader::new(&payload);
        assert_eq!(
            ClientPacket::pop(ClientPacketType::Update, &mut reader),
            Err(PacketError::NonFinite(12))
        );
    }

    #[test]
    fn truncated_payload_is_out_of_bounds() {
        let payload = [0u8; 6];
        let mut reader = PacketReader::new(&payload);
        let err = assert_err!(ClientPacket::pop(ClientPacketType::Update, &mut reader));
        assert_eq!(
            err,
            PacketError::OutOfBounds {
                offset: 4,
                needed: 4,
                len: 6
            }
        );

        let mut empty = PacketReader::new(&[]);
        assert_err!(ClientPacket::pop(ClientPacketType::Ready, &mut empty));
    }

    #[test]
    fn server_header_is_stamped_per_frame() {
        let packet = ServerPacket::terminate();
        let first = packet.to_frame(3);
        let second = packet.to_frame(4);
        assert_eq!(first.len(), HEADER_LEN);

        let (kind, seq, payload) = assert_ok!(split_server_frame(&first));
        assert_eq!(kind, ServerPacketType::Terminate);
        assert_eq!(seq, 3);
        assert!(payload.is_empty());
        assert_eq!(u32::from_le_bytes([first[0], first[1], first[2], first[3]]), 5 << 29 | 3);
        assert_eq!(assert_ok!(split_server_frame(&second)).1, 4);
    }

    #[test]
    fn descriptor_packs_bytes_high_to_low() {
        let descriptor = SpriteDescriptor {
            colliding_actor_id: 2,
            owner_id: 3,
            sprite_id: 7,
            sprite_type: 1,
        };
        assert_eq!(descriptor.pack(), 0x0203_0701);
        assert_eq!(SpriteDescriptor::unpack(0x0203_0701), descriptor);
    }

    #[test]
    fn wait_packet_sets_flag_and_whole_seconds() {
        let frame = ServerPacket::wait(true, 9.7).to_frame(0);
        let (kind, _, payload) = assert_ok!(split_server_frame(&frame));
        assert_eq!(kind, ServerPacketType::Wait);
        let word = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(word, 1 << 31 | 9);

        let frame = ServerPacket::wait(false, -0.2).to_frame(0);
        assert_eq!(&frame[HEADER_LEN..], &0u32.to_le_bytes());
    }

    #[test]
    fn hello_layout_matches_sizes() {
        let sprite = (
            SpriteDescriptor {
                sprite_id: 1,
                ..Default::default()
            },
            SpriteTransform {
                rotation: 0.5,
                x: 1.5,
                y: 2.5,
                vel_x: 0.0,
                vel_y: 0.0,
            },
        );
        let map = [0xFFu8; 8];
        let packet = ServerPacket::hello(1, 8, 8, &[sprite], &map);
        assert_eq!(packet.len(), HEADER_LEN + 1 + 1 + 8 + SPRITE_INIT_LEN + map.len());

        let frame = packet.to_frame(0);
        let mut reader = PacketReader::new(&frame[HEADER_LEN..]);
        assert_eq!(reader.pop_u8(), Ok(1));
        assert_eq!(reader.pop_u8(), Ok(1));
        assert_eq!(reader.pop_u32(), Ok(8));
        assert_eq!(reader.pop_u32(), Ok(8));
        assert_eq!(reader.pop_u32(), Ok(0x0000_0100));
        assert_eq!(reader.pop_f32(), Ok(0.5));
        assert_eq!(reader.pop_f32(), Ok(1.5));
        assert_eq!(reader.pop_f32(), Ok(2.5));
    }
}
