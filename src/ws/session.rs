//! Per-connection protocol state

use bytes::Bytes;

use crate::game::broadcast::PeerId;

use super::protocol::{ClientHeader, ClientPacket, Handshake, PacketError, PacketReader, ServerPacket};

/// Largest forward jump in client sequence numbers still accepted
pub const MAX_PACKET_DROP: u32 = 10;

/// Why an inbound frame was dropped
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("Expected sequence number {expected}, got {got}")]
    Sequence { expected: u32, got: u32 },

    #[error("Invalid player token, got {got:08x} expected {expected:08x}")]
    TokenMismatch { expected: u32, got: u32 },
}

/// Inbound side of a connection bound to one token and match
#[derive(Debug)]
pub struct ClientSession {
    peer_id: PeerId,
    player_token: u32,
    game_id: u32,
    client_sequence: u32,
}

impl ClientSession {
    pub fn new(handshake: Handshake, peer_id: PeerId) -> Self {
        Self {
            peer_id,
            player_token: handshake.player_token,
            game_id: handshake.game_id,
            client_sequence: 0,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn player_token(&self) -> u32 {
        self.player_token
    }

    pub fn game_id(&self) -> u32 {
        self.game_id
    }

    /// Validate a frame's header and decode its payload. The sequence
    /// advances as soon as it is accepted, even if a later check fails.
    pub fn accept_frame(&mut self, frame: &[u8]) -> Result<ClientPacket, SessionError> {
        let mut reader = PacketReader::new(frame);
        let header = ClientHeader::pop(&mut reader)?;

        let expected = self.client_sequence;
        let sequence = header.sequence;
        if sequence >= expected && sequence - expected < MAX_PACKET_DROP {
            self.client_sequence = sequence + 1;
        } else {
            return Err(SessionError::Sequence {
                expected,
                got: sequence,
            });
        }

        if header.player_token != self.player_token {
            return Err(SessionError::TokenMismatch {
                expected: self.player_token,
                got: header.player_token,
            });
        }

        Ok(ClientPacket::pop(header.kind, &mut reader)?)
    }
}

/// Outbound sequence counter owned by a connection's writer
#[derive(Debug, Default)]
pub struct ServerSequence {
    next: u32,
}

impl ServerSequence {
    /// Serialize `packet` with the next sequence number
    pub fn stamp(&mut self, packet: &ServerPacket) -> Bytes {
        let frame = packet.to_frame(self.next);
        self.next = self.next.wrapping_add(1);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::{encode_client_frame, split_server_frame, ClientPacketType};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn session() -> ClientSession {
        let handshake = Handshake {
            player_token: 0xFEED,
            game_id: 9,
        };
        ClientSession::new(handshake, Uuid::new_v4())
    }

    fn fire(sequence: u32, token: u32) -> Vec<u8> {
        encode_client_frame(ClientPacketType::Fire, sequence, token, &[])
    }

    #[test]
    fn sequence_window_allows_gaps_below_limit() {
        let mut session = session();
        assert_eq!(assert_ok!(session.accept_frame(&fire(0, 0xFEED))), ClientPacket::Fire);
        assert_ok!(session.accept_frame(&fire(9, 0xFEED)));
        assert_eq!(session.client_sequence, 10);

        let err = assert_err!(session.accept_frame(&fire(20, 0xFEED)));
        assert_eq!(err, SessionError::Sequence { expected: 10, got: 20 });
    }

    #[test]
    fn stale_and_duplicate_sequences_are_dropped() {
        let mut session = session();
        assert_ok!(session.accept_frame(&fire(3, 0xFEED)));
        assert_err!(session.accept_frame(&fire(3, 0xFEED)));
        assert_err!(session.accept_frame(&fire(1, 0xFEED)));
        assert_ok!(session.accept_frame(&fire(4, 0xFEED)));
    }

    #[test]
    fn token_mismatch_still_consumes_sequence() {
        let mut session = session();
        let err = assert_err!(session.accept_frame(&fire(0, 0xBAD)));
        assert!(matches!(err, SessionError::TokenMismatch { got: 0xBAD, .. }));
        assert_eq!(session.client_sequence, 1);
    }

    #[test]
    fn malformed_payload_is_reported() {
        let mut session = session();
        let frame = encode_client_frame(ClientPacketType::Ready, 0, 0xFEED, &[]);
        assert!(matches!(
            session.accept_frame(&frame),
            Err(SessionError::Packet(PacketError::OutOfBounds { .. }))
        ));
        assert!(matches!(
            session.accept_frame(&[1, 2]),
            Err(SessionError::Packet(_))
        ));
    }

    #[test]
    fn server_sequence_increments_per_frame() {
        let mut sequence = ServerSequence::default();
        let packet = ServerPacket::terminate();
        assert_eq!(split_server_frame(&sequence.stamp(&packet)).unwrap().1, 0);
        assert_eq!(split_server_frame(&sequence.stamp(&packet)).unwrap().1, 1);
    }
}
