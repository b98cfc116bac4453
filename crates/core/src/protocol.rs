//! Wire protocol: packet/message framing, sequence arithmetic, and the
//! fixed-layout entity/input records that ride inside `Input` and `Snapshot`
//! messages (§3, §4.3, §6.1).

use bitflags::bitflags;
use glam::Vec3;

use crate::bitio::{BitReader, BitWriter};

/// One datagram must never exceed this many bytes, header included (§4.2).
pub const MTU: usize = 1400;
pub const PACKET_HEADER_BYTES: usize = 8;
pub const MESSAGE_HEADER_BITS: u32 = 16;
pub const MESSAGE_TYPE_BITS: u32 = 4;
pub const MESSAGE_LENGTH_BITS: u32 = 12;

pub const MAX_ENTITIES: usize = 256;
pub const HISTORY: usize = 64;
pub const TICK_RATE_HZ: f64 = 128.0;

pub const MAX_MAP_NAME_LEN: usize = 127;
pub const MAX_INPUT_RECORDS: usize = 3;

/// Position fixed-point scale, units per LSB. The spec's in-tree source
/// carries two competing scales (0.125 and 0.5); this implementation fixes
/// 0.5 uniformly (see DESIGN.md).
pub const POSITION_SCALE: f32 = 0.5;
/// Angle fixed-point scale: one `u16` LSB is `360 / 65536` degrees.
pub const ANGLE_SCALE: f32 = 360.0 / 65536.0;

/// `(a - b) mod 2^16` interpreted as `i16` is positive: a strict partial
/// order on the 16-bit circular sequence domain (§4.3, §8).
pub fn sequence_more_recent(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub sequence: u16,
    pub ack: u16,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_u16(self.sequence);
        writer.write_u16(self.ack);
        writer.write_u32(self.ack_bitfield);
    }

    pub fn read(reader: &mut BitReader) -> Self {
        Self {
            sequence: reader.read_u16(),
            ack: reader.read_u16(),
            ack_bitfield: reader.read_u32(),
        }
    }
}

/// Tracks the receive side of the ack-bitfield protocol for one peer
/// (§4.3). Both a server's per-slot state and a client's single peer state
/// hold one of these.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckTracker {
    pub incoming_sequence: u16,
    pub ack_bitfield: u32,
    has_received: bool,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a newly-received `remote_seq` into the bitfield per §4.3.
    pub fn on_receive(&mut self, remote_seq: u16) {
        if !self.has_received {
            self.incoming_sequence = remote_seq;
            self.has_received = true;
            return;
        }

        if sequence_more_recent(remote_seq, self.incoming_sequence) {
            let diff = remote_seq.wrapping_sub(self.incoming_sequence);
            if diff <= 32 {
                self.ack_bitfield = if diff == 32 {
                    0
                } else {
                    self.ack_bitfield << diff
                };
                self.ack_bitfield |= 1 << (diff - 1);
            } else {
                self.ack_bitfield = 0;
            }
            self.incoming_sequence = remote_seq;
        } else {
            let diff = self.incoming_sequence.wrapping_sub(remote_seq);
            if diff > 0 && diff <= 32 {
                self.ack_bitfield |= 1 << (diff - 1);
            }
            // diff == 0 (duplicate of current) or diff > 32 (too old): drop.
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Nop = 0,
    Input = 1,
    Snapshot = 2,
    Command = 3,
    ClockSync = 4,
    Disconnect = 5,
    ConnectRequest = 6,
    ConnectChallenge = 7,
    ConnectResponse = 8,
    ConnectAccepted = 9,
    ConnectRejected = 10,
    // Not fixed by the spec beyond "implementation-defined but stable per
    // deployment"; this deployment fixes them at 11 and 12 (DESIGN.md).
    MapLoaded = 11,
    MapConfirmed = 12,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Nop,
            1 => Self::Input,
            2 => Self::Snapshot,
            3 => Self::Command,
            4 => Self::ClockSync,
            5 => Self::Disconnect,
            6 => Self::ConnectRequest,
            7 => Self::ConnectChallenge,
            8 => Self::ConnectResponse,
            9 => Self::ConnectAccepted,
            10 => Self::ConnectRejected,
            11 => Self::MapLoaded,
            12 => Self::MapConfirmed,
            _ => return None,
        })
    }
}

pub struct MessageHeader {
    pub message_type: u8,
    pub length: u16,
}

impl MessageHeader {
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_bits(self.message_type as u32, MESSAGE_TYPE_BITS);
        writer.write_bits(self.length as u32, MESSAGE_LENGTH_BITS);
    }

    pub fn read(reader: &mut BitReader) -> Self {
        let message_type = reader.read_bits(MESSAGE_TYPE_BITS) as u8;
        let length = reader.read_bits(MESSAGE_LENGTH_BITS) as u16;
        Self {
            message_type,
            length,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntityFlags: u8 {
        const ON_GROUND = 1 << 0;
        const JUMP_HELD = 1 << 1;
        const TELEPORTED = 1 << 2;
        const FIRING = 1 << 3;
    }
}

/// The 22-byte on-wire entity record (§3). Positions/velocities/angles are
/// kept in their fixed-point wire representation; decode to float only at
/// the gameplay/interpolation boundary (§6.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    pub position: [i16; 3],
    pub velocity: [i16; 3],
    pub yaw: u16,
    pub pitch: u16,
    pub entity_type: u8,
    pub flags: EntityFlags,
    pub health: u8,
    pub armor: u8,
    pub weapon: u8,
    pub ammo: u8,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            position: [0; 3],
            velocity: [0; 3],
            yaw: 0,
            pitch: 0,
            entity_type: 0,
            flags: EntityFlags::empty(),
            health: 0,
            armor: 0,
            weapon: 0,
            ammo: 0,
        }
    }
}

impl EntityState {
    pub const WIRE_BYTES: usize = 22;

    pub fn encode_position(position: Vec3) -> [i16; 3] {
        [
            quantize(position.x, POSITION_SCALE),
            quantize(position.y, POSITION_SCALE),
            quantize(position.z, POSITION_SCALE),
        ]
    }

    pub fn decode_position(&self) -> Vec3 {
        Vec3::new(
            self.position[0] as f32 * POSITION_SCALE,
            self.position[1] as f32 * POSITION_SCALE,
            self.position[2] as f32 * POSITION_SCALE,
        )
    }

    pub fn encode_velocity(velocity: Vec3) -> [i16; 3] {
        [
            quantize(velocity.x, 1.0),
            quantize(velocity.y, 1.0),
            quantize(velocity.z, 1.0),
        ]
    }

    pub fn decode_velocity(&self) -> Vec3 {
        Vec3::new(
            self.velocity[0] as f32,
            self.velocity[1] as f32,
            self.velocity[2] as f32,
        )
    }

    pub fn encode_angle_degrees(degrees: f32) -> u16 {
        let wrapped = degrees.rem_euclid(360.0);
        ((wrapped / ANGLE_SCALE).round() as i64 & 0xFFFF) as u16
    }

    pub fn decode_yaw_degrees(&self) -> f32 {
        self.yaw as f32 * ANGLE_SCALE
    }

    pub fn decode_pitch_degrees(&self) -> f32 {
        self.pitch as f32 * ANGLE_SCALE
    }

    pub fn write(&self, writer: &mut BitWriter) {
        for component in self.position {
            writer.write_i16(component);
        }
        for component in self.velocity {
            writer.write_i16(component);
        }
        writer.write_u16(self.yaw);
        writer.write_u16(self.pitch);
        writer.write_u8(self.entity_type);
        writer.write_u8(self.flags.bits());
        writer.write_u8(self.health);
        writer.write_u8(self.armor);
        writer.write_u8(self.weapon);
        writer.write_u8(self.ammo);
    }

    pub fn read(reader: &mut BitReader) -> Self {
        let position = [reader.read_i16(), reader.read_i16(), reader.read_i16()];
        let velocity = [reader.read_i16(), reader.read_i16(), reader.read_i16()];
        let yaw = reader.read_u16();
        let pitch = reader.read_u16();
        let entity_type = reader.read_u8();
        let flags = EntityFlags::from_bits_truncate(reader.read_u8());
        let health = reader.read_u8();
        let armor = reader.read_u8();
        let weapon = reader.read_u8();
        let ammo = reader.read_u8();
        Self {
            position,
            velocity,
            yaw,
            pitch,
            entity_type,
            flags,
            health,
            armor,
            weapon,
            ammo,
        }
    }
}

fn quantize(value: f32, scale: f32) -> i16 {
    (value / scale).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        const JUMP = 1 << 0;
        const CROUCH = 1 << 1;
        const FIRE = 1 << 2;
        const ALT_FIRE = 1 << 3;
        const USE = 1 << 4;
        const RELOAD = 1 << 5;
        const SPRINT = 1 << 6;
    }
}

/// Application-facing decoded input, floating point, one per simulated tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserCmd {
    pub tick: u32,
    pub forward: f32,
    pub side: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub buttons: Buttons,
    pub weapon_select: u8,
}

impl Default for UserCmd {
    fn default() -> Self {
        Self {
            tick: 0,
            forward: 0.0,
            side: 0.0,
            yaw: 0.0,
            pitch: 0.0,
            buttons: Buttons::empty(),
            weapon_select: 0,
        }
    }
}

/// The 9-byte wire record inside an `Input` message: `forward:i8 | side:i8 |
/// yaw:u16 | pitch:u16 | buttons:u16 | weapon_select:u8`. The tick of a
/// record is implicit (`start_tick + index`), carried at the message level.
impl UserCmd {
    pub const WIRE_BYTES: usize = 9;

    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_i8(quantize(self.forward.clamp(-1.0, 1.0), 1.0 / 127.0));
        writer.write_i8(quantize(self.side.clamp(-1.0, 1.0), 1.0 / 127.0));
        writer.write_u16(EntityState::encode_angle_degrees(self.yaw));
        writer.write_u16(EntityState::encode_angle_degrees(self.pitch));
        writer.write_u16(self.buttons.bits());
        writer.write_u8(self.weapon_select);
    }

    pub fn read(tick: u32, reader: &mut BitReader) -> Self {
        let forward = reader.read_i8() as f32 / 127.0;
        let side = reader.read_i8() as f32 / 127.0;
        let yaw = reader.read_u16() as f32 * ANGLE_SCALE;
        let pitch = reader.read_u16() as f32 * ANGLE_SCALE;
        let buttons = Buttons::from_bits_truncate(reader.read_u16());
        let weapon_select = reader.read_u8();
        Self {
            tick,
            forward,
            side,
            yaw,
            pitch,
            buttons,
            weapon_select,
        }
    }
}

/// One fully-framed protocol message (tagged variant, §9 re-architecture
/// note). Decoders must exhaustively match and fall back to skipping
/// `length` bytes for an unrecognized type.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Nop,
    Input {
        start_tick: u32,
        records: Vec<UserCmd>,
    },
    Snapshot {
        base_tick: u32,
        current_tick: u32,
        last_input_echo: u32,
        delta_bytes: Vec<u8>,
    },
    Command {
        sequence_or_zero: u16,
        reliable_ack: u16,
        payload: Vec<u8>,
    },
    ClockSyncRequest {
        client_send_time: f64,
    },
    ClockSyncResponse {
        client_send_time: f64,
        server_time: f64,
    },
    Disconnect,
    ConnectRequest {
        client_challenge: u32,
    },
    ConnectChallenge {
        server_challenge: u32,
        client_challenge: u32,
    },
    ConnectResponse {
        server_challenge: u32,
        client_challenge: u32,
    },
    ConnectAccepted {
        client_id: u8,
        server_tick: u32,
        map_name: String,
    },
    ConnectRejected {
        reason: u8,
    },
    MapLoaded {
        map_name_hash: u32,
    },
    MapConfirmed {
        server_tick: u32,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Nop => MessageType::Nop,
            Message::Input { .. } => MessageType::Input,
            Message::Snapshot { .. } => MessageType::Snapshot,
            Message::Command { .. } => MessageType::Command,
            Message::ClockSyncRequest { .. } | Message::ClockSyncResponse { .. } => {
                MessageType::ClockSync
            }
            Message::Disconnect => MessageType::Disconnect,
            Message::ConnectRequest { .. } => MessageType::ConnectRequest,
            Message::ConnectChallenge { .. } => MessageType::ConnectChallenge,
            Message::ConnectResponse { .. } => MessageType::ConnectResponse,
            Message::ConnectAccepted { .. } => MessageType::ConnectAccepted,
            Message::ConnectRejected { .. } => MessageType::ConnectRejected,
            Message::MapLoaded { .. } => MessageType::MapLoaded,
            Message::MapConfirmed { .. } => MessageType::MapConfirmed,
        }
    }

    fn payload_bits(&self) -> usize {
        match self {
            Message::Nop | Message::Disconnect => 0,
            Message::Input { records, .. } => {
                2 + 32 + records.len() * UserCmd::WIRE_BYTES * 8
            }
            Message::Snapshot { delta_bytes, .. } => 32 + 32 + 32 + delta_bytes.len() * 8,
            Message::Command { payload, .. } => 16 + 16 + payload.len() * 8,
            Message::ClockSyncRequest { .. } => 64,
            Message::ClockSyncResponse { .. } => 64 + 64,
            Message::ConnectRequest { .. } => 32,
            Message::ConnectChallenge { .. } => 32 + 32,
            Message::ConnectResponse { .. } => 32 + 32,
            Message::ConnectAccepted { map_name, .. } => 8 + 32 + 8 + map_name.len() * 8,
            Message::ConnectRejected { .. } => 8,
            Message::MapLoaded { .. } => 32,
            Message::MapConfirmed { .. } => 32,
        }
    }

    pub fn length_bytes(&self) -> u16 {
        self.payload_bits().div_ceil(8) as u16
    }

    /// Writes the 16-bit message header followed by the payload.
    pub fn write(&self, writer: &mut BitWriter) {
        MessageHeader {
            message_type: self.message_type() as u8,
            length: self.length_bytes(),
        }
        .write(writer);
        self.write_payload(writer);
    }

    fn write_payload(&self, writer: &mut BitWriter) {
        match self {
            Message::Nop | Message::Disconnect => {}
            Message::Input {
                start_tick,
                records,
            } => {
                debug_assert!(!records.is_empty() && records.len() <= MAX_INPUT_RECORDS);
                writer.write_bits((records.len() - 1) as u32, 2);
                writer.write_u32(*start_tick);
                for record in records {
                    record.write(writer);
                }
            }
            Message::Snapshot {
                base_tick,
                current_tick,
                last_input_echo,
                delta_bytes,
            } => {
                writer.write_u32(*base_tick);
                writer.write_u32(*current_tick);
                writer.write_u32(*last_input_echo);
                for byte in delta_bytes {
                    writer.write_u8(*byte);
                }
            }
            Message::Command {
                sequence_or_zero,
                reliable_ack,
                payload,
            } => {
                writer.write_u16(*sequence_or_zero);
                writer.write_u16(*reliable_ack);
                for byte in payload {
                    writer.write_u8(*byte);
                }
            }
            Message::ClockSyncRequest { client_send_time } => {
                writer.write_f64(*client_send_time);
            }
            Message::ClockSyncResponse {
                client_send_time,
                server_time,
            } => {
                writer.write_f64(*client_send_time);
                writer.write_f64(*server_time);
            }
            Message::ConnectRequest { client_challenge } => {
                writer.write_u32(*client_challenge);
            }
            Message::ConnectChallenge {
                server_challenge,
                client_challenge,
            } => {
                writer.write_u32(*server_challenge);
                writer.write_u32(*client_challenge);
            }
            Message::ConnectResponse {
                server_challenge,
                client_challenge,
            } => {
                writer.write_u32(*server_challenge);
                writer.write_u32(*client_challenge);
            }
            Message::ConnectAccepted {
                client_id,
                server_tick,
                map_name,
            } => {
                writer.write_u8(*client_id);
                writer.write_u32(*server_tick);
                let bytes = map_name.as_bytes();
                let len = bytes.len().min(MAX_MAP_NAME_LEN);
                writer.write_u8(len as u8);
                for &byte in &bytes[..len] {
                    writer.write_u8(byte);
                }
            }
            Message::ConnectRejected { reason } => {
                writer.write_u8(*reason);
            }
            Message::MapLoaded { map_name_hash } => {
                writer.write_u32(*map_name_hash);
            }
            Message::MapConfirmed { server_tick } => {
                writer.write_u32(*server_tick);
            }
        }
    }

    /// Decodes a known message type's payload. The clock-sync variants share
    /// one wire type (§6.1); `is_server` selects request vs. response shape.
    pub fn read(
        message_type: MessageType,
        is_server: bool,
        reader: &mut BitReader,
    ) -> Option<Message> {
        Some(match message_type {
            MessageType::Nop => Message::Nop,
            MessageType::Input => {
                let count = reader.read_bits(2) as usize + 1;
                let start_tick = reader.read_u32();
                let mut records = Vec::with_capacity(count);
                for i in 0..count {
                    records.push(UserCmd::read(start_tick.wrapping_add(i as u32), reader));
                }
                Message::Input {
                    start_tick,
                    records,
                }
            }
            MessageType::Snapshot => {
                let base_tick = reader.read_u32();
                let current_tick = reader.read_u32();
                let last_input_echo = reader.read_u32();
                let mut delta_bytes = Vec::new();
                while reader.bits_remaining() >= 8 {
                    delta_bytes.push(reader.read_u8());
                }
                Message::Snapshot {
                    base_tick,
                    current_tick,
                    last_input_echo,
                    delta_bytes,
                }
            }
            MessageType::Command => {
                let sequence_or_zero = reader.read_u16();
                let reliable_ack = reader.read_u16();
                let mut payload = Vec::new();
                while reader.bits_remaining() >= 8 {
                    payload.push(reader.read_u8());
                }
                Message::Command {
                    sequence_or_zero,
                    reliable_ack,
                    payload,
                }
            }
            MessageType::ClockSync => {
                if is_server {
                    Message::ClockSyncRequest {
                        client_send_time: reader.read_f64(),
                    }
                } else {
                    Message::ClockSyncResponse {
                        client_send_time: reader.read_f64(),
                        server_time: reader.read_f64(),
                    }
                }
            }
            MessageType::Disconnect => Message::Disconnect,
            MessageType::ConnectRequest => Message::ConnectRequest {
                client_challenge: reader.read_u32(),
            },
            MessageType::ConnectChallenge => Message::ConnectChallenge {
                server_challenge: reader.read_u32(),
                client_challenge: reader.read_u32(),
            },
            MessageType::ConnectResponse => Message::ConnectResponse {
                server_challenge: reader.read_u32(),
                client_challenge: reader.read_u32(),
            },
            MessageType::ConnectAccepted => {
                let client_id = reader.read_u8();
                let server_tick = reader.read_u32();
                let len = reader.read_u8() as usize;
                let mut bytes = Vec::with_capacity(len);
                for _ in 0..len {
                    bytes.push(reader.read_u8());
                }
                Message::ConnectAccepted {
                    client_id,
                    server_tick,
                    map_name: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
            MessageType::ConnectRejected => Message::ConnectRejected {
                reason: reader.read_u8(),
            },
            MessageType::MapLoaded => Message::MapLoaded {
                map_name_hash: reader.read_u32(),
            },
            MessageType::MapConfirmed => Message::MapConfirmed {
                server_tick: reader.read_u32(),
            },
        })
    }
}

/// A 32-bit hash of a map name, used for the map-ready handshake (§4.7).
/// FNV-1a: simple, stable, and dependency-free.
pub fn hash_map_name(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ordering_is_wrap_aware() {
        assert!(sequence_more_recent(1, 0));
        assert!(!sequence_more_recent(0, 1));
        assert!(sequence_more_recent(0, 65535));
        assert!(!sequence_more_recent(65535, 0));
    }

    #[test]
    fn ack_tracker_shifts_and_sets_bits() {
        let mut tracker = AckTracker::new();
        tracker.on_receive(10);
        assert_eq!(tracker.incoming_sequence, 10);
        assert_eq!(tracker.ack_bitfield, 0);

        tracker.on_receive(12);
        assert_eq!(tracker.incoming_sequence, 12);
        // bit 1 (diff-1 for diff=2) set for the old incoming (10)
        assert_eq!(tracker.ack_bitfield, 0b10);

        tracker.on_receive(11); // fills a previously missing slot
        assert_eq!(tracker.incoming_sequence, 12);
        assert_eq!(tracker.ack_bitfield & 0b11, 0b11);
    }

    #[test]
    fn ack_tracker_resets_on_large_gap() {
        let mut tracker = AckTracker::new();
        tracker.on_receive(0);
        tracker.on_receive(100);
        assert_eq!(tracker.ack_bitfield, 0);
        assert_eq!(tracker.incoming_sequence, 100);
    }

    #[test]
    fn ack_tracker_ignores_too_old() {
        let mut tracker = AckTracker::new();
        tracker.on_receive(100);
        tracker.on_receive(50);
        assert_eq!(tracker.ack_bitfield, 0);
        assert_eq!(tracker.incoming_sequence, 100);
    }

    #[test]
    fn sequence_wrap_boundary() {
        let mut tracker = AckTracker::new();
        tracker.on_receive(65535);
        tracker.on_receive(0);
        assert_eq!(tracker.incoming_sequence, 0);
        assert_eq!(tracker.ack_bitfield, 0b1);
    }

    #[test]
    fn entity_state_roundtrip() {
        let mut state = EntityState {
            position: EntityState::encode_position(Vec3::new(100.0, 200.0, 50.0)),
            velocity: EntityState::encode_velocity(Vec3::new(300.0, 0.0, 0.0)),
            yaw: EntityState::encode_angle_degrees(180.0),
            pitch: EntityState::encode_angle_degrees(0.0),
            entity_type: 1,
            flags: EntityFlags::ON_GROUND,
            health: 200,
            armor: 150,
            weapon: 3,
            ammo: 25,
        };
        state.flags.insert(EntityFlags::FIRING);

        let mut writer = BitWriter::new(EntityState::WIRE_BYTES);
        state.write(&mut writer);
        assert_eq!(writer.bytes_written(), EntityState::WIRE_BYTES);

        let mut reader = BitReader::new(writer.as_bytes());
        let decoded = EntityState::read(&mut reader);
        assert_eq!(decoded, state);
        assert!((decoded.decode_position() - Vec3::new(100.0, 200.0, 50.0)).length() < 0.5);
    }

    #[test]
    fn usercmd_roundtrip_matches_scenario_tolerances() {
        let cmd = UserCmd {
            tick: 7,
            forward: 1.0,
            side: -0.5,
            yaw: 90.0,
            pitch: 15.0,
            buttons: Buttons::JUMP,
            weapon_select: 0,
        };
        let mut writer = BitWriter::new(UserCmd::WIRE_BYTES);
        cmd.write(&mut writer);
        assert_eq!(writer.bytes_written(), UserCmd::WIRE_BYTES);

        let mut reader = BitReader::new(writer.as_bytes());
        let decoded = UserCmd::read(7, &mut reader);
        assert!((decoded.forward - 1.0).abs() < 0.02);
        assert!((decoded.side - (-0.5)).abs() < 0.02);
        assert!((decoded.yaw - 90.0).abs() < 0.1);
        assert!((decoded.pitch - 15.0).abs() < 0.1);
        assert_eq!(decoded.buttons, Buttons::JUMP);
    }

    #[test]
    fn input_message_roundtrip() {
        let msg = Message::Input {
            start_tick: 40,
            records: vec![
                UserCmd {
                    tick: 40,
                    forward: 1.0,
                    ..Default::default()
                },
                UserCmd {
                    tick: 41,
                    side: -1.0,
                    ..Default::default()
                },
            ],
        };
        let mut writer = BitWriter::new(64);
        msg.write(&mut writer);

        let mut reader = BitReader::new(writer.as_bytes());
        let header = MessageHeader::read(&mut reader);
        assert_eq!(header.message_type, MessageType::Input as u8);
        let decoded = Message::read(MessageType::Input, true, &mut reader).unwrap();
        match decoded {
            Message::Input {
                start_tick,
                records,
            } => {
                assert_eq!(start_tick, 40);
                assert_eq!(records.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn connect_accepted_roundtrip() {
        let msg = Message::ConnectAccepted {
            client_id: 3,
            server_tick: 99,
            map_name: "arena_01".to_string(),
        };
        let mut writer = BitWriter::new(64);
        msg.write(&mut writer);
        let mut reader = BitReader::new(writer.as_bytes());
        let header = MessageHeader::read(&mut reader);
        assert_eq!(header.length, msg.length_bytes());
        let decoded = Message::read(MessageType::ConnectAccepted, false, &mut reader).unwrap();
        assert_eq!(decoded, msg);
    }
}
