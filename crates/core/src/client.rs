//! Client session: connect handshake, clock sync, input send, and
//! snapshot-interpolated world rendering (§4.6, §4.9).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use glam::Vec3;

use crate::bitio::{BitReader, BitWriter};
use crate::clock::ClockSync;
use crate::config::ClientConfig;
use crate::error::{DropCounters, NetResult};
use crate::protocol::{
    hash_map_name, AckTracker, EntityFlags, Message, MessageHeader, MessageType, PacketHeader,
    UserCmd, MAX_INPUT_RECORDS, PACKET_HEADER_BYTES,
};
use crate::reliable::ReliableChannel;
use crate::snapshot::{Snapshot, SnapshotHistory};
use crate::transport::Transport;

const INTERP_RING_CAPACITY: usize = 32;
const INPUT_HISTORY_CAPACITY: usize = 64;

/// Position jumps larger than this between consecutive snapshots are
/// treated as teleports and snapped to rather than interpolated, even
/// without the `TELEPORTED` flag (belt-and-suspenders, §4.9).
const TELEPORT_DISTANCE: f32 = 512.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    AwaitingChallenge,
    AwaitingAccept,
    MapLoading,
    MapReady,
}

/// A fully resolved, render-ready entity pose: floating point, post-lerp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedEntity {
    pub position: Vec3,
    pub yaw_degrees: f32,
    pub pitch_degrees: f32,
    pub flags: EntityFlags,
    pub health: u8,
    pub armor: u8,
    pub weapon: u8,
    pub ammo: u8,
}

fn shortest_arc_lerp(a: f32, b: f32, t: f32) -> f32 {
    let mut delta = (b - a) % 360.0;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    (a + delta * t).rem_euclid(360.0)
}

pub struct ClientSession<T: Transport> {
    config: ClientConfig,
    transport: T,
    server_addr: SocketAddr,
    state: ClientState,
    client_challenge: u32,
    server_challenge: u32,
    client_id: Option<u8>,
    map_name: Option<String>,
    map_loaded_sent: bool,

    ack: AckTracker,
    outgoing_sequence: u16,
    clock: ClockSync,
    last_sync_sent: Option<Instant>,

    history: SnapshotHistory,
    interp_ring: VecDeque<Snapshot>,
    interpolated: Vec<(usize, InterpolatedEntity)>,
    server_last_input_echo: u32,

    input_history: VecDeque<UserCmd>,

    command_tx: ReliableChannel,
    command_rx: ReliableChannel,
    last_acked_command: Option<u16>,

    pub drop_counters: DropCounters,
}

impl<T: Transport> ClientSession<T> {
    pub fn new(config: ClientConfig, transport: T) -> NetResult<Self> {
        config.validate()?;
        let server_addr = config.server_addr;
        Ok(Self {
            config,
            transport,
            server_addr,
            state: ClientState::Disconnected,
            client_challenge: 0,
            server_challenge: 0,
            client_id: None,
            map_name: None,
            map_loaded_sent: false,
            ack: AckTracker::new(),
            outgoing_sequence: 0,
            clock: ClockSync::new(),
            last_sync_sent: None,
            history: SnapshotHistory::new(),
            interp_ring: VecDeque::with_capacity(INTERP_RING_CAPACITY),
            interpolated: Vec::new(),
            server_last_input_echo: 0,
            input_history: VecDeque::with_capacity(INPUT_HISTORY_CAPACITY),
            command_tx: ReliableChannel::new(),
            command_rx: ReliableChannel::new(),
            last_acked_command: None,
            drop_counters: DropCounters::default(),
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn client_id(&self) -> Option<u8> {
        self.client_id
    }

    /// Begins the challenge/response handshake (§4.7).
    pub fn connect(&mut self, challenge_seed: u32) {
        self.client_challenge = challenge_seed;
        self.state = ClientState::AwaitingChallenge;
        let request = Message::ConnectRequest {
            client_challenge: self.client_challenge,
        };
        self.send_unsequenced(&request);
    }

    pub fn rtt_ms(&self) -> f64 {
        self.clock.rtt_ms()
    }

    pub fn server_cmd_ack(&self) -> Option<u16> {
        self.last_acked_command
    }

    pub fn server_map_name(&self) -> Option<&str> {
        self.map_name.as_deref()
    }

    /// The tick of the last input this client sent that the server has
    /// echoed back as applied; inputs at or before it can be forgotten.
    pub fn server_last_input_echo(&self) -> u32 {
        self.server_last_input_echo
    }

    pub fn queue_command(&mut self, payload: Vec<u8>) -> bool {
        self.command_tx.queue(payload)
    }

    /// Sends a pending reliable command if one is queued and due.
    fn flush_command(&mut self) {
        let Some((sequence, payload)) = self.command_tx.poll_send(Instant::now()) else {
            return;
        };
        let message = Message::Command {
            sequence_or_zero: sequence,
            reliable_ack: 0,
            payload: payload.to_vec(),
        };
        self.send_unsequenced(&message);
    }

    /// Tells the server this client finished loading `name` (§4.7).
    pub fn notify_map_loaded(&mut self, name: &str) {
        self.map_loaded_sent = true;
        let message = Message::MapLoaded {
            map_name_hash: hash_map_name(name),
        };
        self.send_unsequenced(&message);
    }

    /// Buffers `cmd` and immediately sends it (with recent history for
    /// loss resilience) as an `Input` message.
    pub fn send_input(&mut self, cmd: UserCmd) {
        if self.input_history.len() == INPUT_HISTORY_CAPACITY {
            self.input_history.pop_front();
        }
        self.input_history.push_back(cmd);

        let records: Vec<UserCmd> = self
            .input_history
            .iter()
            .rev()
            .take(MAX_INPUT_RECORDS)
            .rev()
            .copied()
            .collect();
        let Some(start_tick) = records.first().map(|r| r.tick) else {
            return;
        };
        let message = Message::Input {
            start_tick,
            records,
        };
        self.send_unsequenced(&message);
    }

    fn send_unsequenced(&mut self, message: &Message) {
        let mut writer = BitWriter::new(PACKET_HEADER_BYTES + message.length_bytes() as usize + 2);
        let header = PacketHeader {
            sequence: self.outgoing_sequence,
            ack: self.ack.incoming_sequence,
            ack_bitfield: self.ack.ack_bitfield,
        };
        header.write(&mut writer);
        message.write(&mut writer);
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        let _ = self.transport.send_to(self.server_addr, writer.as_bytes());
    }

    /// Drains the socket and, if due, pings the server for clock sync.
    /// `now_secs` is this client's wall-clock reading, in seconds, used for
    /// both the clock-sync sample and the resend timer.
    pub fn client_tick(&mut self, now_secs: f64) {
        self.drain_network(now_secs);
        self.flush_command();

        let due = match self.last_sync_sent {
            None => true,
            Some(last) => last.elapsed() >= self.clock.next_sync_interval(),
        };
        if due && self.state != ClientState::Disconnected {
            self.last_sync_sent = Some(Instant::now());
            let request = Message::ClockSyncRequest {
                client_send_time: now_secs,
            };
            self.send_unsequenced(&request);
        }
    }

    fn drain_network(&mut self, now_secs: f64) {
        let datagrams = self.transport.recv_all();
        for datagram in datagrams {
            if datagram.from != self.server_addr {
                continue;
            }
            if self.process_datagram(&datagram.bytes, now_secs).is_err() {
                self.drop_counters.record_malformed();
            }
        }
    }

    fn process_datagram(&mut self, bytes: &[u8], now_secs: f64) -> NetResult<()> {
        if bytes.len() < PACKET_HEADER_BYTES {
            return Err(crate::error::NetError::Truncated);
        }
        log::trace!("recv {} bytes from server", bytes.len());
        let mut reader = BitReader::new(bytes);
        let header = PacketHeader::read(&mut reader);
        self.ack.on_receive(header.sequence);
        self.command_tx.on_ack(header.ack);

        loop {
            if reader.bits_remaining() < 16 {
                break;
            }
            let msg_header = MessageHeader::read(&mut reader);
            let Some(msg_type) = MessageType::from_u8(msg_header.message_type) else {
                reader.skip_bytes(msg_header.length as usize);
                continue;
            };
            if msg_type == MessageType::Nop {
                break;
            }
            let Some(message) = Message::read(msg_type, false, &mut reader) else {
                reader.skip_bytes(msg_header.length as usize);
                continue;
            };
            self.handle_message(message, now_secs);
        }
        Ok(())
    }

    fn handle_message(&mut self, message: Message, now_secs: f64) {
        match message {
            Message::ConnectChallenge {
                server_challenge,
                client_challenge,
            } => {
                if self.state == ClientState::AwaitingChallenge
                    && client_challenge == self.client_challenge
                {
                    self.server_challenge = server_challenge;
                    self.state = ClientState::AwaitingAccept;
                    let response = Message::ConnectResponse {
                        server_challenge,
                        client_challenge,
                    };
                    self.send_unsequenced(&response);
                }
            }
            Message::ConnectAccepted {
                client_id,
                server_tick: _,
                map_name,
            } => {
                if self.state == ClientState::AwaitingAccept {
                    log::info!("connected as client {client_id}, loading map {map_name}");
                    self.client_id = Some(client_id);
                    self.map_name = Some(map_name);
                    self.state = ClientState::MapLoading;
                }
            }
            Message::ConnectRejected { reason } => {
                log::info!("connection rejected, reason {reason}");
                self.state = ClientState::Disconnected;
            }
            Message::MapConfirmed { .. } => {
                if self.state == ClientState::MapLoading {
                    log::info!("map ready");
                    self.state = ClientState::MapReady;
                }
            }
            Message::Snapshot {
                base_tick,
                current_tick,
                last_input_echo,
                delta_bytes,
            } => {
                self.server_last_input_echo = last_input_echo;
                self.input_history.retain(|cmd| cmd.tick > last_input_echo);
                // Baseline tick 0 is the server's sentinel for "no
                // baseline"; real acked ticks are floored at 1 (§4.5). A
                // non-zero base_tick whose snapshot has since fallen out of
                // history (packet loss, normal under churn) must not be
                // treated as "no baseline" — decoding the delta against an
                // assumed-empty baseline would zero every field the delta
                // didn't mark changed. Drop it and wait for the server to
                // resend a full snapshot instead (§4.9, §7).
                let baseline = if base_tick == 0 {
                    None
                } else if let Some(snapshot) = self.history.get(base_tick) {
                    Some(snapshot)
                } else {
                    self.drop_counters.record_dropped_snapshot();
                    return;
                };
                let snapshot = Snapshot::decode_delta(current_tick, &delta_bytes, baseline);
                self.ingest_snapshot(snapshot);
            }
            Message::ClockSyncResponse {
                client_send_time,
                server_time,
            } => {
                self.clock.record_sample(client_send_time, now_secs, server_time);
            }
            Message::Command {
                sequence_or_zero,
                reliable_ack,
                payload,
            } => {
                if payload.is_empty() && reliable_ack != 0 {
                    self.last_acked_command = Some(reliable_ack);
                } else if self.command_rx.on_receive(sequence_or_zero) {
                    // Inbound reliable commands from the server are handed
                    // to the embedding game elsewhere; this session only
                    // tracks dedup state for them.
                    let _ = payload;
                }
            }
            _ => {}
        }
    }

    /// Feeds a snapshot directly into the interpolation ring, bypassing
    /// transport and baseline resolution. The sole hook for demo playback.
    pub fn inject_demo_snapshot(&mut self, snapshot: Snapshot) {
        self.ingest_snapshot(snapshot);
    }

    fn ingest_snapshot(&mut self, snapshot: Snapshot) {
        self.history.record(snapshot.clone());
        if self.interp_ring.len() == INTERP_RING_CAPACITY {
            self.interp_ring.pop_front();
        }
        if self
            .interp_ring
            .back()
            .is_some_and(|last| last.tick >= snapshot.tick)
        {
            return; // out-of-order arrival, already have something newer
        }
        self.interp_ring.push_back(snapshot);
    }

    /// Resolves every entity's render pose for `render_tick` (typically
    /// `latest_tick - interpolation_delay_ticks`, as a fractional tick
    /// count) and caches the result for [`ClientSession::interp_state`].
    pub fn interpolate(&mut self, render_tick: f64) {
        self.interpolated.clear();
        if self.interp_ring.is_empty() {
            return;
        }

        let (before, after) = self.bracket(render_tick);
        match (before, after) {
            (Some(a), Some(b)) if a.tick != b.tick => {
                let t = ((render_tick - a.tick as f64) / (b.tick as f64 - a.tick as f64))
                    .clamp(0.0, 1.0) as f32;
                for (index, entity_b) in b.iter_present() {
                    let pose = match a.get(index) {
                        Some(entity_a)
                            if !entity_b.flags.contains(EntityFlags::TELEPORTED)
                                && entity_a.decode_position().distance(entity_b.decode_position())
                                    < TELEPORT_DISTANCE =>
                        {
                            InterpolatedEntity {
                                position: entity_a.decode_position().lerp(entity_b.decode_position(), t),
                                yaw_degrees: shortest_arc_lerp(
                                    entity_a.decode_yaw_degrees(),
                                    entity_b.decode_yaw_degrees(),
                                    t,
                                ),
                                pitch_degrees: shortest_arc_lerp(
                                    entity_a.decode_pitch_degrees(),
                                    entity_b.decode_pitch_degrees(),
                                    t,
                                ),
                                flags: entity_b.flags,
                                health: entity_b.health,
                                armor: entity_b.armor,
                                weapon: entity_b.weapon,
                                ammo: entity_b.ammo,
                            }
                        }
                        _ => snapped(entity_b),
                    };
                    self.interpolated.push((index, pose));
                }
            }
            (_, Some(only)) => {
                for (index, entity) in only.iter_present() {
                    self.interpolated.push((index, snapped(entity)));
                }
            }
            (Some(only), None) => {
                // Render time is ahead of every buffered snapshot:
                // extrapolate linearly from velocity, capped.
                let cap = self.config.max_extrapolation_ticks as f64;
                let ahead = (render_tick - only.tick as f64).min(cap).max(0.0) as f32;
                let dt = ahead / crate::protocol::TICK_RATE_HZ as f32;
                for (index, entity) in only.iter_present() {
                    let mut pose = snapped(entity);
                    pose.position += entity.decode_velocity() * dt;
                    self.interpolated.push((index, pose));
                }
            }
            (None, None) => {}
        }
    }

    fn bracket(&self, render_tick: f64) -> (Option<&Snapshot>, Option<&Snapshot>) {
        let mut before = None;
        let mut after = None;
        for snapshot in &self.interp_ring {
            if (snapshot.tick as f64) <= render_tick {
                before = Some(snapshot);
            } else if after.is_none() {
                after = Some(snapshot);
                break;
            }
        }
        (before, after)
    }

    pub fn interp_state(&self, index: usize) -> Option<InterpolatedEntity> {
        self.interpolated
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, pose)| *pose)
    }

    /// Convenience wrapper around [`ClientSession::interp_state`] for this
    /// client's own entity, located at `client_id`'s index.
    pub fn server_player_state(&self) -> Option<InterpolatedEntity> {
        self.interp_state(self.client_id? as usize)
    }
}

fn snapped(entity: &crate::protocol::EntityState) -> InterpolatedEntity {
    InterpolatedEntity {
        position: entity.decode_position(),
        yaw_degrees: entity.decode_yaw_degrees(),
        pitch_degrees: entity.decode_pitch_degrees(),
        flags: entity.flags,
        health: entity.health,
        armor: entity.armor,
        weapon: entity.weapon,
        ammo: entity.ammo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use glam::Vec3;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn make_client() -> ClientSession<LoopbackTransport> {
        let (client_side, _server_side) = LoopbackTransport::pair(addr(1), addr(2));
        ClientSession::new(
            ClientConfig {
                server_addr: addr(2),
                ..ClientConfig::default()
            },
            client_side,
        )
        .unwrap()
    }

    fn entity_at(x: f32) -> crate::protocol::EntityState {
        crate::protocol::EntityState {
            position: crate::protocol::EntityState::encode_position(Vec3::new(x, 0.0, 0.0)),
            ..Default::default()
        }
    }

    #[test]
    fn interpolates_between_two_snapshots() {
        let mut client = make_client();
        let mut a = Snapshot::new(10);
        a.set(0, entity_at(0.0));
        let mut b = Snapshot::new(12);
        b.set(0, entity_at(10.0));
        client.inject_demo_snapshot(a);
        client.inject_demo_snapshot(b);

        client.interpolate(11.0);
        let pose = client.interp_state(0).unwrap();
        assert!((pose.position.x - 5.0).abs() < 0.6);
    }

    #[test]
    fn extrapolates_past_latest_snapshot() {
        let mut client = make_client();
        let mut snap = Snapshot::new(10);
        let mut entity = entity_at(0.0);
        entity.velocity = crate::protocol::EntityState::encode_velocity(Vec3::new(128.0, 0.0, 0.0));
        snap.set(0, entity);
        client.inject_demo_snapshot(snap);

        client.interpolate(11.0);
        let pose = client.interp_state(0).unwrap();
        assert!(pose.position.x > 0.0);
    }

    #[test]
    fn teleport_flag_snaps_instead_of_lerping() {
        let mut client = make_client();
        let mut a = Snapshot::new(10);
        a.set(0, entity_at(0.0));
        let mut b = Snapshot::new(11);
        let mut teleported = entity_at(1000.0);
        teleported.flags.insert(EntityFlags::TELEPORTED);
        b.set(0, teleported);
        client.inject_demo_snapshot(a);
        client.inject_demo_snapshot(b);

        client.interpolate(10.5);
        let pose = client.interp_state(0).unwrap();
        assert!((pose.position.x - 1000.0).abs() < 0.6);
    }

    #[test]
    fn shortest_arc_wraps_through_zero() {
        assert!((shortest_arc_lerp(350.0, 10.0, 0.5) - 0.0).abs() < 1.0);
    }

    #[test]
    fn snapshot_with_missing_baseline_is_dropped_not_corrupted() {
        let mut client = make_client();
        let mut a = Snapshot::new(10);
        a.set(0, entity_at(5.0));
        client.inject_demo_snapshot(a);

        // base_tick 999 was never recorded in history, so decoding against
        // it as-if-full would zero out fields the (empty) delta doesn't
        // mark changed.
        client.handle_message(
            Message::Snapshot {
                base_tick: 999,
                current_tick: 11,
                last_input_echo: 0,
                delta_bytes: Vec::new(),
            },
            0.0,
        );

        assert_eq!(client.drop_counters.snapshots_dropped, 1);
        client.interpolate(10.0);
        let pose = client.interp_state(0).unwrap();
        assert!((pose.position.x - 5.0).abs() < 0.01);
    }
}
