//! Authoritative server session: connection handshake, per-client input
//! jitter buffering, the fixed-timestep tick loop, and delta-compressed
//! snapshot broadcast (§4.7, §4.8). Single-threaded and cooperative: one
//! call to [`ServerSession::server_tick`] drains the socket, applies
//! buffered input, runs one or more fixed ticks, and broadcasts — no locks,
//! no suspension points.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use glam::Vec3;

use crate::bitio::{BitReader, BitWriter};
use crate::config::ServerConfig;
use crate::error::{DropCounters, NetError, NetResult};
use crate::prediction::{JitterBuffer, MovementState};
use crate::protocol::{
    hash_map_name, AckTracker, Buttons, EntityFlags, EntityState, Message, MessageHeader,
    MessageType, PacketHeader, UserCmd, MAX_ENTITIES, PACKET_HEADER_BYTES,
};
use crate::reliable::ReliableChannel;
use crate::snapshot::{select_baseline, Snapshot, SnapshotHistory};
use crate::transport::Transport;

/// Frame deltas larger than this are clamped before feeding the
/// accumulator, so a stall (debugger pause, GC, slow frame) can't trigger a
/// burst of catch-up ticks (§4.8).
const MAX_FRAME_DELTA: Duration = Duration::from_millis(250);

/// A slot still in the handshake is reclaimed after this much silence (§4.7).
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);
/// A fully connected slot is reclaimed after this much silence (§4.7).
const CONNECTED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Challenging,
    Connected,
    MapLoading,
    MapReady,
}

struct ClientSlot {
    addr: SocketAddr,
    state: ConnectionState,
    client_challenge: u32,
    server_challenge: u32,
    entity_index: usize,
    ack: AckTracker,
    outgoing_sequence: u16,
    jitter: JitterBuffer,
    last_input_tick: u32,
    last_recv: Instant,
    command_rx: ReliableChannel,
    command_tx: ReliableChannel,
    pending_commands: VecDeque<Vec<u8>>,
    map_ready: bool,
    last_applied: Option<UserCmd>,
    /// Loopback slots skip the handshake timeout entirely: the local
    /// transport has no network to go silent on, and connection loss there
    /// means the process died, which the next tick will no longer run at all.
    is_loopback: bool,
}

pub struct ServerSession<T: Transport> {
    config: ServerConfig,
    transport: T,
    slots: Vec<Option<ClientSlot>>,
    addr_to_slot: HashMap<SocketAddr, usize>,
    current_tick: u32,
    accumulator: f64,
    tick_duration: f64,
    world: Snapshot,
    history: SnapshotHistory,
    map_name: String,
    pub drop_counters: DropCounters,
}

impl<T: Transport> ServerSession<T> {
    pub fn new(config: ServerConfig, transport: T) -> NetResult<Self> {
        config.validate()?;
        let max_clients = config.max_clients;
        let tick_duration = 1.0 / config.tick_rate_hz;
        Ok(Self {
            config,
            transport,
            slots: (0..max_clients).map(|_| None).collect(),
            addr_to_slot: HashMap::new(),
            current_tick: 0,
            accumulator: 0.0,
            tick_duration,
            world: Snapshot::new(0),
            history: SnapshotHistory::new(),
            map_name: String::new(),
            drop_counters: DropCounters::default(),
        })
    }

    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    // ---- gameplay interface (§6.4) ----

    pub fn set_entity(&mut self, index: usize, state: crate::protocol::EntityState) {
        if index < MAX_ENTITIES {
            self.world.set(index, state);
        }
    }

    pub fn remove_entity(&mut self, index: usize) {
        if index < MAX_ENTITIES {
            self.world.clear(index);
        }
    }

    /// The input resolved for `client_id` on the tick that just ran: a
    /// real client command, an extrapolated stand-in, or `None` if the
    /// client was frozen for lack of input.
    pub fn get_input(&self, client_id: usize) -> Option<UserCmd> {
        self.slot(client_id)?.last_applied
    }

    pub fn client_state(&self, client_id: usize) -> Option<ConnectionState> {
        self.slot(client_id).map(|s| s.state)
    }

    pub fn is_client_map_ready(&self, client_id: usize) -> bool {
        self.slot(client_id).is_some_and(|s| s.map_ready)
    }

    /// Sets the active map and demands every connected client re-confirm
    /// before it is considered ready again.
    pub fn set_map(&mut self, name: &str) {
        self.map_name = name.to_string();
        for slot in self.slots.iter_mut().flatten() {
            slot.map_ready = false;
            if slot.state == ConnectionState::MapReady {
                slot.state = ConnectionState::MapLoading;
            }
        }
    }

    pub fn take_commands(&mut self, client_id: usize) -> Vec<Vec<u8>> {
        self.slot_mut(client_id)
            .map(|s| s.pending_commands.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue_command(&mut self, client_id: usize, payload: Vec<u8>) -> bool {
        self.slot_mut(client_id)
            .is_some_and(|s| s.command_tx.queue(payload))
    }

    fn slot(&self, client_id: usize) -> Option<&ClientSlot> {
        self.slots.get(client_id)?.as_ref()
    }

    fn slot_mut(&mut self, client_id: usize) -> Option<&mut ClientSlot> {
        self.slots.get_mut(client_id)?.as_mut()
    }

    // ---- tick loop ----

    /// Drains the socket, applies one or more fixed ticks for the elapsed
    /// `delta`, and broadcasts snapshots. `simulate` runs the embedding
    /// game's logic for one tick; it receives the per-client real/
    /// extrapolated input resolved for that tick.
    pub fn server_tick(
        &mut self,
        delta: Duration,
        mut simulate: impl FnMut(&mut ServerSession<T>, u32, &HashMap<usize, UserCmd>),
    ) {
        self.drain_network();

        let capped = delta.min(MAX_FRAME_DELTA);
        self.accumulator += capped.as_secs_f64();

        while self.accumulator >= self.tick_duration {
            self.current_tick = self.current_tick.wrapping_add(1);
            let inputs = self.resolve_inputs();
            simulate(self, self.current_tick, &inputs);
            self.broadcast();
            self.accumulator -= self.tick_duration;
        }

        self.reap_timed_out();
    }

    fn resolve_inputs(&mut self) -> HashMap<usize, UserCmd> {
        let tick = self.current_tick;
        let mut out = HashMap::new();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.state != ConnectionState::MapReady {
                continue;
            }
            let movement_state = self
                .world
                .get(slot.entity_index)
                .map(|entity| movement_state_from_entity(entity, slot.last_applied.as_ref()))
                .unwrap_or(MovementState::Grounded);
            slot.jitter.set_movement_state(movement_state);

            let result = slot.jitter.consume();
            if result.was_predicted && result.speed_scale == 0.0 {
                log::trace!("client {id} frozen: input drought exceeded prediction budget");
                slot.last_applied = None;
                continue;
            }
            log::trace!(
                "tick {tick} client {id}: predicted={} speed_scale={:.2}",
                result.was_predicted,
                result.speed_scale
            );
            slot.last_applied = Some(result.input);
            out.insert(id, result.input);
        }
        log::debug!("tick {tick}: {} active client(s)", out.len());
        out
    }

    /// Lets the embedding simulation report the velocity it actually
    /// applied to `client_id`'s entity this tick, so the jitter buffer's
    /// next correction-blend estimate dead-reckons from a real value.
    pub fn note_applied_velocity(&mut self, client_id: usize, velocity: Vec3) {
        if let Some(slot) = self.slot_mut(client_id) {
            slot.jitter.note_applied_velocity(velocity);
        }
    }

    /// The in-progress correction-blend offset for `client_id`, to be added
    /// to the authoritative position when rendering that client's own
    /// entity locally (§4.10). `Vec3::ZERO` when no correction is active.
    pub fn get_correction(&self, client_id: usize) -> Vec3 {
        self.slot(client_id)
            .map(|s| s.jitter.correction_offset())
            .unwrap_or(Vec3::ZERO)
    }

    /// Overrides the movement state used to extrapolate `client_id`'s next
    /// predicted input, for states the entity's wire flags can't express
    /// (e.g. a crouch-slide held by game-specific logic). Automatically
    /// re-derived from `ON_GROUND`/velocity every tick otherwise.
    pub fn set_movement_state(&mut self, client_id: usize, state: MovementState) {
        if let Some(slot) = self.slot_mut(client_id) {
            slot.jitter.set_movement_state(state);
        }
    }

    fn broadcast(&mut self) {
        self.history.record(self.world.clone());
        let current_tick = self.current_tick;
        for (id, slot) in self.slots.iter_mut().enumerate().filter_map(|(i, s)| s.as_mut().map(|s| (i, s))) {
            if slot.state != ConnectionState::MapReady {
                continue;
            }
            let acked_tick = Some(slot.last_input_tick.saturating_sub(4).max(1));
            let baseline_tick = select_baseline(&self.history, current_tick, acked_tick);
            let baseline = baseline_tick.and_then(|t| self.history.get(t));
            if baseline.is_none() {
                log::warn!("client {id}: no usable baseline, sending full snapshot");
            }
            let delta_bytes = self.world.encode_delta(baseline);

            let message = Message::Snapshot {
                base_tick: baseline_tick.unwrap_or(0),
                current_tick,
                last_input_echo: slot.last_input_tick,
                delta_bytes,
            };

            let mut writer = BitWriter::new(PACKET_HEADER_BYTES + message.length_bytes() as usize + 2);
            let header = PacketHeader {
                sequence: slot.outgoing_sequence,
                ack: slot.ack.incoming_sequence,
                ack_bitfield: slot.ack.ack_bitfield,
            };
            header.write(&mut writer);
            message.write(&mut writer);
            slot.outgoing_sequence = slot.outgoing_sequence.wrapping_add(1);
            let _ = self.transport.send_to(slot.addr, writer.as_bytes());
        }
    }

    /// Reclaims slots gone silent past their state's timeout: 10s while
    /// still handshaking, 30s once connected (§4.7). Loopback slots are
    /// exempt from both — the local transport has no network to drop out on.
    fn reap_timed_out(&mut self) {
        let now = Instant::now();
        let mut removed = Vec::new();
        for (id, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.is_loopback {
                    continue;
                }
                let timeout = match slot.state {
                    ConnectionState::Challenging => CHALLENGE_TIMEOUT,
                    ConnectionState::Connected
                    | ConnectionState::MapLoading
                    | ConnectionState::MapReady => CONNECTED_TIMEOUT,
                };
                if now.duration_since(slot.last_recv) > timeout {
                    removed.push(id);
                }
            }
        }
        for id in removed {
            self.disconnect_slot(id);
        }
    }

    fn disconnect_slot(&mut self, id: usize) {
        if let Some(slot) = self.slots[id].take() {
            self.addr_to_slot.remove(&slot.addr);
            log::info!("client {id} ({}) disconnected", slot.addr);
        }
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn drain_network(&mut self) {
        let datagrams = self.transport.recv_all();
        for datagram in datagrams {
            if let Err(_err) = self.process_datagram(datagram.from, &datagram.bytes) {
                self.drop_counters.record_malformed();
            }
        }
    }

    fn process_datagram(&mut self, from: SocketAddr, bytes: &[u8]) -> NetResult<()> {
        if bytes.len() < PACKET_HEADER_BYTES {
            return Err(NetError::Truncated);
        }
        log::trace!("recv {} bytes from {from}", bytes.len());
        let mut reader = BitReader::new(bytes);
        let header = PacketHeader::read(&mut reader);

        let slot_id = self.addr_to_slot.get(&from).copied();
        if let Some(id) = slot_id {
            if let Some(slot) = self.slots[id].as_mut() {
                slot.ack.on_receive(header.sequence);
                slot.command_tx.on_ack(header.ack);
                slot.last_recv = Instant::now();
            }
        }

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
            let Some(message) = Message::read(msg_type, true, &mut reader) else {
                reader.skip_bytes(msg_header.length as usize);
                continue;
            };
            self.handle_message(from, slot_id, message);
        }
        Ok(())
    }

    fn handle_message(&mut self, from: SocketAddr, slot_id: Option<usize>, message: Message) {
        match message {
            Message::ConnectRequest { client_challenge } => {
                self.handle_connect_request(from, client_challenge);
            }
            Message::ConnectResponse {
                server_challenge,
                client_challenge,
            } => {
                self.handle_connect_response(from, slot_id, server_challenge, client_challenge);
            }
            Message::Input {
                start_tick,
                records,
            } => {
                let _ = start_tick;
                if let Some(id) = slot_id {
                    self.handle_input(id, records);
                }
            }
            Message::ClockSyncRequest { client_send_time } => {
                if let Some(id) = slot_id {
                    self.reply_clock_sync(id, client_send_time);
                }
            }
            Message::MapLoaded { map_name_hash } => {
                if let Some(id) = slot_id {
                    self.handle_map_loaded(id, map_name_hash);
                }
            }
            Message::Command {
                sequence_or_zero,
                payload,
                ..
            } => {
                if let Some(id) = slot_id {
                    self.handle_command(id, sequence_or_zero, payload);
                }
            }
            Message::Disconnect => {
                if let Some(id) = slot_id {
                    self.disconnect_slot(id);
                }
            }
            _ => {}
        }
    }

    fn handle_connect_request(&mut self, from: SocketAddr, client_challenge: u32) {
        if self.addr_to_slot.contains_key(&from) {
            return;
        }
        let Some(id) = self.find_free_slot() else {
            log::info!("rejecting connection from {from}: server full");
            let reject = Message::ConnectRejected { reason: 1 };
            let mut writer = BitWriter::new(PACKET_HEADER_BYTES + reject.length_bytes() as usize + 2);
            PacketHeader::default().write(&mut writer);
            reject.write(&mut writer);
            let _ = self.transport.send_to(from, writer.as_bytes());
            return;
        };

        log::info!("accepting connection from {from} into slot {id}");
        let server_challenge = generate_challenge(from, self.current_tick);
        let slot = ClientSlot {
            addr: from,
            state: ConnectionState::Challenging,
            client_challenge,
            server_challenge,
            entity_index: id,
            ack: AckTracker::new(),
            outgoing_sequence: 0,
            jitter: JitterBuffer::new(self.config.prediction_profile),
            last_input_tick: 0,
            last_recv: Instant::now(),
            command_rx: ReliableChannel::new(),
            command_tx: ReliableChannel::new(),
            pending_commands: VecDeque::new(),
            map_ready: false,
            last_applied: None,
            is_loopback: from.ip().is_loopback(),
        };
        self.slots[id] = Some(slot);
        self.addr_to_slot.insert(from, id);

        let challenge_msg = Message::ConnectChallenge {
            server_challenge,
            client_challenge,
        };
        let mut writer = BitWriter::new(PACKET_HEADER_BYTES + challenge_msg.length_bytes() as usize + 2);
        PacketHeader::default().write(&mut writer);
        challenge_msg.write(&mut writer);
        let _ = self.transport.send_to(from, writer.as_bytes());
    }

    fn handle_connect_response(
        &mut self,
        from: SocketAddr,
        slot_id: Option<usize>,
        server_challenge: u32,
        client_challenge: u32,
    ) {
        let Some(id) = slot_id else { return };
        let Some(slot) = self.slots[id].as_mut() else {
            return;
        };
        if slot.server_challenge != server_challenge || slot.client_challenge != client_challenge {
            self.disconnect_slot(id);
            return;
        }
        slot.state = ConnectionState::MapLoading;

        let accepted = Message::ConnectAccepted {
            client_id: id as u8,
            server_tick: self.current_tick,
            map_name: self.map_name.clone(),
        };
        let mut writer = BitWriter::new(PACKET_HEADER_BYTES + accepted.length_bytes() as usize + 2);
        PacketHeader::default().write(&mut writer);
        accepted.write(&mut writer);
        let _ = self.transport.send_to(from, writer.as_bytes());
    }

    fn handle_input(&mut self, slot_id: usize, records: Vec<UserCmd>) {
        let Some(slot) = self.slots[slot_id].as_mut() else {
            return;
        };
        for record in records {
            if record.tick == slot.last_input_tick {
                self.drop_counters.record_duplicate_input();
                continue;
            }
            if record.tick < slot.last_input_tick {
                self.drop_counters.record_late_input();
                continue;
            }
            slot.last_input_tick = record.tick;
            slot.jitter.push(record);
        }
    }

    fn reply_clock_sync(&mut self, slot_id: usize, client_send_time: f64) {
        let Some(slot) = self.slots[slot_id].as_ref() else {
            return;
        };
        let server_time = self.current_tick as f64 * self.tick_duration;
        let response = Message::ClockSyncResponse {
            client_send_time,
            server_time,
        };
        let mut writer = BitWriter::new(PACKET_HEADER_BYTES + response.length_bytes() as usize + 2);
        PacketHeader::default().write(&mut writer);
        response.write(&mut writer);
        let _ = self.transport.send_to(slot.addr, writer.as_bytes());
    }

    fn handle_map_loaded(&mut self, slot_id: usize, map_name_hash: u32) {
        let expected = hash_map_name(&self.map_name);
        let Some(slot) = self.slots[slot_id].as_mut() else {
            return;
        };
        if map_name_hash != expected {
            return;
        }
        slot.map_ready = true;
        slot.state = ConnectionState::MapReady;
        // Forces the next broadcast() to pick acked_tick=0 -> no baseline,
        // so the post-reload snapshot is always a full encode rather than a
        // delta against a pre-reload world the client has since discarded.
        slot.last_input_tick = 0;
        log::info!("client {slot_id} is map-ready on {}", self.map_name);
        let confirmed = Message::MapConfirmed {
            server_tick: self.current_tick,
        };
        let addr = slot.addr;
        let mut writer = BitWriter::new(PACKET_HEADER_BYTES + confirmed.length_bytes() as usize + 2);
        PacketHeader::default().write(&mut writer);
        confirmed.write(&mut writer);
        let _ = self.transport.send_to(addr, writer.as_bytes());
    }

    fn handle_command(&mut self, slot_id: usize, sequence: u16, payload: Vec<u8>) {
        let Some(slot) = self.slots[slot_id].as_mut() else {
            return;
        };
        if slot.command_rx.on_receive(sequence) {
            slot.pending_commands.push_back(payload);
        }
        let ack = Message::Command {
            sequence_or_zero: 0,
            reliable_ack: sequence,
            payload: Vec::new(),
        };
        let addr = slot.addr;
        let mut writer = BitWriter::new(PACKET_HEADER_BYTES + ack.length_bytes() as usize + 2);
        PacketHeader::default().write(&mut writer);
        ack.write(&mut writer);
        let _ = self.transport.send_to(addr, writer.as_bytes());
    }
}

/// Derives a prediction movement state from an entity's decoded wire flags
/// and the last input applied to it. `ON_GROUND` plus `CROUCH` held while
/// moving reads as a crouch-slide; `ON_GROUND` alone is grounded; airborne
/// splits into ascending/falling by vertical velocity sign.
fn movement_state_from_entity(entity: &EntityState, last_applied: Option<&UserCmd>) -> MovementState {
    let grounded = entity.flags.contains(EntityFlags::ON_GROUND);
    let crouching = last_applied.is_some_and(|cmd| cmd.buttons.contains(Buttons::CROUCH));
    let moving = last_applied.is_some_and(|cmd| cmd.forward != 0.0 || cmd.side != 0.0);
    if grounded && crouching && moving {
        MovementState::Crouchslide
    } else if grounded {
        MovementState::Grounded
    } else if entity.decode_velocity().z < 0.0 {
        MovementState::Falling
    } else {
        MovementState::Airborne
    }
}

fn generate_challenge(addr: SocketAddr, tick: u32) -> u32 {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    addr.hash(&mut hasher);
    tick.hash(&mut hasher);
    hasher.finish() as u32
}
