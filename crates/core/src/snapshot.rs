//! World snapshots, their ring-buffered history, baseline selection, and the
//! delta codec used to compress one snapshot against another (§4.5).

use bitflags::bitflags;

use crate::bitio::{BitReader, BitWriter};
use crate::protocol::{EntityState, HISTORY, MAX_ENTITIES};

bitflags! {
    /// Which entity fields changed relative to the baseline. The wire width
    /// is 12 bits; the unused top 4 are reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldMask: u16 {
        const POSITION = 1 << 0;
        const VELOCITY = 1 << 1;
        const YAW = 1 << 2;
        const PITCH = 1 << 3;
        const FLAGS = 1 << 4;
        const HEALTH = 1 << 5;
        const ARMOR = 1 << 6;
        const WEAPON_AMMO = 1 << 7;
    }
}

pub const FIELD_MASK_BITS: u32 = 12;

/// Width of one presence word; the [`MAX_ENTITIES`] presence bitmask is
/// split into words of this size so the delta codec can skip an entire
/// word with a single `changed` bit instead of transmitting all of it (§4.5).
const PRESENCE_WORD_BITS: usize = 64;
const PRESENCE_WORDS: usize = MAX_ENTITIES.div_ceil(PRESENCE_WORD_BITS);

/// A full description of the world at one tick: up to [`MAX_ENTITIES`] slots,
/// each either present or empty.
#[derive(Clone)]
pub struct Snapshot {
    pub tick: u32,
    entities: Box<[Option<EntityState>; MAX_ENTITIES]>,
}

impl Snapshot {
    pub fn new(tick: u32) -> Self {
        Self {
            tick,
            entities: Box::new([None; MAX_ENTITIES]),
        }
    }

    pub fn set(&mut self, index: usize, state: EntityState) {
        self.entities[index] = Some(state);
    }

    pub fn clear(&mut self, index: usize) {
        self.entities[index] = None;
    }

    pub fn get(&self, index: usize) -> Option<&EntityState> {
        self.entities[index].as_ref()
    }

    pub fn iter_present(&self) -> impl Iterator<Item = (usize, &EntityState)> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }

    /// Packs presence into `PRESENCE_WORDS` 64-bit words, bit `i % 64` of
    /// word `i / 64` set iff entity `i` is present.
    fn presence_words(&self) -> [u64; PRESENCE_WORDS] {
        let mut words = [0u64; PRESENCE_WORDS];
        for (index, entity) in self.entities.iter().enumerate() {
            if entity.is_some() {
                words[index / PRESENCE_WORD_BITS] |= 1u64 << (index % PRESENCE_WORD_BITS);
            }
        }
        words
    }

    fn diff_mask(current: &EntityState, baseline: Option<&EntityState>) -> FieldMask {
        let Some(base) = baseline else {
            return FieldMask::all();
        };
        let mut mask = FieldMask::empty();
        if current.position != base.position {
            mask |= FieldMask::POSITION;
        }
        if current.velocity != base.velocity {
            mask |= FieldMask::VELOCITY;
        }
        if current.yaw != base.yaw {
            mask |= FieldMask::YAW;
        }
        if current.pitch != base.pitch {
            mask |= FieldMask::PITCH;
        }
        if current.flags != base.flags {
            mask |= FieldMask::FLAGS;
        }
        if current.health != base.health {
            mask |= FieldMask::HEALTH;
        }
        if current.armor != base.armor {
            mask |= FieldMask::ARMOR;
        }
        if current.weapon != base.weapon || current.ammo != base.ammo {
            mask |= FieldMask::WEAPON_AMMO;
        }
        mask
    }

    fn write_entity_delta(writer: &mut BitWriter, current: &EntityState, mask: FieldMask) {
        writer.write_bits(mask.bits() as u32, FIELD_MASK_BITS);
        if mask.contains(FieldMask::POSITION) {
            for c in current.position {
                writer.write_i16(c);
            }
        }
        if mask.contains(FieldMask::VELOCITY) {
            for c in current.velocity {
                writer.write_i16(c);
            }
        }
        if mask.contains(FieldMask::YAW) {
            writer.write_u16(current.yaw);
        }
        if mask.contains(FieldMask::PITCH) {
            writer.write_u16(current.pitch);
        }
        if mask.contains(FieldMask::FLAGS) {
            writer.write_u8(current.flags.bits());
        }
        if mask.contains(FieldMask::HEALTH) {
            writer.write_u8(current.health);
        }
        if mask.contains(FieldMask::ARMOR) {
            writer.write_u8(current.armor);
        }
        if mask.contains(FieldMask::WEAPON_AMMO) {
            writer.write_u8(current.weapon);
            writer.write_u8(current.ammo);
        }
    }

    fn read_entity_delta(reader: &mut BitReader, baseline: Option<&EntityState>) -> EntityState {
        let mut state = baseline.copied().unwrap_or_default();
        let mask = FieldMask::from_bits_truncate(reader.read_bits(FIELD_MASK_BITS) as u16);
        if mask.contains(FieldMask::POSITION) {
            state.position = [reader.read_i16(), reader.read_i16(), reader.read_i16()];
        }
        if mask.contains(FieldMask::VELOCITY) {
            state.velocity = [reader.read_i16(), reader.read_i16(), reader.read_i16()];
        }
        if mask.contains(FieldMask::YAW) {
            state.yaw = reader.read_u16();
        }
        if mask.contains(FieldMask::PITCH) {
            state.pitch = reader.read_u16();
        }
        if mask.contains(FieldMask::FLAGS) {
            state.flags =
                crate::protocol::EntityFlags::from_bits_truncate(reader.read_u8());
        }
        if mask.contains(FieldMask::HEALTH) {
            state.health = reader.read_u8();
        }
        if mask.contains(FieldMask::ARMOR) {
            state.armor = reader.read_u8();
        }
        if mask.contains(FieldMask::WEAPON_AMMO) {
            state.weapon = reader.read_u8();
            state.ammo = reader.read_u8();
        }
        state
    }

    /// Encodes `self` against `baseline`. A `None` baseline (or one that
    /// can't be trusted, see [`select_baseline`]) is treated as an
    /// all-absent presence bitmask: every present entity's mask is forced
    /// to "all fields changed", and every presence word is written in full.
    ///
    /// The presence bitmask is itself delta-compressed word-by-word (§4.5):
    /// for each of the [`PRESENCE_WORDS`] 64-entity words, a `changed` bit
    /// is written; the 64-bit word itself follows only if it differs from
    /// the baseline's corresponding word. An unchanged word costs 1 bit
    /// instead of 64. Per present entity, an `entity_changed` bit similarly
    /// gates whether the 12-bit field mask (and fields) follow, so an
    /// entity present in both snapshots with nothing changed costs 1 bit.
    pub fn encode_delta(&self, baseline: Option<&Snapshot>) -> Vec<u8> {
        let presence_bits = PRESENCE_WORDS * (1 + PRESENCE_WORD_BITS);
        let presence_bytes = presence_bits.div_ceil(8);
        let mut writer = BitWriter::new(presence_bytes + MAX_ENTITIES * EntityState::WIRE_BYTES);

        let current_words = self.presence_words();
        let baseline_words = baseline
            .map(|b| b.presence_words())
            .unwrap_or([0u64; PRESENCE_WORDS]);
        for i in 0..PRESENCE_WORDS {
            let changed = current_words[i] != baseline_words[i];
            writer.write_bit(changed);
            if changed {
                writer.write_u64(current_words[i]);
            }
        }

        for (index, entity) in self.iter_present() {
            let base_entity = baseline.and_then(|b| b.get(index));
            let mask = Self::diff_mask(entity, base_entity);
            let entity_changed = !mask.is_empty();
            writer.write_bit(entity_changed);
            if entity_changed {
                Self::write_entity_delta(&mut writer, entity, mask);
            }
        }

        writer.as_bytes().to_vec()
    }

    pub fn decode_delta(tick: u32, bytes: &[u8], baseline: Option<&Snapshot>) -> Snapshot {
        let mut reader = BitReader::new(bytes);
        let mut snapshot = Snapshot::new(tick);

        let baseline_words = baseline
            .map(|b| b.presence_words())
            .unwrap_or([0u64; PRESENCE_WORDS]);
        let mut words = [0u64; PRESENCE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let changed = reader.read_bit();
            *word = if changed {
                reader.read_u64()
            } else {
                baseline_words[i]
            };
        }

        for index in 0..MAX_ENTITIES {
            let word = words[index / PRESENCE_WORD_BITS];
            let present = (word >> (index % PRESENCE_WORD_BITS)) & 1 != 0;
            if !present {
                continue;
            }
            let base_entity = baseline.and_then(|b| b.get(index));
            let entity_changed = reader.read_bit();
            let state = if entity_changed {
                Self::read_entity_delta(&mut reader, base_entity)
            } else {
                base_entity.copied().unwrap_or_default()
            };
            snapshot.set(index, state);
        }

        snapshot
    }
}

/// Fixed-depth ring of recent snapshots, keyed by `tick % HISTORY`. Each
/// slot also records which tick it holds so a stale hit (the ring wrapped
/// all the way around) reads as a miss rather than the wrong snapshot.
pub struct SnapshotHistory {
    slots: Vec<Option<Snapshot>>,
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self {
            slots: (0..HISTORY).map(|_| None).collect(),
        }
    }

    pub fn record(&mut self, snapshot: Snapshot) {
        let index = (snapshot.tick as usize) % HISTORY;
        self.slots[index] = Some(snapshot);
    }

    pub fn get(&self, tick: u32) -> Option<&Snapshot> {
        let index = (tick as usize) % HISTORY;
        self.slots[index]
            .as_ref()
            .filter(|snapshot| snapshot.tick == tick)
    }
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks which historic tick to delta-encode `current_tick` against, given
/// the client's last acknowledged tick. Falls back to a full snapshot
/// (`None`) if there is nothing to diff against, the client hasn't acked
/// anything durable yet, or the candidate baseline is the snapshot being
/// built right now (self-referential baseline, §4.5 edge case).
pub fn select_baseline(
    history: &SnapshotHistory,
    current_tick: u32,
    client_acked_tick: Option<u32>,
) -> Option<u32> {
    let acked = client_acked_tick?;
    if acked == current_tick {
        return None;
    }
    history.get(acked)?;
    Some(acked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EntityFlags;
    use glam::Vec3;

    fn sample_entity(x: f32) -> EntityState {
        EntityState {
            position: EntityState::encode_position(Vec3::new(x, 0.0, 0.0)),
            velocity: EntityState::encode_velocity(Vec3::ZERO),
            yaw: 0,
            pitch: 0,
            entity_type: 1,
            flags: EntityFlags::ON_GROUND,
            health: 100,
            armor: 0,
            weapon: 1,
            ammo: 20,
        }
    }

    #[test]
    fn full_snapshot_roundtrip_with_no_baseline() {
        let mut snap = Snapshot::new(10);
        snap.set(0, sample_entity(1.0));
        snap.set(5, sample_entity(2.0));

        let bytes = snap.encode_delta(None);
        let decoded = Snapshot::decode_delta(10, &bytes, None);

        assert_eq!(decoded.get(0), snap.get(0));
        assert_eq!(decoded.get(5), snap.get(5));
        assert!(decoded.get(1).is_none());
    }

    #[test]
    fn delta_only_carries_changed_fields() {
        let mut base = Snapshot::new(1);
        base.set(0, sample_entity(1.0));

        let mut current = Snapshot::new(2);
        let mut moved = sample_entity(1.0);
        moved.health = 50; // only health changes
        current.set(0, moved);

        let bytes = current.encode_delta(Some(&base));
        let decoded = Snapshot::decode_delta(2, &bytes, Some(&base));

        let decoded_entity = decoded.get(0).unwrap();
        assert_eq!(decoded_entity.health, 50);
        assert_eq!(decoded_entity.position, base.get(0).unwrap().position);
    }

    #[test]
    fn entity_removed_in_current_is_absent_after_decode() {
        let mut base = Snapshot::new(1);
        base.set(3, sample_entity(1.0));

        let current = Snapshot::new(2); // entity 3 gone

        let bytes = current.encode_delta(Some(&base));
        let decoded = Snapshot::decode_delta(2, &bytes, Some(&base));
        assert!(decoded.get(3).is_none());
    }

    #[test]
    fn baseline_selection_avoids_self_reference() {
        let mut history = SnapshotHistory::new();
        let mut snap = Snapshot::new(5);
        snap.set(0, sample_entity(1.0));
        history.record(snap);

        assert_eq!(select_baseline(&history, 5, Some(5)), None);
        assert_eq!(select_baseline(&history, 6, Some(5)), Some(5));
        assert_eq!(select_baseline(&history, 6, Some(999)), None);
        assert_eq!(select_baseline(&history, 6, None), None);
    }

    #[test]
    fn baseline_evicted_from_ring_falls_back_to_full() {
        let mut history = SnapshotHistory::new();
        history.record(Snapshot::new(1));
        // advance far enough that tick 1's ring slot gets overwritten
        history.record(Snapshot::new(1 + HISTORY as u32));
        assert_eq!(select_baseline(&history, 2 + HISTORY as u32, Some(1)), None);
    }
}
