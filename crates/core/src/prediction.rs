//! Server-side input prediction for a single client: a buffer-and-consume
//! jitter buffer, movement-state-aware extrapolation when real input runs
//! dry, jitter-adaptive depth tracking, and a correction-blend glide back to
//! authoritative motion instead of a snap (§4.10).

use std::collections::VecDeque;
use std::time::Instant;

use glam::Vec3;

use crate::protocol::{Buttons, UserCmd, TICK_RATE_HZ};

/// Oldest-dropped ring capacity for buffered real input.
const INPUT_RING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementState {
    Grounded,
    Airborne,
    Crouchslide,
    Falling,
}

/// Tunable extrapolation/correction behavior. Three presets cover the
/// common deployments; individual fields can be overridden at runtime (e.g.
/// from a config file keyed by field name) without introducing a new
/// preset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionProfile {
    /// Minimum depth, in ticks, the jitter buffer is allowed to adapt to.
    pub jitter_buf_min: u32,
    /// Maximum depth, in ticks, the jitter buffer is allowed to adapt to.
    pub jitter_buf_max: u32,
    /// Exponential smoothing rate for the jitter estimate, in `[0, 1]`.
    pub jitter_adapt_rate: f32,
    /// Ticks of silence tolerated before extrapolation changes behavior by
    /// movement state, rather than simply repeating the last real input.
    pub predict_grace_ticks: u32,
    /// Tick at which speed-scale decay begins.
    pub predict_decel_start: u32,
    /// Per-tick speed-scale decay applied once `predict_decel_start` is
    /// reached, in `[0, 1]`.
    pub predict_decel_rate: f32,
    /// Ticks of pure extrapolation tolerated before freezing the entity.
    pub predict_max_ticks: u32,
    /// Distance threshold, in world units, below which a correction is
    /// blended over a single tick (effectively a snap).
    pub correct_small_dist: f32,
    /// Distance threshold, in world units, above which a correction uses
    /// the (longer) medium blend window.
    pub correct_large_dist: f32,
    /// Blend window, in ticks, for corrections between the two thresholds.
    pub correct_small_ticks: u32,
    /// Blend window, in ticks, for corrections at or above `correct_large_dist`.
    pub correct_medium_ticks: u32,
    /// Multiplier applied to the chosen blend window while airborne/falling.
    pub correct_air_mult: f32,
    /// Client-side interpolation delay, in milliseconds.
    pub interp_delay_ms: f32,
    /// Client-side extrapolation cap, in milliseconds.
    pub extrap_max_ms: f32,
    /// How many trailing input records the client repeats per `Input`
    /// message for loss resilience.
    pub input_redundancy: u32,
}

impl PredictionProfile {
    pub const COMPETITIVE: Self = Self {
        jitter_buf_min: 1,
        jitter_buf_max: 4,
        jitter_adapt_rate: 0.1,
        predict_grace_ticks: 2,
        predict_decel_start: 4,
        predict_decel_rate: 0.15,
        predict_max_ticks: 8,
        correct_small_dist: 4.0,
        correct_large_dist: 64.0,
        correct_small_ticks: 4,
        correct_medium_ticks: 10,
        correct_air_mult: 1.5,
        interp_delay_ms: 100.0,
        extrap_max_ms: 250.0,
        input_redundancy: 3,
    };

    pub const LENIENT: Self = Self {
        jitter_buf_min: 2,
        jitter_buf_max: 8,
        jitter_adapt_rate: 0.2,
        predict_grace_ticks: 6,
        predict_decel_start: 10,
        predict_decel_rate: 0.1,
        predict_max_ticks: 24,
        correct_small_dist: 9.0,
        correct_large_dist: 100.0,
        correct_small_ticks: 6,
        correct_medium_ticks: 16,
        correct_air_mult: 1.5,
        interp_delay_ms: 150.0,
        extrap_max_ms: 400.0,
        input_redundancy: 5,
    };

    pub const LAN: Self = Self {
        jitter_buf_min: 1,
        jitter_buf_max: 2,
        jitter_adapt_rate: 0.3,
        predict_grace_ticks: 1,
        predict_decel_start: 2,
        predict_decel_rate: 0.3,
        predict_max_ticks: 4,
        correct_small_dist: 1.0,
        correct_large_dist: 25.0,
        correct_small_ticks: 2,
        correct_medium_ticks: 4,
        correct_air_mult: 1.2,
        interp_delay_ms: 50.0,
        extrap_max_ms: 100.0,
        input_redundancy: 2,
    };

    /// Overrides one field by name, for config-file-driven tuning. Returns
    /// `false` for an unknown field name instead of panicking.
    pub fn set_field(&mut self, field: &str, value: f32) -> bool {
        match field {
            "jitter_buf_min" => self.jitter_buf_min = value.max(0.0) as u32,
            "jitter_buf_max" => self.jitter_buf_max = value.max(0.0) as u32,
            "jitter_adapt_rate" => self.jitter_adapt_rate = value.clamp(0.0, 1.0),
            "predict_grace_ticks" => self.predict_grace_ticks = value.max(0.0) as u32,
            "predict_decel_start" => self.predict_decel_start = value.max(0.0) as u32,
            "predict_decel_rate" => self.predict_decel_rate = value.clamp(0.0, 1.0),
            "predict_max_ticks" => self.predict_max_ticks = value.max(0.0) as u32,
            "correct_small_dist" => self.correct_small_dist = value.max(0.0),
            "correct_large_dist" => self.correct_large_dist = value.max(0.0),
            "correct_small_ticks" => self.correct_small_ticks = value.max(0.0) as u32,
            "correct_medium_ticks" => self.correct_medium_ticks = value.max(0.0) as u32,
            "correct_air_mult" => self.correct_air_mult = value.max(0.0),
            "interp_delay_ms" => self.interp_delay_ms = value.max(0.0),
            "extrap_max_ms" => self.extrap_max_ms = value.max(0.0),
            "input_redundancy" => self.input_redundancy = value.max(0.0) as u32,
            _ => return false,
        }
        true
    }
}

impl Default for PredictionProfile {
    fn default() -> Self {
        Self::COMPETITIVE
    }
}

/// The outcome of one tick's worth of [`JitterBuffer::consume`] (§4.10).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeResult {
    pub input: UserCmd,
    /// `false` for real buffered input, `true` for any synthesized stand-in.
    pub was_predicted: bool,
    /// Multiplier the simulation should apply to movement speed this tick;
    /// decays toward `0.0` the longer prediction runs without real input.
    pub speed_scale: f32,
}

struct Correction {
    offset: Vec3,
    progress: f32,
    total_ticks: u32,
}

/// Per-client input jitter buffer, movement-state extrapolator, and
/// correction-blend tracker.
pub struct JitterBuffer {
    profile: PredictionProfile,
    buffered: VecDeque<UserCmd>,
    last_real: UserCmd,
    predicted_ticks: u32,
    movement_state: MovementState,
    speed_scale: f32,
    correction: Option<Correction>,
    last_velocity: Vec3,
    jitter_ms: f32,
    adapted_depth: u32,
    last_push: Option<Instant>,
}

impl JitterBuffer {
    pub fn new(profile: PredictionProfile) -> Self {
        Self {
            profile,
            buffered: VecDeque::new(),
            last_real: UserCmd::default(),
            predicted_ticks: 0,
            movement_state: MovementState::Grounded,
            speed_scale: 1.0,
            correction: None,
            last_velocity: Vec3::ZERO,
            jitter_ms: 0.0,
            adapted_depth: profile.jitter_buf_min,
            last_push: None,
        }
    }

    pub fn profile(&self) -> PredictionProfile {
        self.profile
    }

    pub fn set_profile(&mut self, profile: PredictionProfile) {
        self.profile = profile;
    }

    /// Buffers one client-reported input for later consumption by
    /// [`JitterBuffer::consume`] (oldest dropped on overflow). Callers are
    /// responsible for rejecting late/duplicate ticks beforehand (see
    /// [`crate::error::DropCounters`]).
    ///
    /// Also folds the input's arrival into the jitter estimate:
    /// `jitter <- (1-a)*jitter + a*|observed_interval - expected_interval|`,
    /// from which an advisory `adapted_depth` is derived
    /// (`clamp(ceil(jitter/tick_ms)+1, buf_min, buf_max)`). `adapted_depth`
    /// does not itself change `consume`'s behavior; it is exposed for a
    /// caller that wants to size its own send-side buffering.
    pub fn push(&mut self, cmd: UserCmd) {
        let now = Instant::now();
        let tick_ms = 1000.0 / TICK_RATE_HZ as f32;
        if let Some(last) = self.last_push {
            let observed_ms = now.duration_since(last).as_secs_f32() * 1000.0;
            let j_ms = (observed_ms - tick_ms).abs();
            self.jitter_ms += self.profile.jitter_adapt_rate * (j_ms - self.jitter_ms);
            let depth = (self.jitter_ms / tick_ms).ceil() as u32 + 1;
            self.adapted_depth = depth.clamp(self.profile.jitter_buf_min, self.profile.jitter_buf_max);
        }
        self.last_push = Some(now);

        if self.buffered.len() == INPUT_RING_CAPACITY {
            self.buffered.pop_front();
        }
        self.buffered.push_back(cmd);
    }

    pub fn set_movement_state(&mut self, state: MovementState) {
        self.movement_state = state;
    }

    pub fn movement_state(&self) -> MovementState {
        self.movement_state
    }

    /// Jitter-adapted buffering depth, advisory only (§4.10).
    pub fn adapted_depth(&self) -> u32 {
        self.adapted_depth
    }

    pub fn predicted_ticks(&self) -> u32 {
        self.predicted_ticks
    }

    /// Reports the velocity the embedding simulation actually applied this
    /// tick, so the next correction-blend error estimate (and any future
    /// decay) starts from a real value rather than a stale one.
    pub fn note_applied_velocity(&mut self, velocity: Vec3) {
        self.last_velocity = velocity;
    }

    /// Advances the buffer by one server tick: consumes real buffered
    /// input if any is available, else synthesizes a movement-state-aware
    /// stand-in, per §4.10's literal algorithm:
    ///
    /// ```text
    /// if buffered: input = pop(); predicted_ticks = 0; speed_scale = 1.0
    /// else:
    ///     predicted_ticks += 1
    ///     if predicted_ticks <= grace: repeat last real input, clear JUMP
    ///     else: branch on movement_state (Grounded repeats; Airborne/Falling
    ///           and Crouchslide zero movement, optionally holding CROUCH)
    ///     if predicted_ticks >= decel_start: speed_scale *= (1 - decel_rate)
    ///     if predicted_ticks >= max_ticks: zero input, speed_scale = 0
    /// ```
    pub fn consume(&mut self) -> ConsumeResult {
        self.advance_correction();

        if let Some(input) = self.buffered.pop_front() {
            if self.predicted_ticks > 0 {
                self.begin_correction();
            }
            self.last_real = input;
            self.predicted_ticks = 0;
            self.speed_scale = 1.0;
            return ConsumeResult {
                input,
                was_predicted: false,
                speed_scale: 1.0,
            };
        }

        self.predicted_ticks += 1;
        let pred_tick = self.last_real.tick.wrapping_add(self.predicted_ticks);

        let mut predicted = if self.predicted_ticks <= self.profile.predict_grace_ticks {
            let mut cmd = self.last_real;
            cmd.tick = pred_tick;
            cmd.buttons.remove(Buttons::JUMP);
            cmd
        } else {
            match self.movement_state {
                MovementState::Grounded => {
                    let mut cmd = self.last_real;
                    cmd.tick = pred_tick;
                    cmd.buttons.remove(Buttons::JUMP);
                    cmd
                }
                MovementState::Airborne | MovementState::Falling => UserCmd {
                    tick: pred_tick,
                    forward: 0.0,
                    side: 0.0,
                    yaw: self.last_real.yaw,
                    pitch: self.last_real.pitch,
                    buttons: Buttons::empty(),
                    weapon_select: self.last_real.weapon_select,
                },
                MovementState::Crouchslide => UserCmd {
                    tick: pred_tick,
                    forward: 0.0,
                    side: 0.0,
                    yaw: self.last_real.yaw,
                    pitch: self.last_real.pitch,
                    buttons: Buttons::CROUCH,
                    weapon_select: self.last_real.weapon_select,
                },
            }
        };

        if self.predicted_ticks >= self.profile.predict_decel_start {
            self.speed_scale = (self.speed_scale * (1.0 - self.profile.predict_decel_rate)).max(0.0);
        }

        if self.predicted_ticks >= self.profile.predict_max_ticks {
            predicted.forward = 0.0;
            predicted.side = 0.0;
            predicted.buttons = Buttons::empty();
            self.speed_scale = 0.0;
        }

        ConsumeResult {
            input: predicted,
            was_predicted: true,
            speed_scale: self.speed_scale,
        }
    }

    /// Arms a correction-blend glide from an estimated positional error
    /// (dead-reckoned from the last reported applied velocity over the
    /// prediction drought just ended), choosing the blend window from the
    /// profile's distance thresholds and scaling it up while airborne.
    fn begin_correction(&mut self) {
        let elapsed_secs = self.predicted_ticks as f32 / TICK_RATE_HZ as f32;
        let error = self.last_velocity * elapsed_secs;
        let dist_sq = error.length_squared();

        let mut blend_ticks = if dist_sq < self.profile.correct_small_dist.powi(2) {
            1
        } else if dist_sq < self.profile.correct_large_dist.powi(2) {
            self.profile.correct_small_ticks
        } else {
            self.profile.correct_medium_ticks
        };
        if matches!(self.movement_state, MovementState::Airborne | MovementState::Falling) {
            blend_ticks = ((blend_ticks as f32) * self.profile.correct_air_mult).round() as u32;
        }

        self.correction = Some(Correction {
            offset: error,
            progress: 0.0,
            total_ticks: blend_ticks.max(1),
        });
    }

    /// Advances the in-progress correction-blend by one tick, if any.
    fn advance_correction(&mut self) {
        if let Some(correction) = &mut self.correction {
            correction.progress += 1.0 / correction.total_ticks as f32;
            if correction.progress >= 1.0 {
                self.correction = None;
            }
        }
    }

    /// The visual correction offset to add to the authoritative position
    /// this tick: `error * (1 - progress)`, decaying to zero as the glide
    /// completes. `Vec3::ZERO` when no correction is in progress.
    pub fn correction_offset(&self) -> Vec3 {
        match &self.correction {
            Some(c) => c.offset * (1.0 - c.progress).clamp(0.0, 1.0),
            None => Vec3::ZERO,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.buffered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(tick: u32) -> UserCmd {
        UserCmd {
            tick,
            forward: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn real_input_resets_prediction() {
        let mut jb = JitterBuffer::new(PredictionProfile::COMPETITIVE);
        jb.push(cmd(1));
        let result = jb.consume();
        assert_eq!(result.input.tick, 1);
        assert!(!result.was_predicted);
        assert_eq!(result.speed_scale, 1.0);
    }

    #[test]
    fn missing_input_extrapolates_then_freezes_per_literal_scenario() {
        // §8 scenario 7: grace=1, decel_start=10, decel_rate=0.15, max_ticks=24
        let mut profile = PredictionProfile::LAN;
        profile.predict_grace_ticks = 1;
        profile.predict_decel_start = 10;
        profile.predict_decel_rate = 0.15;
        profile.predict_max_ticks = 24;
        let mut jb = JitterBuffer::new(profile);
        jb.push(cmd(0));
        let first = jb.consume();
        assert!(!first.was_predicted);

        let mut froze_at = None;
        for tick in 1..30u32 {
            let result = jb.consume();
            assert!(result.was_predicted);
            if tick < 10 {
                assert_eq!(result.speed_scale, 1.0, "no decay before decel_start");
            }
            if result.speed_scale == 0.0 && froze_at.is_none() {
                froze_at = Some(tick);
                assert_eq!(result.input.forward, 0.0);
                assert!(result.input.buttons.is_empty());
            }
        }
        assert_eq!(froze_at, Some(24));
    }

    #[test]
    fn grounded_prediction_past_grace_repeats_forward_without_jump() {
        let mut profile = PredictionProfile::COMPETITIVE;
        profile.predict_grace_ticks = 1;
        let mut jb = JitterBuffer::new(profile);
        jb.push(UserCmd {
            tick: 0,
            forward: 1.0,
            buttons: Buttons::JUMP,
            ..Default::default()
        });
        jb.consume();
        jb.set_movement_state(MovementState::Grounded);
        jb.consume(); // grace tick
        let beyond_grace = jb.consume();
        assert_eq!(beyond_grace.input.forward, 1.0);
        assert!(!beyond_grace.input.buttons.contains(Buttons::JUMP));
    }

    #[test]
    fn airborne_prediction_past_grace_zeroes_movement() {
        let mut profile = PredictionProfile::COMPETITIVE;
        profile.predict_grace_ticks = 1;
        let mut jb = JitterBuffer::new(profile);
        jb.push(cmd(0));
        jb.consume();
        jb.set_movement_state(MovementState::Airborne);
        jb.consume(); // grace tick
        let beyond_grace = jb.consume();
        assert_eq!(beyond_grace.input.forward, 0.0);
        assert_eq!(beyond_grace.input.side, 0.0);
    }

    #[test]
    fn crouchslide_prediction_holds_crouch() {
        let mut profile = PredictionProfile::COMPETITIVE;
        profile.predict_grace_ticks = 0;
        let mut jb = JitterBuffer::new(profile);
        jb.push(cmd(0));
        jb.consume();
        jb.set_movement_state(MovementState::Crouchslide);
        let result = jb.consume();
        assert!(result.input.buttons.contains(Buttons::CROUCH));
    }

    #[test]
    fn correction_blend_decays_offset_to_zero() {
        let mut jb = JitterBuffer::new(PredictionProfile::COMPETITIVE);
        jb.push(cmd(0));
        jb.consume();
        jb.note_applied_velocity(Vec3::new(100.0, 0.0, 0.0));
        jb.consume(); // missing real input, starts a predicted streak
        assert_eq!(jb.correction_offset(), Vec3::ZERO);

        jb.push(cmd(2));
        jb.consume(); // real input resumes, arms a correction blend
        assert!(jb.correction_offset().length() > 0.0);

        let mut last = jb.correction_offset();
        for _ in 0..32 {
            jb.consume();
            last = jb.correction_offset();
            if last == Vec3::ZERO {
                break;
            }
        }
        assert_eq!(last, Vec3::ZERO);
    }

    #[test]
    fn jitter_estimate_adapts_depth_within_profile_bounds() {
        let mut jb = JitterBuffer::new(PredictionProfile::COMPETITIVE);
        for tick in 0..10 {
            jb.push(cmd(tick));
        }
        assert!(jb.adapted_depth() >= PredictionProfile::COMPETITIVE.jitter_buf_min);
        assert!(jb.adapted_depth() <= PredictionProfile::COMPETITIVE.jitter_buf_max);
    }

    #[test]
    fn field_override_rejects_unknown_name() {
        let mut profile = PredictionProfile::LAN;
        assert!(profile.set_field("predict_decel_rate", 0.5));
        assert_eq!(profile.predict_decel_rate, 0.5);
        assert!(!profile.set_field("not_a_real_field", 1.0));
    }

    #[test]
    fn pending_count_tracks_ring_contents() {
        let mut jb = JitterBuffer::new(PredictionProfile::COMPETITIVE);
        assert_eq!(jb.pending_count(), 0);
        jb.push(cmd(0));
        jb.push(cmd(1));
        assert_eq!(jb.pending_count(), 2);
        jb.consume();
        assert_eq!(jb.pending_count(), 1);
    }
}
