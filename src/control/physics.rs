use crate::general::{Micrometers, Ticks, TrainId, MAX_SPEED, MAX_TRAINS};

use super::messages::Direction;

const SPEED_STEPS: usize = MAX_SPEED as usize + 1;
const TRAIN_SLOTS: usize = MAX_TRAINS as usize + 1;

/// Measured steady-state velocities in micrometers per tick, by speed
/// step. Steps below 6 do not reliably move the fleet and are treated
/// as stopped.
const STEADY_STATE_VELOCITY: [Micrometers; SPEED_STEPS] = [
    0, 0, 0, 0, 0, 0, 2912, 3521, 3949, 4448, 5025, 5476, 5924, 5924, 5924,
];

/// Measured acceleration magnitude in centi-micrometers per tick
/// squared. The tables were calibrated fleet-wide; per-train slots stay
/// so a badly behaved locomotive can be recalibrated alone.
const STEADY_STATE_ACCELERATION: i64 = 2000;

/// Calibration tables and kinematic helpers.
///
/// Distances appear in three units: track edges are millimeters,
/// location math is micrometers, and acceleration is centi-micrometers
/// per tick squared. The `/100` in every integration step converts the
/// latter; keep it.
#[derive(Debug)]
pub struct Physics {
    velocities: Box<[[Micrometers; SPEED_STEPS]; TRAIN_SLOTS]>,
    accelerations: Box<[i64; TRAIN_SLOTS]>,
}

impl Default for Physics {
    fn default() -> Self {
        Self::new()
    }
}

impl Physics {
    pub fn new() -> Self {
        Physics {
            velocities: Box::new([STEADY_STATE_VELOCITY; TRAIN_SLOTS]),
            accelerations: Box::new([STEADY_STATE_ACCELERATION; TRAIN_SLOTS]),
        }
    }

    /// The velocity `train` settles at when commanded `speed`.
    pub fn steady_state_velocity(&self, train: TrainId, speed: u8) -> Micrometers {
        self.velocities[train.index() % TRAIN_SLOTS][speed.min(MAX_SPEED) as usize]
    }

    /// Acceleration magnitude for `train`, centi-micrometers per tick
    /// squared.
    pub fn acceleration(&self, train: TrainId) -> i64 {
        self.accelerations[train.index() % TRAIN_SLOTS]
    }

    /// The pickup sits behind the nose of the locomotive; how far
    /// depends on which end leads.
    pub fn pickup_to_front(&self, direction: Direction) -> Micrometers {
        match direction {
            Direction::Forward => 20_000,
            Direction::Reverse => 140_000,
        }
    }

    /// How far `train` rolls from `velocity` to rest, nose included.
    pub fn stopping_distance(
        &self,
        train: TrainId,
        velocity: Micrometers,
        direction: Direction,
    ) -> Micrometers {
        let a = self.acceleration(train);
        velocity * velocity * 100 / (2 * a) + self.pickup_to_front(direction)
    }

    /// Ticks from `velocity` to rest.
    pub fn stopping_time(&self, train: TrainId, velocity: Micrometers) -> Ticks {
        velocity * 100 / self.acceleration(train)
    }

    /// Velocity after `ticks` more ticks of the regime described by the
    /// signed `acceleration`. Never goes below zero.
    pub fn ending_velocity(
        &self,
        velocity: Micrometers,
        acceleration: i64,
        ticks: Ticks,
    ) -> Micrometers {
        (velocity + acceleration * ticks / 100).max(0)
    }

    /// Closed-form distance covered in `dt` ticks by a train currently
    /// at `velocity` with `accel_ticks` of the signed `acceleration`
    /// regime remaining: the regime's share first, then cruise at the
    /// regime's ending velocity.
    pub fn distance_travelled(
        &self,
        velocity: Micrometers,
        acceleration: i64,
        accel_ticks: Ticks,
        dt: Ticks,
    ) -> Micrometers {
        let regime = dt.min(accel_ticks.max(0));
        let mut spent = regime;
        if acceleration < 0 {
            // A decelerating train covers no ground once it has stopped.
            spent = spent.min(velocity * 100 / -acceleration);
        }

        let accel_distance = velocity * spent + acceleration * spent * spent / 200;
        let cruise_velocity = self.ending_velocity(velocity, acceleration, spent);
        accel_distance + cruise_velocity * (dt - regime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train() -> TrainId {
        TrainId::new(58)
    }

    #[test]
    fn steady_state_velocity_is_monotone() {
        let physics = Physics::new();
        let mut last = 0;
        for speed in 0..=MAX_SPEED {
            let v = physics.steady_state_velocity(train(), speed);
            assert!(v >= last);
            last = v;
        }
        assert_eq!(physics.steady_state_velocity(train(), 10), 5025);
    }

    #[test]
    fn stopping_distance_includes_the_nose() {
        let physics = Physics::new();
        let kinetic = 4000i64 * 4000 * 100 / (2 * physics.acceleration(train()));
        assert_eq!(
            physics.stopping_distance(train(), 4000, Direction::Forward),
            kinetic + 20_000
        );
        assert_eq!(
            physics.stopping_distance(train(), 4000, Direction::Reverse),
            kinetic + 140_000
        );
    }

    #[test]
    fn closed_form_matches_tick_by_tick_braking() {
        let physics = Physics::new();
        let a = physics.acceleration(train());
        let v0: Micrometers = 4000;
        let t_stop = physics.stopping_time(train(), v0);

        // Integrate the same braking curve one tick at a time.
        let mut v = v0;
        let mut position = 0;
        for _ in 0..t_stop {
            position += v;
            v = (v - a / 100).max(0);
        }

        let closed = physics.distance_travelled(v0, -a, t_stop, t_stop);
        assert!((closed - position).abs() < 5_000, "{closed} vs {position}");
    }

    #[test]
    fn cruise_after_the_regime_ends() {
        let physics = Physics::new();
        // 10 ticks of acceleration then 10 ticks of cruise.
        let a = physics.acceleration(train());
        let d = physics.distance_travelled(1000, a, 10, 20);
        let v_end = physics.ending_velocity(1000, a, 10);
        assert_eq!(d, 1000 * 10 + a * 100 / 200 + v_end * 10);
    }

    #[test]
    fn braking_never_runs_backwards() {
        let physics = Physics::new();
        let a = physics.acceleration(train());
        // Far more regime ticks than the train needs to stop.
        let d = physics.distance_travelled(100, -a, 1000, 1000);
        assert!(d >= 0);
        assert_eq!(physics.ending_velocity(100, -a, 1000), 0);
    }
}
