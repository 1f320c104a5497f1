//! Comoving scale factor as a function of simulation time.

use serde::{Deserialize, Serialize};

/// Maps simulation time to the comoving scale factor `a`.
pub trait ScaleFactor: Send + Sync {
    fn comoving_a(&self, time: f64) -> f64;

    /// Scale factors at the ends of `[prev_time, cur_time]`. The half-step
    /// factor is their mean, not `a` at the midpoint time.
    fn step_factors(&self, prev_time: f64, cur_time: f64) -> StepFactors {
        let a_old = self.comoving_a(prev_time);
        let a_new = self.comoving_a(cur_time);
        StepFactors {
            a_old,
            a_half: 0.5 * (a_old + a_new),
            a_new,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepFactors {
    pub a_old: f64,
    pub a_half: f64,
    pub a_new: f64,
}

/// Non-expanding space, `a = 1` at all times.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Static;

impl ScaleFactor for Static {
    fn comoving_a(&self, _time: f64) -> f64 {
        1.0
    }
}

/// Matter-dominated flat universe, `a = a0 * ((t0 + t) / t0)^(2/3)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EinsteinDeSitter {
    /// Scale factor when the simulation starts.
    pub a0: f64,
    /// Age of the universe when the simulation starts.
    pub t0: f64,
}

impl EinsteinDeSitter {
    /// Start at redshift `z` with the universe `t0` old.
    pub fn from_redshift(z: f64, t0: f64) -> Self {
        Self {
            a0: 1.0 / (1.0 + z),
            t0,
        }
    }
}

impl ScaleFactor for EinsteinDeSitter {
    fn comoving_a(&self, time: f64) -> f64 {
        self.a0 * ((self.t0 + time) / self.t0).powf(2.0 / 3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_static_is_one() {
        let f = Static.step_factors(3.0, 3.5);
        assert_eq!(f.a_old, 1.0);
        assert_eq!(f.a_half, 1.0);
        assert_eq!(f.a_new, 1.0);
    }

    #[test]
    fn test_eds_growth() {
        let eds = EinsteinDeSitter::from_redshift(1.0, 1.0);
        assert_relative_eq!(eds.comoving_a(0.0), 0.5);
        assert_relative_eq!(eds.comoving_a(7.0), 2.0, epsilon = 1e-12);
        let f = eds.step_factors(0.0, 7.0);
        assert_relative_eq!(f.a_half, 1.25, epsilon = 1e-12);
        assert!(f.a_old < f.a_half && f.a_half < f.a_new);
    }
}
