use glam::DVec3;

/// One mass-carrying particle.
///
/// `aux` holds the species-specific extra reals read after the velocity
/// (angle/energy terms for relativistic species); it is zero otherwise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub id: u64,
    pub pos: DVec3,
    pub vel: DVec3,
    pub mass: f64,
    pub aux: DVec3,
}

impl Particle {
    pub fn new(id: u64, pos: DVec3, vel: DVec3, mass: f64) -> Self {
        Self {
            id,
            pos,
            vel,
            mass,
            aux: DVec3::ZERO,
        }
    }

    /// Lorentz factor `1 / sqrt(1 - v^2 / c^2)`, clamped for superluminal input.
    pub fn gamma(&self, c_squared: f64) -> f64 {
        let beta2 = (self.vel.length_squared() / c_squared).min(1.0 - 1e-12);
        1.0 / (1.0 - beta2).sqrt()
    }

    pub fn momentum(&self) -> DVec3 {
        self.vel * self.mass
    }

    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.vel.length_squared()
    }
}

/// Half-step velocity update with comoving scale factors.
///
/// `v <- (a_prev * v + half_dt * accel) / a_cur`
#[inline]
pub fn kick(p: &mut Particle, accel: DVec3, half_dt: f64, a_prev: f64, a_cur: f64) {
    p.vel = (p.vel * a_prev + accel * half_dt) / a_cur;
}

/// Full-step position update using the current (half-time) velocity.
#[inline]
pub fn drift(p: &mut Particle, dt: f64, a_cur: f64) {
    p.pos += p.vel * (dt / a_cur);
}
