//! Closed-form maximum-likelihood estimate of the off-pulse background in one bin.
//!
//! With `n` on-pulse and `b` off-pulse counts, an on/off exposure ratio `a`, pulsar strength
//! `N` and PSF fraction `m`, the background `v` that maximises
//! `n·ln(N·m + a·v) − (N·m + a·v) + b·ln(v) − v` is the positive root of
//! `a(1+a)·v² + (N·m(1+a) − a(b+n))·v − b·N·m = 0`.

/// Estimated background with its partials in `m` and `N`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub v: f64,
    pub dv_dm: f64,
    pub dv_dn: f64,
}

/// Outcome of the background estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Background {
    Physical(Estimate),
    /// The discriminant of the quadratic is negative: no real background exists.
    Unphysical { discriminant: f64 },
}

impl Background {
    pub fn physical(self) -> Option<Estimate> {
        match self {
            Background::Physical(estimate) => Some(estimate),
            Background::Unphysical { .. } => None,
        }
    }
}

/// Observed counts of one pulsar in one bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnOff {
    /// On/off exposure ratio.
    pub alpha: f64,
    pub on: f64,
    pub off: f64,
}

impl OnOff {
    #[inline]
    pub fn discriminant(&self, m: f64, strength: f64) -> f64 {
        let (a, b) = (self.alpha, self.off);
        let mn = m * strength;
        let linear = mn * (1.0 + a) - a * (b + self.on);
        4.0 * a * (1.0 + a) * b * mn + linear.powi(2)
    }

    /// Background estimate only.
    #[inline]
    pub fn value(&self, m: f64, strength: f64) -> Option<f64> {
        let discriminant = self.discriminant(m, strength);
        if discriminant < 0.0 {
            return None;
        }
        let a = self.alpha;
        let v = (a * (self.off + self.on) - m * strength * (1.0 + a) + discriminant.sqrt())
            / (2.0 * a * (1.0 + a));
        Some(clamp_round_off(v, self.off + self.on))
    }

    /// Background estimate and its partials, evaluated at PSF fraction `m` and pulsar
    /// `strength`. The discriminant is non-negative for non-negative counts.
    pub fn estimate(&self, m: f64, strength: f64) -> Background {
        let discriminant = self.discriminant(m, strength);
        if discriminant < 0.0 {
            return Background::Unphysical { discriminant };
        }
        let (a, b) = (self.alpha, self.off);
        let norm = 2.0 * a * (1.0 + a);
        let root = discriminant.sqrt();
        let mn = m * strength;
        let linear = mn * (1.0 + a) - a * (b + self.on);
        let v = (a * (b + self.on) - mn * (1.0 + a) + root) / norm;

        // ∂D/∂m = (4a(1+a)b + 2(1+a)·linear)·N, and symmetrically for N
        let common = 4.0 * a * (1.0 + a) * b + 2.0 * (1.0 + a) * linear;
        let dv_dm = (-(1.0 + a) * strength + common * strength / (2.0 * root)) / norm;
        let dv_dn = (-(1.0 + a) * m + common * m / (2.0 * root)) / norm;
        Background::Physical(Estimate {
            v: clamp_round_off(v, b + self.on),
            dv_dm,
            dv_dn,
        })
    }
}

/// Clamps a negative estimate that is within round-off of zero.
#[inline]
fn clamp_round_off(v: f64, scale: f64) -> f64 {
    if v < 0.0 && -v <= 64.0 * f64::EPSILON * scale.max(1.0) {
        0.0
    } else {
        v
    }
}
