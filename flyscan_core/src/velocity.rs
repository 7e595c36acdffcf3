//! Velocity profile solver.
//!
//! A profile ramps from `v1` to a plateau `vm`, holds it for `tm`, ramps to
//! `v2` and optionally settles at `v2`. Given a distance and a minimum time,
//! the solver finds the plateau that covers exactly that distance, stretching
//! time when the distance cannot be covered in `min_time` under the
//! acceleration and velocity limits. It never fails.

use crate::util::ceil_to_multiple;

const EPS: f64 = 1e-12;
const MAX_STRETCH: usize = 64;
const MAX_QUANTIZE: usize = 256;

/// Kinematic limits shared by every profile of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// EGU/s^2, > 0.
    pub acceleration: f64,
    /// EGU/s, > 0.
    pub max_velocity: f64,
    /// Seconds spent at `v2` after the final ramp.
    pub settle: f64,
    /// Breakpoint quantum in seconds; 0 disables quantization.
    pub min_interval: f64,
}

/// Piecewise-linear velocity profile over `[0, t_total]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityProfile {
    pub v1: f64,
    pub v2: f64,
    pub distance: f64,
    pub limits: Limits,
    pub vm: f64,
    pub t1: f64,
    pub tm: f64,
    pub t2: f64,
    /// Settle segment actually used (quantized when the profile is).
    pub ts: f64,
}

impl VelocityProfile {
    /// Solve for the profile traversing `distance` in at least `min_time`.
    pub fn solve(v1: f64, v2: f64, distance: f64, min_time: f64, limits: Limits) -> Self {
        let mut p = Self {
            v1,
            v2,
            distance,
            limits,
            vm: v1,
            t1: 0.0,
            tm: 0.0,
            t2: 0.0,
            ts: limits.settle.max(0.0),
        };
        p.solve_from(min_time);
        p
    }

    pub fn t_total(&self) -> f64 {
        self.t1 + self.tm + self.t2 + self.ts
    }

    fn a(&self) -> f64 {
        self.limits.acceleration
    }

    /// Distance left for the ramps and plateau once the settle is subtracted.
    fn ramp_distance(&self) -> f64 {
        self.distance - self.v2 * self.ts
    }

    fn solve_from(&mut self, min_time: f64) {
        let a = self.a();
        let (v1, v2) = (self.v1, self.v2);
        let d = self.ramp_distance();
        let t_change = (v2 - v1).abs() / a;
        let mut t = (min_time - self.ts).max(t_change);

        for _ in 0..MAX_STRETCH {
            let (d_trough, d_peak) = (self.distance_at_trough(t), self.distance_at_peak(t));
            let candidate = if d > d_peak + EPS {
                let vm = (a * d + (v1 * v1 + v2 * v2) / 2.0).max(0.0).sqrt();
                Some((2.0 * vm - v1 - v2) / a)
            } else if d < d_trough - EPS {
                let vm = -((v1 * v1 + v2 * v2) / 2.0 - a * d).max(0.0).sqrt();
                Some((v1 + v2 - 2.0 * vm) / a)
            } else {
                None
            };
            if let Some(stretched) = candidate {
                t = if stretched > t + EPS { stretched } else { t * 1.1 + EPS };
                continue;
            }

            let vm = self.plateau_for(t, d);
            let v_max = self.limits.max_velocity;
            if vm.abs() > v_max + 1e-9 {
                let clamped = v_max.copysign(vm);
                let new_t = self.trapezoid_time(clamped, d);
                t = match new_t {
                    Some(nt) if nt > t + EPS => nt,
                    _ => t * 1.1 + EPS,
                };
                continue;
            }
            self.set_plateau(vm, t);
            return;
        }

        // Only reached with inconsistent limits; keep the last plateau found.
        let vm = self.plateau_for(t, d).clamp(-self.limits.max_velocity, self.limits.max_velocity);
        self.set_plateau(vm, t);
    }

    fn set_plateau(&mut self, vm: f64, t: f64) {
        let a = self.a();
        self.vm = vm;
        self.t1 = (vm - self.v1).abs() / a;
        self.t2 = (self.v2 - vm).abs() / a;
        self.tm = (t - self.t1 - self.t2).max(0.0);
    }

    fn distance_at_peak(&self, t: f64) -> f64 {
        let vm = (self.a() * t + self.v1 + self.v2) / 2.0;
        self.distance_for(vm, t)
    }

    fn distance_at_trough(&self, t: f64) -> f64 {
        let vm = (self.v1 + self.v2 - self.a() * t) / 2.0;
        self.distance_for(vm, t)
    }

    /// Distance covered by ramps plus plateau `vm` in ramp time `t`.
    fn distance_for(&self, vm: f64, t: f64) -> f64 {
        let a = self.a();
        let t1 = (vm - self.v1).abs() / a;
        let t2 = (self.v2 - vm).abs() / a;
        let tm = (t - t1 - t2).max(0.0);
        (self.v1 + vm) / 2.0 * t1 + vm * tm + (vm + self.v2) / 2.0 * t2
    }

    /// Invert `distance_for` at fixed `t`, choosing the zone by monotonicity.
    fn plateau_for(&self, t: f64, d: f64) -> f64 {
        let a = self.a();
        let (v1, v2) = (self.v1, self.v2);
        let v_low = v1.min(v2);
        let v_high = v1.max(v2);
        let sq = (v1 * v1 + v2 * v2) / 2.0;
        if d >= self.distance_for(v_high, t) {
            let b = a * t + v1 + v2;
            let disc = (b * b - 4.0 * (sq + a * d)).max(0.0);
            (b - disc.sqrt()) / 2.0
        } else if d <= self.distance_for(v_low, t) {
            let b = a * t - v1 - v2;
            let disc = (b * b - 4.0 * (sq - a * d)).max(0.0);
            (-b + disc.sqrt()) / 2.0
        } else {
            let tm = t - (v2 - v1).abs() / a;
            if tm <= EPS {
                return v_high;
            }
            let s = (v2 - v1).signum();
            (d - s * (v2 * v2 - v1 * v1) / (2.0 * a)) / tm
        }
    }

    /// Ramp time of a trapezoid at plateau `vm` covering `d`, if one exists.
    fn trapezoid_time(&self, vm: f64, d: f64) -> Option<f64> {
        if vm.abs() <= EPS {
            return None;
        }
        let a = self.a();
        let (v1, v2) = (self.v1, self.v2);
        let ramps = (vm - v1).abs() / a + (vm - v2).abs() / a;
        let ramp_distance = (v1 + vm) / 2.0 * ((vm - v1).abs() / a) + (vm + v2) / 2.0 * ((vm - v2).abs() / a);
        let tm = (d - ramp_distance) / vm;
        (tm >= -EPS).then(|| ramps + tm.max(0.0))
    }

    /// Whether any non-empty segment is shorter than `min_interval`.
    pub fn check_quantize(&self) -> bool {
        let q = self.limits.min_interval;
        q > 0.0
            && [self.t1, self.tm, self.t2, self.ts]
                .iter()
                .any(|&seg| seg > EPS && seg < q - EPS)
    }

    /// Round every segment up to a multiple of `min_interval` while keeping the
    /// covered distance exact. The ramp time is widened one quantum at a time
    /// until a plateau exists that respects both limits.
    pub fn quantize(&mut self) {
        let q = self.limits.min_interval;
        if q <= 0.0 {
            return;
        }
        let a = self.a();
        let v_max = self.limits.max_velocity;
        let (v1, v2) = (self.v1, self.v2);
        let ts = ceil_to_multiple(self.ts, q);
        let d = self.distance - v2 * ts;
        let limits = Limits { settle: ts, ..self.limits };
        let mut ramp_total = ceil_to_multiple(self.t1 + self.tm + self.t2, q);

        for _ in 0..MAX_QUANTIZE {
            let cont = Self::solve(v1, v2, self.distance, ramp_total + ts, limits);
            let cont_ramps = cont.t1 + cont.tm + cont.t2;
            if cont_ramps <= EPS && (cont.vm - v1).abs() <= EPS {
                *self = Self { ts, ..cont };
                return;
            }
            if cont_ramps > ramp_total + 1e-9 {
                ramp_total = ceil_to_multiple(cont_ramps, q);
                continue;
            }
            let mut t1 = ceil_to_multiple(cont.t1, q);
            let mut t2 = ceil_to_multiple(cont.t2, q);
            for _ in 0..8 {
                if t1 + t2 > ramp_total + EPS {
                    break;
                }
                let tm = (ramp_total - t1 - t2).max(0.0);
                let denom = t1 / 2.0 + tm + t2 / 2.0;
                if denom <= EPS {
                    break;
                }
                let vm = (d - v1 * t1 / 2.0 - v2 * t2 / 2.0) / denom;
                if ramp_violates(v1, vm, t1, a) {
                    t1 += q;
                    continue;
                }
                if ramp_violates(vm, v2, t2, a) {
                    t2 += q;
                    continue;
                }
                if vm.abs() > v_max + 1e-9 {
                    break;
                }
                self.ts = ts;
                self.vm = vm;
                self.t1 = t1;
                self.tm = tm;
                self.t2 = t2;
                return;
            }
            ramp_total += q;
        }
        tracing::warn!(v1, v2, distance = self.distance, "profile quantization did not settle");
    }

    /// Breakpoint times and velocities, starting at 0, with coincident
    /// breakpoints merged.
    ///
    /// The ramps and plateau give at most 4 breakpoints. A non-zero settle
    /// holds `v2` after the last ramp and adds a fifth.
    pub fn make_arrays(&self) -> (Vec<f64>, Vec<f64>) {
        let b1 = self.t1;
        let b2 = b1 + self.tm;
        let b3 = b2 + self.t2;
        let b4 = b3 + self.ts;
        let raw = [(0.0, self.v1), (b1, self.vm), (b2, self.vm), (b3, self.v2), (b4, self.v2)];
        let mut times: Vec<f64> = Vec::with_capacity(raw.len());
        let mut velocities = Vec::with_capacity(raw.len());
        for (t, v) in raw {
            if let Some(&last) = times.last()
                && t - last <= EPS
            {
                continue;
            }
            times.push(t);
            velocities.push(v);
        }
        (times, velocities)
    }

    /// Displacement from the start after `t` seconds.
    pub fn position_at(&self, t: f64) -> f64 {
        let (times, velocities) = self.make_arrays();
        let mut x = 0.0;
        for i in 1..times.len() {
            let (t0, t1) = (times[i - 1], times[i]);
            if t <= t0 {
                break;
            }
            let (v0, v1) = (velocities[i - 1], velocities[i]);
            let end = t.min(t1);
            let frac = if t1 > t0 { (end - t0) / (t1 - t0) } else { 0.0 };
            let v_end = v0 + (v1 - v0) * frac;
            x += (v0 + v_end) / 2.0 * (end - t0);
        }
        if t > self.t_total() {
            x += self.v2 * (t - self.t_total());
        }
        x
    }

    /// Largest |v| reached.
    pub fn peak_speed(&self) -> f64 {
        self.v1.abs().max(self.vm.abs()).max(self.v2.abs())
    }

    /// Exact integral of the profile.
    pub fn integral(&self) -> f64 {
        (self.v1 + self.vm) / 2.0 * self.t1
            + self.vm * self.tm
            + (self.vm + self.v2) / 2.0 * self.t2
            + self.v2 * self.ts
    }
}

fn ramp_violates(from: f64, to: f64, t: f64, a: f64) -> bool {
    let dv = (to - from).abs();
    if t <= EPS {
        dv > 1e-9
    } else {
        dv / t > a * (1.0 + 1e-9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn limits(a: f64, v_max: f64) -> Limits {
        Limits {
            acceleration: a,
            max_velocity: v_max,
            settle: 0.0,
            min_interval: 0.0,
        }
    }

    #[test]
    fn zero_distance_with_matching_velocities_dips_negative() {
        let p = VelocityProfile::solve(0.5, 0.5, 0.0, 1.0, limits(2.0, 1.0));
        let (t, v) = p.make_arrays();
        assert_eq!(t.len(), 3);
        assert!((t[1] - 0.5).abs() < 1e-12 && (t[2] - 1.0).abs() < 1e-12);
        assert!((v[0] - 0.5).abs() < 1e-12);
        assert!((v[1] + 0.5).abs() < 1e-12);
        assert!((v[2] - 0.5).abs() < 1e-12);
        assert!(p.integral().abs() < 1e-12);
    }

    #[rstest]
    #[case(0.0, 0.0, 1.0, 0.0)]
    #[case(0.0, 0.0, -1.0, 0.0)]
    #[case(0.25, -0.25, 0.0, 0.0)]
    #[case(0.25, 0.25, 0.1, 2.0)]
    #[case(-0.8, 0.3, -0.5, 0.3)]
    fn covers_distance_exactly(#[case] v1: f64, #[case] v2: f64, #[case] d: f64, #[case] min_t: f64) {
        let p = VelocityProfile::solve(v1, v2, d, min_t, limits(2.5, 1.0));
        assert!((p.integral() - d).abs() < 1e-9, "{p:?}");
        assert!(p.t_total() >= min_t - 1e-12);
        assert!(p.peak_speed() <= 1.0 + 1e-9);
    }

    #[test]
    fn long_move_is_velocity_limited() {
        let p = VelocityProfile::solve(0.0, 0.0, 10.0, 0.0, limits(2.0, 1.0));
        assert!((p.vm - 1.0).abs() < 1e-9);
        assert!((p.t1 - 0.5).abs() < 1e-9);
        assert!((p.t_total() - 10.5).abs() < 1e-9);
    }

    #[test]
    fn settle_is_appended_at_final_velocity() {
        let mut l = limits(2.0, 1.0);
        l.settle = 0.2;
        let p = VelocityProfile::solve(0.0, 0.5, 1.0, 0.0, l);
        assert!((p.integral() - 1.0).abs() < 1e-9);
        let (t, v) = p.make_arrays();
        assert_eq!(*v.last().unwrap(), 0.5);
        assert!((t[t.len() - 1] - t[t.len() - 2] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn quantize_rounds_segments_and_keeps_distance() {
        let mut l = limits(2.5, 1.0);
        l.min_interval = 0.05;
        let mut p = VelocityProfile::solve(0.25, -0.25, 0.0, 0.0, l);
        p.quantize();
        assert!((p.integral()).abs() < 1e-9);
        for seg in [p.t1, p.tm, p.t2] {
            let n = seg / 0.05;
            assert!((n - n.round()).abs() < 1e-6, "segment {seg}");
        }
        assert!(p.peak_speed() <= 1.0 + 1e-9);
        assert!((p.vm - p.v1).abs() <= 2.5 * p.t1 * (1.0 + 1e-9) + 1e-12);
    }

    #[test]
    fn short_segments_request_quantization() {
        let mut l = limits(2.5, 1.0);
        l.min_interval = 0.05;
        let p = VelocityProfile::solve(0.0, 0.0, 0.001, 0.0, l);
        assert!(p.check_quantize());
        l.min_interval = 0.0;
        assert!(!VelocityProfile::solve(0.0, 0.0, 0.001, 0.0, l).check_quantize());
    }

    #[test]
    fn position_at_end_is_distance() {
        let p = VelocityProfile::solve(0.25, 0.25, 0.1, 0.3, limits(2.5, 1.0));
        assert!((p.position_at(p.t_total()) - 0.1).abs() < 1e-9);
        assert_eq!(p.position_at(0.0), 0.0);
    }

    proptest! {
        #[test]
        fn solver_invariants(
            v1 in -0.9f64..0.9,
            v2 in -0.9f64..0.9,
            d in -5.0f64..5.0,
            min_t in 0.0f64..3.0,
            a in 0.5f64..10.0,
        ) {
            let p = VelocityProfile::solve(v1, v2, d, min_t, limits(a, 1.0));
            prop_assert!((p.integral() - d).abs() < 1e-9);
            prop_assert!(p.peak_speed() <= 1.0 + 1e-9);
            prop_assert!(p.t_total() >= min_t - 1e-9);
            prop_assert!(p.make_arrays().0.len() <= 4);
            prop_assert!(p.tm >= 0.0);
        }

        #[test]
        fn settle_holds_final_velocity(
            v1 in -0.9f64..0.9,
            v2 in -0.9f64..0.9,
            d in -5.0f64..5.0,
            min_t in 0.0f64..3.0,
            settle in 0.0f64..0.5,
        ) {
            let mut l = limits(2.0, 1.0);
            l.settle = settle;
            let p = VelocityProfile::solve(v1, v2, d, min_t, l);
            prop_assert!((p.integral() - d).abs() < 1e-9);
            prop_assert!(p.peak_speed() <= 1.0 + 1e-9);
            prop_assert!(p.t_total() >= min_t - 1e-9);
            let (t, v) = p.make_arrays();
            let settles = p.ts > EPS;
            prop_assert!(t.len() <= 4 + usize::from(settles));
            if settles {
                let n = t.len();
                prop_assert!((t[n - 1] - t[n - 2] - p.ts).abs() < 1e-9);
                prop_assert!((v[n - 1] - v2).abs() < 1e-9 && (v[n - 2] - v2).abs() < 1e-9);
            }
        }

        #[test]
        fn quantized_profiles_keep_invariants(
            v1 in -0.9f64..0.9,
            v2 in -0.9f64..0.9,
            d in -2.0f64..2.0,
            a in 1.0f64..10.0,
        ) {
            let mut l = limits(a, 1.0);
            l.min_interval = 0.002;
            let mut p = VelocityProfile::solve(v1, v2, d, 0.0, l);
            p.quantize();
            prop_assert!((p.integral() - d).abs() < 1e-9);
            prop_assert!(p.peak_speed() <= 1.0 + 1e-9);
        }
    }
}
