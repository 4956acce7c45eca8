//! Continuous-time Riccati backward pass over one mode segment.
//!
//! The segment `[ts, tf]` is mapped onto the rescaled time `z = (tf - t) / (tf - ts)`,
//! so every segment is integrated over `z ∈ [0, 1]` with the same fixed-step RK4
//! scheme, whatever its duration. With `K` and `u_ff` the projected gains at `t`:
//!
//! ```text
//! dSm/dz = (tf - ts)·(Qm + AᵀSm + SmA + KᵀG + GᵀK + KᵀRmK)       G = Pm + BᵀSm
//! dSv/dz = (tf - ts)·(Qv + AᵀSv + Kᵀg + Gᵀu_ff + KᵀRm·u_ff)      g = Rv + BᵀSv
//! ds/dz  = (tf - ts)·(q + u_ffᵀg + ½u_ffᵀRm·u_ff)
//! ```
//!
//! Without constraints this reduces to the usual `Qm + AᵀSm + SmA - GᵀRm⁻¹G`.

use crate::model::LinearQuadraticApproximation;
use crate::riccati::{NodePolicy, ValueFunction, projected_gains, psd_correction, symmetrize};

/// Node values and policies of one integrated segment.
#[derive(Clone, Debug)]
pub struct SegmentSolution {
    /// Value function at each node time of the segment.
    pub values: Vec<ValueFunction>,
    /// Policy of each node interval, evaluated at the interval start.
    pub policies: Vec<NodePolicy>,
    pub d1: f64,
    pub d2: f64,
}

impl ValueFunction {
    fn add_scaled(&self, h: f64, rate: &ValueFunction) -> ValueFunction {
        ValueFunction {
            sm: &self.sm + &rate.sm * h,
            sv: &self.sv + &rate.sv * h,
            s: self.s + rate.s * h,
        }
    }
}

/// `-d/dt` of the value function under the projected policy, and that policy.
fn value_rate(
    lq: &LinearQuadraticApproximation,
    value: &ValueFunction,
    mu: f64,
) -> Option<(ValueFunction, NodePolicy)> {
    let bt = lq.b.transpose();
    let g = &lq.pm + &bt * &value.sm;
    let g0 = &lq.rv + &bt * &value.sv;
    let policy = projected_gains(&lq.rm, mu, &g, &g0, lq.constraint.as_ref())?;

    let k = &policy.gain;
    let uff = &policy.feedforward;
    let kt = k.transpose();
    let rm_uff = &lq.rm * uff;
    let at = lq.a.transpose();

    let sm = &lq.qm + &at * &value.sm + &value.sm * &lq.a + &kt * &g + g.transpose() * k + &kt * &lq.rm * k;
    let sv = &lq.qv + &at * &value.sv + &kt * &g0 + g.transpose() * uff + &kt * &rm_uff;
    let s = lq.q + uff.dot(&g0) + 0.5 * uff.dot(&rm_uff);
    Some((ValueFunction { sm, sv, s }, policy))
}

/// Interval `k` with `times[k] <= t < times[k + 1]`, clamped to the segment.
fn interval_at(times: &[f64], t: f64) -> usize {
    times.partition_point(|&node| node <= t).saturating_sub(1).min(times.len() - 2)
}

/// Integrate the Riccati ODE backward over the node times `times` of one mode segment.
///
/// `lqs[k]` is the continuous-time approximation held over `[times[k], times[k + 1])`.
/// Uses `steps_per_interval` RK4 steps per node interval. Returns `None` when the
/// regularized input Hessian is not positive definite somewhere in the segment.
pub fn integrate_segment(
    times: &[f64],
    lqs: &[LinearQuadraticApproximation],
    terminal: &ValueFunction,
    steps_per_interval: usize,
    mu: f64,
) -> Option<SegmentSolution> {
    if times.len() < 2 {
        return Some(SegmentSolution {
            values: vec![terminal.clone()],
            policies: Vec::new(),
            d1: 0.0,
            d2: 0.0,
        });
    }
    debug_assert_eq!(lqs.len(), times.len() - 1);

    let ts = times[0];
    let tf = times[times.len() - 1];
    let span = tf - ts;
    let num_steps = steps_per_interval.max(1) * (times.len() - 1);
    let dz = 1.0 / num_steps as f64;

    let rate = |z: f64, value: &ValueFunction| -> Option<ValueFunction> {
        let t = tf - z * span;
        let (rate, _) = value_rate(&lqs[interval_at(times, t)], value, mu)?;
        Some(ValueFunction {
            sm: rate.sm * span,
            sv: rate.sv * span,
            s: rate.s * span,
        })
    };

    let mut samples = Vec::with_capacity(num_steps + 1);
    samples.push(terminal.clone());
    let mut value = terminal.clone();
    for step in 0..num_steps {
        let z = step as f64 * dz;
        let k1 = rate(z, &value)?;
        let k2 = rate(z + 0.5 * dz, &value.add_scaled(0.5 * dz, &k1))?;
        let k3 = rate(z + 0.5 * dz, &value.add_scaled(0.5 * dz, &k2))?;
        let k4 = rate(z + dz, &value.add_scaled(dz, &k3))?;
        let sum = ValueFunction {
            sm: k1.sm + k2.sm * 2.0 + k3.sm * 2.0 + k4.sm,
            sv: k1.sv + k2.sv * 2.0 + k3.sv * 2.0 + k4.sv,
            s: k1.s + 2.0 * k2.s + 2.0 * k3.s + k4.s,
        };
        value = value.add_scaled(dz / 6.0, &sum);
        value.sm = symmetrize(&value.sm);
        psd_correction(&mut value.sm);
        samples.push(value.clone());
    }

    // Node values: linear interpolation between samples keeps Sm PSD.
    let values: Vec<ValueFunction> = times
        .iter()
        .map(|&t| {
            let z = ((tf - t) / span).clamp(0.0, 1.0) * num_steps as f64;
            let lo = (z.floor() as usize).min(num_steps);
            let hi = (lo + 1).min(num_steps);
            let w = z - lo as f64;
            if w <= 0.0 || lo == hi {
                return samples[lo].clone();
            }
            ValueFunction {
                sm: &samples[lo].sm * (1.0 - w) + &samples[hi].sm * w,
                sv: &samples[lo].sv * (1.0 - w) + &samples[hi].sv * w,
                s: samples[lo].s * (1.0 - w) + samples[hi].s * w,
            }
        })
        .collect();

    let mut policies = Vec::with_capacity(lqs.len());
    let (mut d1, mut d2) = (0.0, 0.0);
    for (k, lq) in lqs.iter().enumerate() {
        let dt = times[k + 1] - times[k];
        let (_, policy) = value_rate(lq, &values[k], mu)?;
        let g0 = &lq.rv + lq.b.transpose() * &values[k].sv;
        d1 += dt * policy.feedforward.dot(&g0);
        d2 += dt * policy.feedforward.dot(&(&lq.rm * &policy.feedforward));
        policies.push(policy);
    }

    Some(SegmentSolution {
        values,
        policies,
        d1,
        d2,
    })
}
