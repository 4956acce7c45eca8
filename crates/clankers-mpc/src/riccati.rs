//! Discrete-time Riccati recursion with constraint projection.
//!
//! One backward step at node `k`, given the value function `(Sm, Sv, s)` at `k + 1`:
//!
//! ```text
//! H  = Rm + BᵀSB              G  = Pm + BᵀSA            g0 = Rv + BᵀSv
//! Dd = H⁻¹Dᵀ(DH⁻¹Dᵀ)⁻¹
//! K  = -(I - Dd·D)H⁻¹G - Dd·C        u_ff = -(I - Dd·D)H⁻¹g0 - Dd·e
//! Sm = Qm + AᵀSA + KᵀG + GᵀK + KᵀHK
//! Sv = Qv + AᵀSv + Kᵀg0 + Gᵀu_ff + KᵀH·u_ff
//! s  = q + s + u_ffᵀg0 + ½u_ffᵀH·u_ff
//! ```
//!
//! `Sm` is symmetrized and projected onto the PSD cone after every step.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::model::{LinearConstraint, LinearQuadraticApproximation, QuadraticCost};

/// Quadratic value function `s + Svᵀδx + ½δxᵀSm·δx` at one node.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueFunction {
    pub sm: DMatrix<f64>,
    pub sv: DVector<f64>,
    pub s: f64,
}

impl ValueFunction {
    pub fn zeros(state_dim: usize) -> Self {
        Self {
            sm: DMatrix::zeros(state_dim, state_dim),
            sv: DVector::zeros(state_dim),
            s: 0.0,
        }
    }

    /// Terminal boundary value; the Hessian is corrected to be PSD.
    pub fn from_terminal(cost: QuadraticCost) -> Self {
        let mut sm = symmetrize(&cost.sm);
        psd_correction(&mut sm);
        Self {
            sm,
            sv: cost.sv,
            s: cost.s,
        }
    }
}

/// Affine feedback law `δu = u_ff + K·δx` at one node.
///
/// `projected_gain` and `projected_feedforward` are the parts `-Dd·C` and `-Dd·e`
/// enforcing the equality constraints; they are zero for unconstrained nodes.
#[derive(Clone, Debug, PartialEq)]
pub struct NodePolicy {
    pub gain: DMatrix<f64>,
    pub feedforward: DVector<f64>,
    pub projected_gain: DMatrix<f64>,
    pub projected_feedforward: DVector<f64>,
}

/// Result of one backward step.
#[derive(Clone, Debug)]
pub struct RiccatiStep {
    pub value: ValueFunction,
    pub policy: NodePolicy,
    /// `u_ffᵀg0`: first-order term of the predicted cost change.
    pub d1: f64,
    /// `u_ffᵀH·u_ff`: second-order term of the predicted cost change.
    pub d2: f64,
}

/// `(M + Mᵀ) / 2`
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Clip negative eigenvalues of the symmetric matrix `m` to zero.
///
/// Returns `true` if the matrix was modified. A matrix that is already PSD is left
/// untouched bit for bit.
pub fn psd_correction(m: &mut DMatrix<f64>) -> bool {
    if m.is_empty() {
        return false;
    }
    let eigen = SymmetricEigen::new(m.clone());
    if eigen.eigenvalues.iter().all(|&l| l >= 0.0) {
        return false;
    }
    let clipped = eigen.eigenvalues.map(|l| l.max(0.0));
    let v = &eigen.eigenvectors;
    *m = symmetrize(&(v * DMatrix::from_diagonal(&clipped) * v.transpose()));
    true
}

/// Feedback and feedforward minimizing `½δuᵀHδu + δuᵀ(g0 + Gδx)` subject to the
/// optional equality constraint. `mu` regularizes `H`.
///
/// Returns `None` when the regularized `H` is not positive definite.
pub fn projected_gains(
    h: &DMatrix<f64>,
    mu: f64,
    g: &DMatrix<f64>,
    g0: &DVector<f64>,
    constraint: Option<&LinearConstraint>,
) -> Option<NodePolicy> {
    let m = h.nrows();
    let n = g.ncols();
    let h_reg = symmetrize(h) + DMatrix::identity(m, m) * mu;
    let chol = h_reg.cholesky()?;
    let hinv_g = chol.solve(g);
    let hinv_g0 = chol.solve(g0);

    let Some(constraint) = constraint.filter(|c| c.num_constraints() > 0) else {
        return Some(NodePolicy {
            gain: -hinv_g,
            feedforward: -hinv_g0,
            projected_gain: DMatrix::zeros(m, n),
            projected_feedforward: DVector::zeros(m),
        });
    };

    let hinv_dt = chol.solve(&constraint.d.transpose());
    let dhd = &constraint.d * &hinv_dt;
    let dhd_inv = match dhd.clone().cholesky() {
        Some(c) => c.inverse(),
        None => dhd.pseudo_inverse(1e-12).ok()?,
    };
    let dd = hinv_dt * dhd_inv;
    let nullspace = DMatrix::identity(m, m) - &dd * &constraint.d;
    let projected_gain = -(&dd * &constraint.c);
    let projected_feedforward = -(&dd * &constraint.e);
    Some(NodePolicy {
        gain: -(&nullspace * hinv_g) + &projected_gain,
        feedforward: -(&nullspace * hinv_g0) + &projected_feedforward,
        projected_gain,
        projected_feedforward,
    })
}

/// One backward step on a discretized node.
///
/// Returns `None` when the regularized input Hessian is not positive definite.
pub fn riccati_step(
    lq: &LinearQuadraticApproximation,
    next: &ValueFunction,
    mu: f64,
) -> Option<RiccatiStep> {
    let s_a = &next.sm * &lq.a;
    let s_b = &next.sm * &lq.b;
    let bt = lq.b.transpose();
    let h = &lq.rm + &bt * &s_b;
    let g = &lq.pm + &bt * &s_a;
    let g0 = &lq.rv + &bt * &next.sv;

    let policy = projected_gains(&h, mu, &g, &g0, lq.constraint.as_ref())?;
    let k = &policy.gain;
    let uff = &policy.feedforward;
    let kt = k.transpose();
    let h_uff = &h * uff;

    let sm = &lq.qm + lq.a.transpose() * &s_a + &kt * &g + g.transpose() * k + &kt * &h * k;
    let sv = &lq.qv + lq.a.transpose() * &next.sv + &kt * &g0 + g.transpose() * uff + &kt * &h_uff;
    let d1 = uff.dot(&g0);
    let d2 = uff.dot(&h_uff);
    let s = lq.q + next.s + d1 + 0.5 * d2;

    let mut sm = symmetrize(&sm);
    psd_correction(&mut sm);
    Some(RiccatiStep {
        value: ValueFunction { sm, sv, s },
        policy,
        d1,
        d2,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};
    use proptest::prelude::*;

    use super::*;

    fn scalar_lq(a: f64, b: f64, q: f64, r: f64) -> LinearQuadraticApproximation {
        let mut lq = LinearQuadraticApproximation::zeros(1, 1);
        lq.a = dmatrix![a];
        lq.b = dmatrix![b];
        lq.qm = dmatrix![q];
        lq.rm = dmatrix![r];
        lq
    }

    fn sorted_eigenvalues(m: &DMatrix<f64>) -> Vec<f64> {
        let mut values: Vec<f64> = SymmetricEigen::new(m.clone()).eigenvalues.iter().copied().collect();
        values.sort_by(f64::total_cmp);
        values
    }

    #[test]
    fn psd_correction_clips_negative_eigenvalue() {
        let mut m = dmatrix![1.0, 0.0; 0.0, -2.0];
        assert!(psd_correction(&mut m));
        assert_relative_eq!(m, dmatrix![1.0, 0.0; 0.0, 0.0], epsilon = 1e-12);
    }

    #[test]
    fn psd_correction_is_noop_on_psd_input() {
        let original = dmatrix![2.0, 0.5; 0.5, 1.0];
        let mut m = original.clone();
        assert!(!psd_correction(&mut m));
        assert_eq!(m, original);
    }

    #[test]
    fn scalar_recursion_converges_to_dare() {
        let (a, b, q, r) = (1.05, 0.1, 1.0, 0.5);
        let lq = scalar_lq(a, b, q, r);
        let mut value = ValueFunction::zeros(1);
        for _ in 0..2000 {
            value = riccati_step(&lq, &value, 0.0).unwrap().value;
        }
        // b²S² + (r - qb² - a²r)S - qr = 0
        let c1 = r - q * b * b - a * a * r;
        let expected = (-c1 + (c1 * c1 + 4.0 * b * b * q * r).sqrt()) / (2.0 * b * b);
        assert_relative_eq!(value.sm[(0, 0)], expected, epsilon = 1e-8);

        let step = riccati_step(&lq, &value, 0.0).unwrap();
        let k_expected = -(a * b * expected) / (r + b * b * expected);
        assert_relative_eq!(step.policy.gain[(0, 0)], k_expected, epsilon = 1e-8);
    }

    #[test]
    fn unconstrained_gains_solve_the_stationarity_condition() {
        let h = dmatrix![2.0, 0.3; 0.3, 1.0];
        let g = dmatrix![1.0, 0.0, 2.0; 0.5, -1.0, 0.0];
        let g0 = dvector![0.2, -0.4];
        let policy = projected_gains(&h, 0.0, &g, &g0, None).unwrap();
        assert_relative_eq!(&h * &policy.gain + &g, DMatrix::zeros(2, 3), epsilon = 1e-12);
        assert_relative_eq!(&h * &policy.feedforward + &g0, DVector::zeros(2), epsilon = 1e-12);
        assert_relative_eq!(policy.projected_gain, DMatrix::zeros(2, 3));
    }

    #[test]
    fn projected_gains_satisfy_the_constraint() {
        let h = dmatrix![2.0, 0.3, 0.0; 0.3, 1.0, 0.1; 0.0, 0.1, 3.0];
        let g = dmatrix![1.0, 0.0; 0.5, -1.0; 0.2, 0.3];
        let g0 = dvector![0.2, -0.4, 1.0];
        let constraint = LinearConstraint {
            c: dmatrix![1.0, 2.0],
            d: dmatrix![0.0, 0.0, 1.0],
            e: dvector![0.7],
        };
        let policy = projected_gains(&h, 1e-6, &g, &g0, Some(&constraint)).unwrap();

        // D·K + C = 0 and D·u_ff + e = 0
        assert_relative_eq!(&constraint.d * &policy.gain + &constraint.c, DMatrix::zeros(1, 2), epsilon = 1e-10);
        assert_relative_eq!(&constraint.d * &policy.feedforward + &constraint.e, DVector::zeros(1), epsilon = 1e-10);
        assert_relative_eq!(policy.projected_feedforward[2], -0.7, epsilon = 1e-10);
    }

    #[test]
    fn non_convex_input_hessian_is_reported() {
        let h = dmatrix![-1.0];
        assert!(projected_gains(&h, 0.0, &dmatrix![0.0], &dvector![0.0], None).is_none());
        assert!(projected_gains(&h, 2.0, &dmatrix![0.0], &dvector![0.0], None).is_some());
    }

    #[test]
    fn predicted_change_matches_lq_step() {
        // Single step, zero terminal value: optimal cost change is -½ g0ᵀH⁻¹g0.
        let mut lq = scalar_lq(1.0, 1.0, 0.0, 2.0);
        lq.rv = dvector![1.0];
        let step = riccati_step(&lq, &ValueFunction::zeros(1), 0.0).unwrap();
        assert_relative_eq!(step.d1 + 0.5 * step.d2, -0.25, epsilon = 1e-12);
        assert_relative_eq!(step.value.s, -0.25, epsilon = 1e-12);
    }

    fn symmetric_matrix(n: usize) -> impl Strategy<Value = DMatrix<f64>> {
        prop::collection::vec(-10.0f64..10.0, n * n).prop_map(move |data| {
            let m = DMatrix::from_vec(n, n, data);
            symmetrize(&m)
        })
    }

    proptest! {
        #[test]
        fn corrected_eigenvalues_are_clipped(m in symmetric_matrix(4)) {
            let before = sorted_eigenvalues(&m);
            let mut corrected = m.clone();
            psd_correction(&mut corrected);
            let after = sorted_eigenvalues(&corrected);
            for (b, a) in before.iter().zip(&after) {
                prop_assert!((b.max(0.0) - a).abs() < 1e-8, "{before:?} -> {after:?}");
            }
        }

        #[test]
        fn correction_never_touches_psd_matrices(data in prop::collection::vec(-3.0f64..3.0, 9)) {
            let a = DMatrix::from_vec(3, 3, data);
            let m = a.transpose() * &a + DMatrix::identity(3, 3) * 1e-3;
            let mut corrected = m.clone();
            prop_assert!(!psd_correction(&mut corrected));
            prop_assert_eq!(corrected, m);
        }
    }
}
