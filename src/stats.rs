/// Numerics kernel: χ²₁ survival function, median, float comparison, and a
/// dense symmetric LDLᵀ factorisation whose D vector stays inspectable (the
/// positive-definiteness and condition-number guards of the moment tables
/// read it directly).
use ndarray::{Array1, Array2, ArrayView1};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Survival function of the 1-df chi-square: P(χ²₁ > x).
///
/// Non-finite or non-positive inputs map to p = 1.
pub fn pchisq(x: f64) -> f64 {
    if !x.is_finite() || x <= 0.0 {
        return 1.0;
    }
    let chi = ChiSquared::new(1.0).expect("χ²₁ distribution");
    chi.sf(x)
}

/// Median of a slice; the mean of the two central values for even lengths.
pub fn median(values: &[f64]) -> f64 {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = v.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 0 {
        (v[n / 2 - 1] + v[n / 2]) / 2.0
    } else {
        v[n / 2]
    }
}

/// Machine-epsilon float comparison, used for the B2 ≈ 0 degeneracy check.
pub fn float_equal(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() <= f64::EPSILON
}

// ---------------------------------------------------------------------------
// LDLᵀ factorisation
// ---------------------------------------------------------------------------

/// LDLᵀ factorisation of a symmetric matrix, without pivoting.
///
/// The factorisation proceeds even when A is indefinite; callers inspect
/// `d_min()`/`d_max()` before trusting any solve.
pub struct Ldlt {
    l: Array2<f64>,
    d: Array1<f64>,
}

impl Ldlt {
    pub fn factor(a: &Array2<f64>) -> Ldlt {
        let n = a.nrows();
        debug_assert_eq!(n, a.ncols());
        let mut l = Array2::<f64>::eye(n);
        let mut d = Array1::<f64>::zeros(n);

        for j in 0..n {
            let mut dj = a[[j, j]];
            for k in 0..j {
                dj -= l[[j, k]] * l[[j, k]] * d[k];
            }
            d[j] = dj;
            for i in (j + 1)..n {
                let mut lij = a[[i, j]];
                for k in 0..j {
                    lij -= l[[i, k]] * l[[j, k]] * d[k];
                }
                l[[i, j]] = lij / dj;
            }
        }

        Ldlt { l, d }
    }

    /// Smallest pivot. Negative ⇒ the matrix is not positive definite;
    /// NaN propagates and fails the caller's `> 0` test.
    pub fn d_min(&self) -> f64 {
        self.d.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn d_max(&self) -> f64 {
        self.d.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Solve A·x = b via forward substitution, diagonal scaling, and back
    /// substitution.
    pub fn solve(&self, b: ArrayView1<f64>) -> Array1<f64> {
        let n = self.d.len();
        let mut x = b.to_owned();
        for i in 0..n {
            for k in 0..i {
                let l_ik = self.l[[i, k]];
                x[i] -= l_ik * x[k];
            }
        }
        for i in 0..n {
            x[i] /= self.d[i];
        }
        for i in (0..n).rev() {
            for k in (i + 1)..n {
                let l_ki = self.l[[k, i]];
                x[i] -= l_ki * x[k];
            }
        }
        x
    }

    /// Dense inverse, one unit-vector solve per column.
    pub fn inverse(&self) -> Array2<f64> {
        let n = self.d.len();
        let mut inv = Array2::<f64>::zeros((n, n));
        let mut e = Array1::<f64>::zeros(n);
        for j in 0..n {
            e.fill(0.0);
            e[j] = 1.0;
            let col = self.solve(e.view());
            inv.column_mut(j).assign(&col);
        }
        inv
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_pchisq_bounds() {
        assert_eq!(pchisq(0.0), 1.0);
        assert_eq!(pchisq(-3.0), 1.0);
        assert_eq!(pchisq(f64::NAN), 1.0);
        // χ²₁ = 3.841459 is the 0.05 critical value.
        assert!((pchisq(3.841_459) - 0.05).abs() < 1e-4);
        // Deep tail stays finite and positive.
        let p = pchisq(225.0);
        assert!(p > 0.0 && p < 1e-40, "p = {p}");
    }

    /// p = P(χ²₁ > z²) strictly decreases in |z|.
    #[test]
    fn test_pchisq_monotone_in_z() {
        let mut prev = 1.0;
        for i in 1..40 {
            let z = i as f64 * 0.25;
            let p = pchisq(z * z);
            assert!(p < prev, "p not decreasing at z = {z}");
            prev = p;
        }
    }

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_float_equal() {
        assert!(float_equal(0.0, 0.0));
        assert!(float_equal(1.0, 1.0 + f64::EPSILON / 2.0));
        assert!(!float_equal(0.0, 1e-10));
    }

    #[test]
    fn test_ldlt_solve_known_system() {
        // A = [[4,2],[2,3]], b = [10, 8] → x = [7/4, 3/2].
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let f = Ldlt::factor(&a);
        assert!(f.d_min() > 0.0);
        let x = f.solve(array![10.0, 8.0].view());
        assert!((x[0] - 1.75).abs() < 1e-12, "x0 = {}", x[0]);
        assert!((x[1] - 1.5).abs() < 1e-12, "x1 = {}", x[1]);
    }

    #[test]
    fn test_ldlt_inverse_identity() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let inv = Ldlt::factor(&a).inverse();
        let prod = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (prod[[i, j]] - want).abs() < 1e-10,
                    "prod[{i},{j}] = {}",
                    prod[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_ldlt_indefinite_detected() {
        // Eigenvalues of [[1,2],[2,1]] are 3 and −1.
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        let f = Ldlt::factor(&a);
        assert!(f.d_min() < 0.0, "d_min = {}", f.d_min());
    }

    #[test]
    fn test_ldlt_near_singular_condition_blows_up() {
        // Two almost-identical columns: d_max/d_min explodes.
        let a = array![[1.0, 0.999_999], [0.999_999, 1.0]];
        let f = Ldlt::factor(&a);
        assert!((f.d_max() / f.d_min()).sqrt() > 30.0);
    }
}
