//! Low-rank factorization of expert weight deltas.
//!
//! Computes truncated SVDs of weight-difference matrices, optionally with a
//! scale-aware correction from an offline covariance statistic. Decomposition
//! runs in f64 regardless of input dtype; only the final factors are cast to
//! the compact storage dtype.
//!
//! SVD on ill-conditioned input may fail to converge. Failures are retried
//! with zero-mean noise of escalating magnitude (1e-6, 1e-2, 1.0); a fourth
//! failure is fatal. The decomposition itself sits behind [`SvdBackend`] so
//! the retry ladder is testable with a scripted backend.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ScalePolicy;
use crate::error::MergeError;

/// Noise magnitudes for the decomposition retry ladder. One clean attempt
/// precedes these, so the total attempt count is `NOISE_LADDER.len() + 1`.
const NOISE_LADDER: [f64; 3] = [1e-6, 1e-2, 1.0];

/// Diagonal regularizer magnitudes for scale-matrix inversion retries.
const INVERSE_REGULARIZERS: [f64; 3] = [1e-6, 1e-4, 1e-2];

/// Rank selection for a factorization.
#[derive(Debug, Clone, Copy)]
pub enum RankSpec {
    /// Keep exactly this many singular triples.
    Rank(usize),
    /// Derive the rank from a compression ratio:
    /// `floor(rows·cols·ratio / (rows+cols))`.
    Ratio(f64),
}

impl RankSpec {
    pub fn resolve(&self, rows: usize, cols: usize) -> usize {
        match *self {
            RankSpec::Rank(r) => r,
            RankSpec::Ratio(ratio) => {
                (rows as f64 * cols as f64 * ratio / (rows + cols) as f64) as usize
            }
        }
    }
}

/// Where the truncated singular-value mass is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MassSplit {
    /// `U = U_r·√Σ_r`, `V = √Σ_r·V_r`.
    #[default]
    Symmetric,
    /// All mass into U: `U = U_r·Σ_r`, `V = V_r`.
    AbsorbU,
    /// All mass into V: `U = U_r`, `V = Σ_r·V_r`.
    AbsorbV,
}

/// A truncated factor pair such that `U·V ≈ D`.
#[derive(Debug, Clone)]
pub struct DeltaFactorPair {
    /// `[rows, rank]`
    pub u: Tensor,
    /// `[rank, cols]`
    pub v: Tensor,
    pub rank: usize,
}

impl DeltaFactorPair {
    /// Dense reconstruction `U·V`, for diagnostics and tests.
    pub fn reconstruct(&self) -> candle_core::Result<Tensor> {
        self.u.matmul(&self.v)
    }
}

/// Raw truncated factors in row-major f64.
#[derive(Debug, Clone)]
pub struct SvdFactors {
    /// `rows × rank`
    pub u: Vec<f64>,
    /// `rank` singular values, descending.
    pub s: Vec<f64>,
    /// `rank × cols`
    pub vt: Vec<f64>,
}

/// Truncated-SVD backend seam.
///
/// Implementations return `Err` with a reason string on non-convergence; the
/// factorizer owns the retry policy.
pub trait SvdBackend: Send + Sync {
    fn svd_truncated(
        &self,
        matrix: &[f64],
        rows: usize,
        cols: usize,
        rank: usize,
    ) -> Result<SvdFactors, String>;
}

/// Deflated power-iteration SVD.
///
/// Extracts the top singular triples one at a time, subtracting each from a
/// residual copy. Sufficient for the delta ranks used here; a LAPACK-backed
/// implementation can be dropped in behind [`SvdBackend`].
#[derive(Debug, Clone)]
pub struct PowerIterationSvd {
    pub iterations: usize,
}

impl Default for PowerIterationSvd {
    fn default() -> Self {
        Self { iterations: 50 }
    }
}

impl SvdBackend for PowerIterationSvd {
    fn svd_truncated(
        &self,
        matrix: &[f64],
        rows: usize,
        cols: usize,
        rank: usize,
    ) -> Result<SvdFactors, String> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err("non-finite value in input matrix".to_string());
        }

        let rank = rank.min(rows).min(cols);
        let mut u_out = vec![0.0f64; rows * rank];
        let mut s_out = vec![0.0f64; rank];
        let mut vt_out = vec![0.0f64; rank * cols];

        let mut residual = matrix.to_vec();

        for k in 0..rank {
            let mut v = vec![0.0f64; cols];
            v[k % cols] = 1.0;

            for _ in 0..self.iterations {
                // u = A·v
                let mut u = vec![0.0f64; rows];
                for i in 0..rows {
                    let row = &residual[i * cols..(i + 1) * cols];
                    u[i] = row.iter().zip(&v).map(|(a, b)| a * b).sum();
                }
                let u_norm = u.iter().map(|x| x * x).sum::<f64>().sqrt();
                if u_norm < 1e-300 {
                    break;
                }
                for x in &mut u {
                    *x /= u_norm;
                }

                // v = Aᵀ·u
                v = vec![0.0f64; cols];
                for i in 0..rows {
                    let row = &residual[i * cols..(i + 1) * cols];
                    for (vj, a) in v.iter_mut().zip(row) {
                        *vj += a * u[i];
                    }
                }
                let v_norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
                if v_norm < 1e-300 {
                    break;
                }
                for x in &mut v {
                    *x /= v_norm;
                }
            }

            // Final u and sigma for the converged v.
            let mut u = vec![0.0f64; rows];
            for i in 0..rows {
                let row = &residual[i * cols..(i + 1) * cols];
                u[i] = row.iter().zip(&v).map(|(a, b)| a * b).sum();
            }
            let sigma = u.iter().map(|x| x * x).sum::<f64>().sqrt();
            if sigma > 1e-300 {
                for x in &mut u {
                    *x /= sigma;
                }
            }

            for i in 0..rows {
                u_out[i * rank + k] = u[i];
            }
            s_out[k] = sigma;
            vt_out[k * cols..(k + 1) * cols].copy_from_slice(&v);

            // Deflate.
            for i in 0..rows {
                let row = &mut residual[i * cols..(i + 1) * cols];
                for (r, vj) in row.iter_mut().zip(&v) {
                    *r -= sigma * u[i] * vj;
                }
            }

            if !s_out[k].is_finite() {
                return Err(format!("singular value {k} is not finite"));
            }
        }

        Ok(SvdFactors {
            u: u_out,
            s: s_out,
            vt: vt_out,
        })
    }
}

/// Factorizes weight deltas into truncated low-rank pairs.
pub struct DeltaFactorizer {
    scale_policy: ScalePolicy,
    out_dtype: DType,
    backend: Box<dyn SvdBackend>,
}

impl DeltaFactorizer {
    pub fn new(scale_policy: ScalePolicy, out_dtype: DType) -> Self {
        Self::with_backend(scale_policy, out_dtype, Box::new(PowerIterationSvd::default()))
    }

    pub fn with_backend(
        scale_policy: ScalePolicy,
        out_dtype: DType,
        backend: Box<dyn SvdBackend>,
    ) -> Self {
        Self {
            scale_policy,
            out_dtype,
            backend,
        }
    }

    /// Factorize `delta` to the requested rank with the symmetric mass split.
    pub fn factorize(
        &self,
        delta: &Tensor,
        rank: RankSpec,
        scale: Option<&Tensor>,
    ) -> Result<DeltaFactorPair, MergeError> {
        self.factorize_with_split(delta, rank, scale, MassSplit::Symmetric)
    }

    /// Factorize `delta`, placing the singular-value mass per `split`.
    pub fn factorize_with_split(
        &self,
        delta: &Tensor,
        rank: RankSpec,
        scale: Option<&Tensor>,
        split: MassSplit,
    ) -> Result<DeltaFactorPair, MergeError> {
        let (rows, cols) = delta.dims2()?;
        let rank = rank.resolve(rows, cols).min(rows).min(cols);
        if rank == 0 {
            return Err(MergeError::InvalidConfig(format!(
                "derived rank is zero for a {rows}x{cols} delta"
            )));
        }

        let a = to_f64_matrix(delta)?;

        // Apply the scale correction to the matrix handed to the backend and
        // remember how to undo it on the truncated V.
        let (target, correction) = match (self.scale_policy, scale) {
            (_, None) | (ScalePolicy::None, _) => (a, VCorrection::None),
            (ScalePolicy::SvdLlm, Some(s)) => {
                let (s_rows, s_cols) = s.dims2()?;
                if s_rows != cols || s_cols != cols {
                    return Err(MergeError::InvalidConfig(format!(
                        "scale matrix is {s_rows}x{s_cols}, expected {cols}x{cols}"
                    )));
                }
                let s_mat = to_f64_matrix(s)?;
                let scaled = matmul(&a, rows, cols, &s_mat, cols, cols);
                let s_inv = invert_regularized(&s_mat, cols)?;
                (scaled, VCorrection::RightMultiply(s_inv))
            }
            (ScalePolicy::Asvd, Some(s)) => {
                let mut col_scale = scale_vector(s, cols)?;
                for v in &mut col_scale {
                    *v = 0.5 * *v + 1e-6;
                }
                let mut scaled = a;
                for row in scaled.chunks_mut(cols) {
                    for (x, sc) in row.iter_mut().zip(&col_scale) {
                        *x *= *sc;
                    }
                }
                (scaled, VCorrection::DivideRows(col_scale))
            }
        };

        let factors = self.svd_with_retries(&target, rows, cols, rank)?;
        let SvdFactors { mut u, s, mut vt } = factors;

        // Undo the scale correction on the truncated V.
        match correction {
            VCorrection::None => {}
            VCorrection::RightMultiply(s_inv) => {
                vt = matmul(&vt, rank, cols, &s_inv, cols, cols);
            }
            VCorrection::DivideRows(col_scale) => {
                for row in vt.chunks_mut(cols) {
                    for (x, sc) in row.iter_mut().zip(&col_scale) {
                        *x /= *sc;
                    }
                }
            }
        }

        // Distribute the singular-value mass.
        match split {
            MassSplit::Symmetric => {
                let sqrt_s: Vec<f64> = s.iter().map(|x| x.sqrt()).collect();
                for row in u.chunks_mut(rank) {
                    for (x, sq) in row.iter_mut().zip(&sqrt_s) {
                        *x *= *sq;
                    }
                }
                for (k, row) in vt.chunks_mut(cols).enumerate() {
                    for x in row.iter_mut() {
                        *x *= sqrt_s[k];
                    }
                }
            }
            MassSplit::AbsorbU => {
                for row in u.chunks_mut(rank) {
                    for (x, sv) in row.iter_mut().zip(&s) {
                        *x *= *sv;
                    }
                }
            }
            MassSplit::AbsorbV => {
                for (k, row) in vt.chunks_mut(cols).enumerate() {
                    for x in row.iter_mut() {
                        *x *= s[k];
                    }
                }
            }
        }

        let device = delta.device();
        let u = Tensor::from_vec(u, (rows, rank), device)?.to_dtype(self.out_dtype)?;
        let v = Tensor::from_vec(vt, (rank, cols), device)?.to_dtype(self.out_dtype)?;
        Ok(DeltaFactorPair { u, v, rank })
    }

    fn svd_with_retries(
        &self,
        matrix: &[f64],
        rows: usize,
        cols: usize,
        rank: usize,
    ) -> Result<SvdFactors, MergeError> {
        let mut last_reason = String::new();
        for attempt in 0..=NOISE_LADDER.len() {
            let input = if attempt == 0 {
                matrix.to_vec()
            } else {
                let eps = NOISE_LADDER[attempt - 1];
                let mut rng = StdRng::seed_from_u64(attempt as u64);
                matrix
                    .iter()
                    .map(|v| v + rng.gen_range(-eps..eps))
                    .collect()
            };

            match self.backend.svd_truncated(&input, rows, cols, rank) {
                Ok(factors) => return Ok(factors),
                Err(reason) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        %reason,
                        "truncated SVD failed, retrying with noise injection"
                    );
                    last_reason = reason;
                }
            }
        }
        Err(MergeError::DecompositionFailed {
            attempts: NOISE_LADDER.len() + 1,
            reason: last_reason,
        })
    }
}

enum VCorrection {
    None,
    RightMultiply(Vec<f64>),
    DivideRows(Vec<f64>),
}

fn to_f64_matrix(t: &Tensor) -> Result<Vec<f64>, MergeError> {
    let rows = t.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    Ok(rows.into_iter().flatten().collect())
}

/// Per-column scale vector for the asvd policy: a 1-D statistic is used
/// directly; a square matrix contributes its diagonal.
fn scale_vector(s: &Tensor, cols: usize) -> Result<Vec<f64>, MergeError> {
    let v = match s.dims() {
        [n] if *n == cols => s.to_dtype(DType::F64)?.to_vec1::<f64>()?,
        [r, c] if *r == cols && *c == cols => {
            let m = s.to_dtype(DType::F64)?.to_vec2::<f64>()?;
            (0..cols).map(|i| m[i][i]).collect()
        }
        dims => {
            return Err(MergeError::InvalidConfig(format!(
                "asvd scale has shape {dims:?}, expected [{cols}] or [{cols}, {cols}]"
            )))
        }
    };
    Ok(v)
}

/// Naive row-major matmul; merge-time only.
fn matmul(a: &[f64], ar: usize, ac: usize, b: &[f64], br: usize, bc: usize) -> Vec<f64> {
    debug_assert_eq!(ac, br);
    let mut out = vec![0.0f64; ar * bc];
    for i in 0..ar {
        for k in 0..ac {
            let aik = a[i * ac + k];
            if aik == 0.0 {
                continue;
            }
            let brow = &b[k * bc..(k + 1) * bc];
            let orow = &mut out[i * bc..(i + 1) * bc];
            for (o, bv) in orow.iter_mut().zip(brow) {
                *o += aik * bv;
            }
        }
    }
    out
}

/// Gauss-Jordan inversion with partial pivoting. A singular pivot triggers a
/// diagonal-regularizer retry ladder; exhausting it is a permanent failure.
fn invert_regularized(matrix: &[f64], n: usize) -> Result<Vec<f64>, MergeError> {
    if let Some(inv) = invert(matrix, n) {
        return Ok(inv);
    }
    for (retry, eps) in INVERSE_REGULARIZERS.iter().enumerate() {
        tracing::warn!(
            retry = retry + 1,
            eps,
            "scale matrix is singular, adding diagonal regularizer"
        );
        let mut reg = matrix.to_vec();
        for i in 0..n {
            reg[i * n + i] += eps;
        }
        if let Some(inv) = invert(&reg, n) {
            return Ok(inv);
        }
    }
    Err(MergeError::SingularScale {
        retries: INVERSE_REGULARIZERS.len(),
    })
}

fn invert(matrix: &[f64], n: usize) -> Option<Vec<f64>> {
    // Augmented [A | I] elimination.
    let mut a = matrix.to_vec();
    let mut inv = vec![0.0f64; n * n];
    for i in 0..n {
        inv[i * n + i] = 1.0;
    }

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&p, &q| {
            a[p * n + col]
                .abs()
                .partial_cmp(&a[q * n + col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        let pivot = a[pivot_row * n + col];
        if pivot.abs() < 1e-12 || !pivot.is_finite() {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                a.swap(col * n + j, pivot_row * n + j);
                inv.swap(col * n + j, pivot_row * n + j);
            }
        }
        for j in 0..n {
            a[col * n + j] /= pivot;
            inv[col * n + j] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row * n + col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row * n + j] -= factor * a[col * n + j];
                inv[row * n + j] -= factor * inv[col * n + j];
            }
        }
    }
    Some(inv)
}
