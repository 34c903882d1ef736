use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// How a multi-kernel convolution divides its output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelSplit {
    EqualChannels,
    /// Each branch gets roughly the same `channels * k^2` parameter count.
    #[default]
    EqualParams,
}

/// Mixed depthwise-style convolution: parallel branches with different
/// kernel sizes whose outputs are concatenated on the channel axis.
#[derive(Module, Debug)]
pub struct MixConv2d<B: Backend> {
    pub branches: Vec<Conv2d<B>>,
    pub kernel_sizes: Ignored<Vec<usize>>,
}

impl<B: Backend> MixConv2d<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        kernel_sizes: &[usize],
        stride: [usize; 2],
        bias: bool,
        method: ChannelSplit,
    ) -> Result<Self, String> {
        let split = split_channels(out_channels, kernel_sizes, method)?;
        let branches = split
            .iter()
            .zip(kernel_sizes)
            .map(|(&channels, &k)| {
                Conv2dConfig::new([in_channels, channels], [k, k])
                    .with_stride(stride)
                    .with_padding(PaddingConfig2d::Explicit(k / 2, k / 2))
                    .with_bias(bias)
                    .init(device)
            })
            .collect();

        Ok(Self {
            branches,
            kernel_sizes: Ignored(kernel_sizes.to_vec()),
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let outputs = self
            .branches
            .iter()
            .map(|conv| conv.forward(x.clone()))
            .collect();
        Tensor::cat(outputs, 1)
    }
}

/// Per-branch output channels for `kernel_sizes`, summing to `out_channels`.
///
/// `EqualParams` solves the least-squares system
/// `[1 1 .. 1] c = C`, `k_{g-1}^2 c_{g-1} - k_g^2 c_g = 0` (cyclic), rounds
/// half-to-even and then hands any rounding residual to the branches that
/// lost the most in rounding. A branch left with zero channels is an error.
pub fn split_channels(
    out_channels: usize,
    kernel_sizes: &[usize],
    method: ChannelSplit,
) -> Result<Vec<usize>, String> {
    let groups = kernel_sizes.len();
    if groups == 0 {
        return Err("multi-kernel convolution needs at least one kernel size".to_string());
    }

    let split = match method {
        ChannelSplit::EqualChannels => {
            let mut counts = vec![0usize; groups];
            let top = groups as f64 - 1e-6;
            for j in 0..out_channels {
                let position = if out_channels > 1 {
                    top * j as f64 / (out_channels - 1) as f64
                } else {
                    0.0
                };
                counts[(position.floor() as usize).min(groups - 1)] += 1;
            }
            counts
        }
        ChannelSplit::EqualParams => equal_param_split(out_channels, kernel_sizes),
    };

    if let Some(g) = split.iter().position(|&c| c == 0) {
        return Err(format!(
            "kernel sizes {kernel_sizes:?} leave branch {g} with zero of {out_channels} channels"
        ));
    }
    Ok(split)
}

fn equal_param_split(out_channels: usize, kernel_sizes: &[usize]) -> Vec<usize> {
    let groups = kernel_sizes.len();

    // a = eye(g + 1, g, k = -1) - roll(., 1, axis = 1), columns scaled by k^2,
    // first row replaced by ones.
    let mut a = vec![vec![0.0f64; groups]; groups + 1];
    for r in 0..=groups {
        for c in 0..groups {
            let eye = if r == c + 1 { 1.0 } else { 0.0 };
            let rolled = if r == (c + groups - 1) % groups + 1 { 1.0 } else { 0.0 };
            let k = kernel_sizes[c] as f64;
            a[r][c] = (eye - rolled) * k * k;
        }
    }
    a[0] = vec![1.0; groups];

    let mut b = vec![0.0f64; groups + 1];
    b[0] = out_channels as f64;

    let exact = least_squares(&a, &b);
    let mut rounded: Vec<i64> = exact.iter().map(|v| v.round_ties_even().max(0.0) as i64).collect();

    let target = out_channels as i64;
    let mut total: i64 = rounded.iter().sum();
    while total != target {
        let residual = |g: usize| exact[g] - rounded[g] as f64;
        let pick = if total < target {
            (0..groups).max_by(|&x, &y| residual(x).total_cmp(&residual(y)))
        } else {
            (0..groups)
                .filter(|&g| rounded[g] > 0)
                .min_by(|&x, &y| residual(x).total_cmp(&residual(y)))
        };
        let Some(g) = pick else { break };
        if total < target {
            rounded[g] += 1;
            total += 1;
        } else {
            rounded[g] -= 1;
            total -= 1;
        }
    }

    rounded.into_iter().map(|c| c as usize).collect()
}

/// Solves `min |a x - b|` through the normal equations. `a` is tall and has
/// full column rank for every kernel-size list.
fn least_squares(a: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = a[0].len();
    let mut m = vec![vec![0.0f64; n + 1]; n];
    for i in 0..n {
        for j in 0..n {
            m[i][j] = a.iter().map(|row| row[i] * row[j]).sum();
        }
        m[i][n] = a.iter().zip(b).map(|(row, bv)| row[i] * bv).sum();
    }

    // Gaussian elimination with partial pivoting
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| m[x][col].abs().total_cmp(&m[y][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot);
        let p = m[col][col];
        if p.abs() < f64::EPSILON {
            continue;
        }
        for row in 0..n {
            if row != col {
                let factor = m[row][col] / p;
                for k in col..=n {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }
    }

    (0..n)
        .map(|i| if m[i][i].abs() < f64::EPSILON { 0.0 } else { m[i][n] / m[i][i] })
        .collect()
}
