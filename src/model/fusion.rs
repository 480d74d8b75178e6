//! Graph-attention fusion over a feature map
//!
//! Reinterprets a pooled grid of spatial regions as graph nodes, runs
//! attention-weighted aggregation across the nodes, and folds the refined
//! node features back into the original grid resolution. Input and output
//! shapes are always identical.

use super::layers::{AdaptiveAvgPool2d, ParamMut, ReLU};
use ndarray::{Array1, Array2, Array4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Graph-attention refinement module
///
/// Shape contract: (B, C, H, W) in, (B, C, H, W) out, for any H, W not
/// smaller than the node grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatFusion {
    /// Channel count this module is wired for
    pub channels: usize,
    /// Node grid size (height, width)
    pub grid: (usize, usize),
    /// Node feature transform [C, C]
    pub weight: Array2<f32>,
    /// Attention vector over concatenated node pairs [2C]
    pub attention: Array1<f32>,
    /// Negative slope for the LeakyReLU on attention scores
    pub negative_slope: f32,
    /// Pooling of the grid into nodes
    pool: AdaptiveAvgPool2d,
    relu: ReLU,
}

impl GatFusion {
    /// Create a new fusion module for the given channel count and node grid
    pub fn new(channels: usize, grid: (usize, usize)) -> Self {
        let mut rng = rand::thread_rng();

        // Xavier initialization for the transform and attention vector
        let w_scale = (2.0 / (2 * channels) as f32).sqrt();
        let weight =
            Array2::from_shape_fn((channels, channels), |_| rng.gen_range(-w_scale..w_scale));

        let a_scale = (2.0 / (2 * channels) as f32).sqrt();
        let attention =
            Array1::from_iter((0..2 * channels).map(|_| rng.gen_range(-a_scale..a_scale)));

        Self {
            channels,
            grid,
            weight,
            attention,
            negative_slope: 0.2,
            pool: AdaptiveAvgPool2d::new(grid),
            relu: ReLU::new(),
        }
    }

    /// Number of graph nodes
    pub fn num_nodes(&self) -> usize {
        self.grid.0 * self.grid.1
    }

    /// Forward pass, shape preserving
    ///
    /// Callers must hand in a map with `self.channels` channels and a
    /// spatial extent of at least the node grid; the backbone guarantees
    /// both during construction and input validation.
    pub fn forward(&self, input: &Array4<f32>) -> Array4<f32> {
        let (batch_size, channels, height, width) = input.dim();
        assert_eq!(
            channels, self.channels,
            "fusion module wired for a different channel count"
        );

        let (grid_h, grid_w) = self.grid;
        let n = self.num_nodes();

        // Spatial regions become graph nodes
        let pooled = self.pool.forward(input);

        let mut refined = Array4::zeros((batch_size, channels, height, width));

        for b in 0..batch_size {
            // Node feature matrix [N, C]
            let mut nodes = Array2::zeros((n, channels));
            for gy in 0..grid_h {
                for gx in 0..grid_w {
                    for c in 0..channels {
                        nodes[[gy * grid_w + gx, c]] = pooled[[b, c, gy, gx]];
                    }
                }
            }

            // Linear transform, then attention-weighted aggregation over
            // the fully connected node set
            let z = nodes.dot(&self.weight);
            let aggregated = self.aggregate(&z);

            // Project node deltas back onto the grid and add residually
            for y in 0..height {
                let gy = (y * grid_h) / height;
                for x in 0..width {
                    let gx = (x * grid_w) / width;
                    let node = gy * grid_w + gx;
                    for c in 0..channels {
                        refined[[b, c, y, x]] = input[[b, c, y, x]] + aggregated[[node, c]];
                    }
                }
            }
        }

        self.relu.forward(&refined)
    }

    /// Attention-weighted aggregation of transformed node features
    fn aggregate(&self, z: &Array2<f32>) -> Array2<f32> {
        let n = z.nrows();
        let mut output = Array2::zeros((n, self.channels));

        for i in 0..n {
            let zi = z.row(i);

            // Scores against every node, self included
            let scores: Vec<f32> = (0..n)
                .map(|j| {
                    let concat = ndarray::concatenate![Axis(0), zi, z.row(j)];
                    leaky_relu(self.attention.dot(&concat), self.negative_slope)
                })
                .collect();

            let alpha = softmax(&scores);

            let mut row = Array1::zeros(self.channels);
            for (j, &a) in alpha.iter().enumerate() {
                row.scaled_add(a, &z.row(j));
            }
            output.row_mut(i).assign(&row);
        }

        output
    }

    /// Get number of parameters
    pub fn num_params(&self) -> usize {
        self.channels * self.channels + 2 * self.channels
    }

    /// Visit named parameters under the given prefix
    pub fn visit_named(&mut self, prefix: &str, f: &mut dyn FnMut(String, ParamMut)) {
        f(format!("{prefix}.weight"), ParamMut::Matrix(&mut self.weight));
        f(
            format!("{prefix}.attention"),
            ParamMut::Vector(&mut self.attention),
        );
    }
}

/// LeakyReLU activation
fn leaky_relu(x: f32, negative_slope: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        negative_slope * x
    }
}

/// Numerically stable softmax
fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    #[test]
    fn test_fusion_preserves_shape() {
        let fusion = GatFusion::new(8, (3, 3));
        let input = Array4::random((2, 8, 13, 9), Uniform::new(-1.0, 1.0));
        let output = fusion.forward(&input);
        assert_eq!(output.dim(), input.dim());
    }

    #[test]
    fn test_fusion_grid_equal_resolution() {
        // Degenerate case: one node per pixel
        let fusion = GatFusion::new(4, (4, 4));
        let input = Array4::random((1, 4, 4, 4), Uniform::new(-1.0, 1.0));
        let output = fusion.forward(&input);
        assert_eq!(output.dim(), (1, 4, 4, 4));
    }

    #[test]
    fn test_fusion_output_non_negative() {
        // Final ReLU clamps the refined map
        let fusion = GatFusion::new(4, (2, 2));
        let input = Array4::random((1, 4, 8, 8), Uniform::new(-1.0, 1.0));
        let output = fusion.forward(&input);
        assert!(output.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_fusion_num_params() {
        let fusion = GatFusion::new(16, (10, 10));
        assert_eq!(fusion.num_params(), 16 * 16 + 32);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let alpha = softmax(&[0.5, -1.0, 2.0]);
        let sum: f32 = alpha.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
