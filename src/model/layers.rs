//! Neural network layer implementations

use ndarray::{Array1, Array2, Array4};
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// Mutable view of a single named parameter, used when applying
/// pretrained weights by name.
pub enum ParamMut<'a> {
    /// Convolution kernel [out_channels, in_channels, kh, kw]
    Kernel(&'a mut Array4<f32>),
    /// Dense weight matrix
    Matrix(&'a mut Array2<f32>),
    /// Per-channel vector (batch norm scale/shift, running stats, biases)
    Vector(&'a mut Array1<f32>),
}

/// Capability tag handed to the weight initializer: convolution-like
/// layers get the fan-out normal policy, normalization layers get
/// scale 1 / shift 0. Other parameter categories are never visited.
pub enum LayerMut<'a> {
    /// Convolution-like transform layer
    Transform(&'a mut Conv2d),
    /// Batch-norm-like normalization layer
    Normalize(&'a mut BatchNorm2d),
}

/// 2D Convolutional layer with square kernels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    /// Weight tensor [out_channels, in_channels, kernel, kernel]
    pub weight: Array4<f32>,
    /// Bias vector [out_channels]
    pub bias: Option<Array1<f32>>,
    /// Stride
    pub stride: usize,
    /// Padding
    pub padding: usize,
    /// Input channels
    pub in_channels: usize,
    /// Output channels
    pub out_channels: usize,
    /// Kernel size
    pub kernel_size: usize,
}

impl Conv2d {
    /// Create a new Conv2d layer with fan-out normal initialization
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    ) -> Self {
        let mut conv = Self {
            weight: Array4::zeros((out_channels, in_channels, kernel_size, kernel_size)),
            bias: bias.then(|| Array1::zeros(out_channels)),
            stride,
            padding,
            in_channels,
            out_channels,
            kernel_size,
        };
        conv.reset_parameters();
        conv
    }

    /// Re-sample weights from N(0, sqrt(2/n)) with n = kh * kw * out_channels,
    /// zero the bias
    pub fn reset_parameters(&mut self) {
        let mut rng = rand::thread_rng();
        let n = (self.kernel_size * self.kernel_size * self.out_channels) as f32;
        let normal = Normal::new(0.0, (2.0 / n).sqrt()).unwrap();

        self.weight.mapv_inplace(|_| rng.sample(normal));
        if let Some(ref mut bias) = self.bias {
            bias.fill(0.0);
        }
    }

    /// Forward pass
    /// Input shape: [batch, in_channels, height, width]
    /// Output shape: [batch, out_channels, out_height, out_width]
    pub fn forward(&self, input: &Array4<f32>) -> Array4<f32> {
        let (batch_size, _, in_h, in_w) = input.dim();
        let (out_h, out_w) = self.output_size(in_h, in_w);

        let mut output = Array4::zeros((batch_size, self.out_channels, out_h, out_w));

        for b in 0..batch_size {
            for oc in 0..self.out_channels {
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let mut sum = 0.0f32;
                        let y0 = (oy * self.stride) as i32 - self.padding as i32;
                        let x0 = (ox * self.stride) as i32 - self.padding as i32;

                        for ic in 0..self.in_channels {
                            for ky in 0..self.kernel_size {
                                let iy = y0 + ky as i32;
                                if iy < 0 || iy as usize >= in_h {
                                    continue;
                                }
                                for kx in 0..self.kernel_size {
                                    let ix = x0 + kx as i32;
                                    if ix < 0 || ix as usize >= in_w {
                                        continue;
                                    }
                                    sum += input[[b, ic, iy as usize, ix as usize]]
                                        * self.weight[[oc, ic, ky, kx]];
                                }
                            }
                        }

                        if let Some(ref bias) = self.bias {
                            sum += bias[oc];
                        }

                        output[[b, oc, oy, ox]] = sum;
                    }
                }
            }
        }

        output
    }

    /// Spatial output size for a given input size
    pub fn output_size(&self, in_h: usize, in_w: usize) -> (usize, usize) {
        (
            (in_h + 2 * self.padding - self.kernel_size) / self.stride + 1,
            (in_w + 2 * self.padding - self.kernel_size) / self.stride + 1,
        )
    }

    /// Get number of parameters
    pub fn num_params(&self) -> usize {
        let weight_params =
            self.out_channels * self.in_channels * self.kernel_size * self.kernel_size;
        let bias_params = if self.bias.is_some() {
            self.out_channels
        } else {
            0
        };
        weight_params + bias_params
    }

    /// Visit named parameters under the given prefix
    pub fn visit_named(&mut self, prefix: &str, f: &mut dyn FnMut(String, ParamMut)) {
        f(format!("{prefix}.weight"), ParamMut::Kernel(&mut self.weight));
        if let Some(ref mut bias) = self.bias {
            f(format!("{prefix}.bias"), ParamMut::Vector(bias));
        }
    }
}

/// Batch Normalization over the channel axis of a 4D feature map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm2d {
    /// Number of features (channels)
    pub num_features: usize,
    /// Scale parameter (gamma)
    pub weight: Array1<f32>,
    /// Shift parameter (beta)
    pub bias: Array1<f32>,
    /// Running mean
    pub running_mean: Array1<f32>,
    /// Running variance
    pub running_var: Array1<f32>,
    /// Small constant for numerical stability
    pub eps: f32,
    /// Momentum for running stats
    pub momentum: f32,
    /// Training mode
    pub training: bool,
}

impl BatchNorm2d {
    /// Create a new BatchNorm2d layer
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            weight: Array1::ones(num_features),
            bias: Array1::zeros(num_features),
            running_mean: Array1::zeros(num_features),
            running_var: Array1::ones(num_features),
            eps: 1e-5,
            momentum: 0.1,
            training: true,
        }
    }

    /// Reset scale to 1 and shift to 0, clear running statistics
    pub fn reset_parameters(&mut self) {
        self.weight.fill(1.0);
        self.bias.fill(0.0);
        self.running_mean.fill(0.0);
        self.running_var.fill(1.0);
    }

    /// Forward pass
    /// Input shape: [batch, channels, height, width]
    pub fn forward(&self, input: &Array4<f32>) -> Array4<f32> {
        let (batch_size, _, height, width) = input.dim();

        let mut output = input.clone();

        for c in 0..self.num_features {
            let (mean, var) = if self.training {
                let mut sum = 0.0f32;
                let mut sq_sum = 0.0f32;
                let n = (batch_size * height * width) as f32;

                for b in 0..batch_size {
                    for y in 0..height {
                        for x in 0..width {
                            let val = input[[b, c, y, x]];
                            sum += val;
                            sq_sum += val * val;
                        }
                    }
                }

                let mean = sum / n;
                let var = sq_sum / n - mean * mean;
                (mean, var)
            } else {
                (self.running_mean[c], self.running_var[c])
            };

            let std = (var + self.eps).sqrt();

            for b in 0..batch_size {
                for y in 0..height {
                    for x in 0..width {
                        let normalized = (input[[b, c, y, x]] - mean) / std;
                        output[[b, c, y, x]] = self.weight[c] * normalized + self.bias[c];
                    }
                }
            }
        }

        output
    }

    /// Set training mode
    pub fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    /// Visit named parameters under the given prefix
    pub fn visit_named(&mut self, prefix: &str, f: &mut dyn FnMut(String, ParamMut)) {
        f(format!("{prefix}.weight"), ParamMut::Vector(&mut self.weight));
        f(format!("{prefix}.bias"), ParamMut::Vector(&mut self.bias));
        f(
            format!("{prefix}.running_mean"),
            ParamMut::Vector(&mut self.running_mean),
        );
        f(
            format!("{prefix}.running_var"),
            ParamMut::Vector(&mut self.running_var),
        );
    }
}

/// ReLU activation function
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReLU;

impl ReLU {
    /// Create a new ReLU layer
    pub fn new() -> Self {
        Self
    }

    /// Forward pass
    pub fn forward(&self, input: &Array4<f32>) -> Array4<f32> {
        input.mapv(|x| x.max(0.0))
    }
}

/// Max Pooling 2D
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxPool2d {
    /// Kernel size
    pub kernel_size: usize,
    /// Stride
    pub stride: usize,
    /// Padding
    pub padding: usize,
}

impl MaxPool2d {
    /// Create a new MaxPool2d layer
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel_size,
            stride,
            padding,
        }
    }

    /// Forward pass
    pub fn forward(&self, input: &Array4<f32>) -> Array4<f32> {
        let (batch_size, channels, in_h, in_w) = input.dim();
        let (out_h, out_w) = self.output_size(in_h, in_w);

        let mut output =
            Array4::from_elem((batch_size, channels, out_h, out_w), f32::NEG_INFINITY);

        for b in 0..batch_size {
            for c in 0..channels {
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let y0 = (oy * self.stride) as i32 - self.padding as i32;
                        let x0 = (ox * self.stride) as i32 - self.padding as i32;

                        for ky in 0..self.kernel_size {
                            let iy = y0 + ky as i32;
                            if iy < 0 || iy as usize >= in_h {
                                continue;
                            }
                            for kx in 0..self.kernel_size {
                                let ix = x0 + kx as i32;
                                if ix < 0 || ix as usize >= in_w {
                                    continue;
                                }
                                output[[b, c, oy, ox]] = output[[b, c, oy, ox]]
                                    .max(input[[b, c, iy as usize, ix as usize]]);
                            }
                        }
                    }
                }
            }
        }

        output
    }

    /// Spatial output size for a given input size
    pub fn output_size(&self, in_h: usize, in_w: usize) -> (usize, usize) {
        (
            (in_h + 2 * self.padding - self.kernel_size) / self.stride + 1,
            (in_w + 2 * self.padding - self.kernel_size) / self.stride + 1,
        )
    }
}

/// Adaptive Average Pooling 2D to a fixed output grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveAvgPool2d {
    /// Output grid size (height, width)
    pub output_size: (usize, usize),
}

impl AdaptiveAvgPool2d {
    /// Create a new AdaptiveAvgPool2d layer
    pub fn new(output_size: (usize, usize)) -> Self {
        Self { output_size }
    }

    /// Forward pass
    pub fn forward(&self, input: &Array4<f32>) -> Array4<f32> {
        let (batch_size, channels, in_h, in_w) = input.dim();
        let (out_h, out_w) = self.output_size;

        let mut output = Array4::zeros((batch_size, channels, out_h, out_w));

        for b in 0..batch_size {
            for c in 0..channels {
                for oy in 0..out_h {
                    let y_start = (oy * in_h) / out_h;
                    let y_end = ((oy + 1) * in_h) / out_h;
                    for ox in 0..out_w {
                        let x_start = (ox * in_w) / out_w;
                        let x_end = ((ox + 1) * in_w) / out_w;
                        let count = ((y_end - y_start) * (x_end - x_start)) as f32;

                        let mut sum = 0.0f32;
                        for y in y_start..y_end {
                            for x in x_start..x_end {
                                sum += input[[b, c, y, x]];
                            }
                        }
                        output[[b, c, oy, ox]] = sum / count;
                    }
                }
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv2d_forward() {
        let conv = Conv2d::new(2, 4, 3, 1, 1, true);
        let input = Array4::ones((1, 2, 8, 8));
        let output = conv.forward(&input);
        assert_eq!(output.dim(), (1, 4, 8, 8));
    }

    #[test]
    fn test_conv2d_stride() {
        let conv = Conv2d::new(3, 8, 7, 2, 3, false);
        let input = Array4::ones((1, 3, 32, 32));
        let output = conv.forward(&input);
        assert_eq!(output.dim(), (1, 8, 16, 16));
    }

    #[test]
    fn test_conv2d_fan_out_variance() {
        let conv = Conv2d::new(16, 64, 3, 1, 1, false);
        let n = conv.weight.len() as f32;
        let mean: f32 = conv.weight.iter().sum::<f32>() / n;
        let var: f32 =
            conv.weight.iter().map(|w| (w - mean) * (w - mean)).sum::<f32>() / n;

        // n = 3 * 3 * 64 = 576, expected variance 2/576
        let expected = 2.0 / 576.0;
        assert!((var - expected).abs() < expected * 0.2);
    }

    #[test]
    fn test_batchnorm2d_init() {
        let bn = BatchNorm2d::new(8);
        assert!(bn.weight.iter().all(|&w| w == 1.0));
        assert!(bn.bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_batchnorm2d_forward() {
        let bn = BatchNorm2d::new(4);
        let input = Array4::ones((2, 4, 8, 8));
        let output = bn.forward(&input);
        assert_eq!(output.dim(), (2, 4, 8, 8));
    }

    #[test]
    fn test_relu_forward() {
        let relu = ReLU::new();
        let input = Array4::from_elem((1, 2, 3, 3), -1.0);
        let output = relu.forward(&input);
        assert!(output.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_maxpool2d_forward() {
        let pool = MaxPool2d::new(3, 2, 1);
        let input = Array4::ones((1, 2, 16, 16));
        let output = pool.forward(&input);
        assert_eq!(output.dim(), (1, 2, 8, 8));
    }

    #[test]
    fn test_adaptive_pool_grid() {
        let pool = AdaptiveAvgPool2d::new((3, 3));
        let input = Array4::ones((1, 4, 13, 9));
        let output = pool.forward(&input);
        assert_eq!(output.dim(), (1, 4, 3, 3));

        // Averaging a constant map keeps the constant
        assert!(output.iter().all(|&x| (x - 1.0).abs() < 1e-6));
    }
}
