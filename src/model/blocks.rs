//! Residual blocks for the backbone

use super::layers::{BatchNorm2d, Conv2d, LayerMut, ParamMut, ReLU};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// 3x3 convolution with padding, no bias
fn conv3x3(in_channels: usize, out_channels: usize, stride: usize) -> Conv2d {
    Conv2d::new(in_channels, out_channels, 3, stride, 1, false)
}

/// Basic residual block with two 3x3 convolutions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    /// First convolution (carries the stride)
    pub conv1: Conv2d,
    /// First batch norm
    pub bn1: BatchNorm2d,
    /// Second convolution
    pub conv2: Conv2d,
    /// Second batch norm
    pub bn2: BatchNorm2d,
    /// ReLU activation
    pub relu: ReLU,
    /// Shortcut projection (if shapes change)
    pub downsample: Option<(Conv2d, BatchNorm2d)>,
    /// Stride
    pub stride: usize,
}

impl BasicBlock {
    /// Expansion factor for this block type
    pub const EXPANSION: usize = 1;

    /// Create a new BasicBlock
    ///
    /// A shortcut projection is built if and only if the stride or the
    /// channel count changes across the block.
    pub fn new(in_channels: usize, planes: usize, stride: usize) -> Self {
        let conv1 = conv3x3(in_channels, planes, stride);
        let bn1 = BatchNorm2d::new(planes);
        let conv2 = conv3x3(planes, planes, 1);
        let bn2 = BatchNorm2d::new(planes);

        let downsample = if stride != 1 || in_channels != planes * Self::EXPANSION {
            Some((
                Conv2d::new(in_channels, planes * Self::EXPANSION, 1, stride, 0, false),
                BatchNorm2d::new(planes * Self::EXPANSION),
            ))
        } else {
            None
        };

        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            relu: ReLU::new(),
            downsample,
            stride,
        }
    }

    /// Forward pass
    pub fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let mut out = self.conv1.forward(x);
        out = self.bn1.forward(&out);
        out = self.relu.forward(&out);

        out = self.conv2.forward(&out);
        out = self.bn2.forward(&out);

        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward(&conv.forward(x)),
            None => x.clone(),
        };

        out = &out + &identity;
        self.relu.forward(&out)
    }

    /// Get number of parameters
    pub fn num_params(&self) -> usize {
        let mut params = self.conv1.num_params()
            + self.conv2.num_params()
            + self.bn1.num_features * 2
            + self.bn2.num_features * 2;

        if let Some((conv, bn)) = &self.downsample {
            params += conv.num_params() + bn.num_features * 2;
        }

        params
    }

    fn visit_layers(&mut self, f: &mut dyn FnMut(LayerMut)) {
        f(LayerMut::Transform(&mut self.conv1));
        f(LayerMut::Normalize(&mut self.bn1));
        f(LayerMut::Transform(&mut self.conv2));
        f(LayerMut::Normalize(&mut self.bn2));
        if let Some((conv, bn)) = &mut self.downsample {
            f(LayerMut::Transform(conv));
            f(LayerMut::Normalize(bn));
        }
    }

    fn visit_named(&mut self, prefix: &str, f: &mut dyn FnMut(String, ParamMut)) {
        self.conv1.visit_named(&format!("{prefix}.conv1"), f);
        self.bn1.visit_named(&format!("{prefix}.bn1"), f);
        self.conv2.visit_named(&format!("{prefix}.conv2"), f);
        self.bn2.visit_named(&format!("{prefix}.bn2"), f);
        if let Some((conv, bn)) = &mut self.downsample {
            conv.visit_named(&format!("{prefix}.downsample.0"), f);
            bn.visit_named(&format!("{prefix}.downsample.1"), f);
        }
    }
}

/// Bottleneck residual block: 1x1 reduce, 3x3 spatial, 1x1 expand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    /// 1x1 reduce convolution
    pub conv1: Conv2d,
    /// First batch norm
    pub bn1: BatchNorm2d,
    /// 3x3 convolution (carries the stride)
    pub conv2: Conv2d,
    /// Second batch norm
    pub bn2: BatchNorm2d,
    /// 1x1 expand convolution
    pub conv3: Conv2d,
    /// Third batch norm
    pub bn3: BatchNorm2d,
    /// ReLU activation
    pub relu: ReLU,
    /// Shortcut projection (if shapes change)
    pub downsample: Option<(Conv2d, BatchNorm2d)>,
    /// Stride
    pub stride: usize,
}

impl Bottleneck {
    /// Expansion factor for this block type
    pub const EXPANSION: usize = 4;

    /// Create a new Bottleneck block
    pub fn new(in_channels: usize, planes: usize, stride: usize) -> Self {
        let conv1 = Conv2d::new(in_channels, planes, 1, 1, 0, false);
        let bn1 = BatchNorm2d::new(planes);

        let conv2 = conv3x3(planes, planes, stride);
        let bn2 = BatchNorm2d::new(planes);

        let conv3 = Conv2d::new(planes, planes * Self::EXPANSION, 1, 1, 0, false);
        let bn3 = BatchNorm2d::new(planes * Self::EXPANSION);

        let downsample = if stride != 1 || in_channels != planes * Self::EXPANSION {
            Some((
                Conv2d::new(in_channels, planes * Self::EXPANSION, 1, stride, 0, false),
                BatchNorm2d::new(planes * Self::EXPANSION),
            ))
        } else {
            None
        };

        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            relu: ReLU::new(),
            downsample,
            stride,
        }
    }

    /// Forward pass
    ///
    /// No activation between the 3x3 output and the 1x1 expand output;
    /// the final activation runs after the shortcut addition.
    pub fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let mut out = self.conv1.forward(x);
        out = self.bn1.forward(&out);
        out = self.relu.forward(&out);

        out = self.conv2.forward(&out);
        out = self.bn2.forward(&out);
        out = self.relu.forward(&out);

        out = self.conv3.forward(&out);
        out = self.bn3.forward(&out);

        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward(&conv.forward(x)),
            None => x.clone(),
        };

        out = &out + &identity;
        self.relu.forward(&out)
    }

    /// Get number of parameters
    pub fn num_params(&self) -> usize {
        let mut params = self.conv1.num_params()
            + self.conv2.num_params()
            + self.conv3.num_params()
            + self.bn1.num_features * 2
            + self.bn2.num_features * 2
            + self.bn3.num_features * 2;

        if let Some((conv, bn)) = &self.downsample {
            params += conv.num_params() + bn.num_features * 2;
        }

        params
    }

    fn visit_layers(&mut self, f: &mut dyn FnMut(LayerMut)) {
        f(LayerMut::Transform(&mut self.conv1));
        f(LayerMut::Normalize(&mut self.bn1));
        f(LayerMut::Transform(&mut self.conv2));
        f(LayerMut::Normalize(&mut self.bn2));
        f(LayerMut::Transform(&mut self.conv3));
        f(LayerMut::Normalize(&mut self.bn3));
        if let Some((conv, bn)) = &mut self.downsample {
            f(LayerMut::Transform(conv));
            f(LayerMut::Normalize(bn));
        }
    }

    fn visit_named(&mut self, prefix: &str, f: &mut dyn FnMut(String, ParamMut)) {
        self.conv1.visit_named(&format!("{prefix}.conv1"), f);
        self.bn1.visit_named(&format!("{prefix}.bn1"), f);
        self.conv2.visit_named(&format!("{prefix}.conv2"), f);
        self.bn2.visit_named(&format!("{prefix}.bn2"), f);
        self.conv3.visit_named(&format!("{prefix}.conv3"), f);
        self.bn3.visit_named(&format!("{prefix}.bn3"), f);
        if let Some((conv, bn)) = &mut self.downsample {
            conv.visit_named(&format!("{prefix}.downsample.0"), f);
            bn.visit_named(&format!("{prefix}.downsample.1"), f);
        }
    }
}

/// Which residual block variant a stage is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Two 3x3 convolutions, expansion 1
    Basic,
    /// 1x1 / 3x3 / 1x1 convolutions, expansion 4
    Bottleneck,
}

impl BlockKind {
    /// Channel expansion factor of this block variant
    pub fn expansion(&self) -> usize {
        match self {
            BlockKind::Basic => BasicBlock::EXPANSION,
            BlockKind::Bottleneck => Bottleneck::EXPANSION,
        }
    }

    /// Build a block of this variant
    pub fn build(&self, in_channels: usize, planes: usize, stride: usize) -> ResidualBlock {
        match self {
            BlockKind::Basic => ResidualBlock::Basic(BasicBlock::new(in_channels, planes, stride)),
            BlockKind::Bottleneck => {
                ResidualBlock::Bottleneck(Bottleneck::new(in_channels, planes, stride))
            }
        }
    }
}

/// A residual block of either variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResidualBlock {
    /// Basic variant
    Basic(BasicBlock),
    /// Bottleneck variant
    Bottleneck(Bottleneck),
}

impl ResidualBlock {
    /// Forward pass
    pub fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        match self {
            ResidualBlock::Basic(block) => block.forward(x),
            ResidualBlock::Bottleneck(block) => block.forward(x),
        }
    }

    /// Get number of parameters
    pub fn num_params(&self) -> usize {
        match self {
            ResidualBlock::Basic(block) => block.num_params(),
            ResidualBlock::Bottleneck(block) => block.num_params(),
        }
    }

    /// Whether this block carries a shortcut projection
    pub fn has_projection(&self) -> bool {
        match self {
            ResidualBlock::Basic(block) => block.downsample.is_some(),
            ResidualBlock::Bottleneck(block) => block.downsample.is_some(),
        }
    }

    /// Visit all tagged layers in this block
    pub fn visit_layers(&mut self, f: &mut dyn FnMut(LayerMut)) {
        match self {
            ResidualBlock::Basic(block) => block.visit_layers(f),
            ResidualBlock::Bottleneck(block) => block.visit_layers(f),
        }
    }

    /// Visit named parameters under the given prefix
    pub fn visit_named(&mut self, prefix: &str, f: &mut dyn FnMut(String, ParamMut)) {
        match self {
            ResidualBlock::Basic(block) => block.visit_named(prefix, f),
            ResidualBlock::Bottleneck(block) => block.visit_named(prefix, f),
        }
    }
}
