//! Backbone orchestration: stem, residual stages and fusion wiring

use super::blocks::{BlockKind, ResidualBlock};
use super::fusion::GatFusion;
use super::layers::{BatchNorm2d, Conv2d, LayerMut, MaxPool2d, ParamMut, ReLU};
use crate::error::BackboneError;
use crate::observe::{FeatureObserver, NullObserver};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A 4D feature map (batch, channels, height, width)
pub type FeatureMap = Array4<f32>;

/// Base channel counts of the four residual stages
const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];

/// Channels produced by the stem
const STEM_CHANNELS: usize = 64;

/// Total spatial reduction from input to the deepest output
const TOTAL_STRIDE: usize = 32;

/// Standard backbone depth variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variant {
    /// 18 layers, basic blocks [2, 2, 2, 2]
    ResNet18,
    /// 34 layers, basic blocks [3, 4, 6, 3]
    ResNet34,
    /// 50 layers, bottleneck blocks [3, 4, 6, 3]
    ResNet50,
    /// 101 layers, bottleneck blocks [3, 4, 23, 3]
    ResNet101,
    /// 152 layers, bottleneck blocks [3, 8, 36, 3]
    ResNet152,
}

impl Variant {
    /// Canonical string identifier
    pub fn id(&self) -> &'static str {
        match self {
            Variant::ResNet18 => "resnet18",
            Variant::ResNet34 => "resnet34",
            Variant::ResNet50 => "resnet50",
            Variant::ResNet101 => "resnet101",
            Variant::ResNet152 => "resnet152",
        }
    }

    /// Parse a variant from its identifier
    pub fn from_id(id: &str) -> Result<Self, BackboneError> {
        match id {
            "resnet18" => Ok(Variant::ResNet18),
            "resnet34" => Ok(Variant::ResNet34),
            "resnet50" => Ok(Variant::ResNet50),
            "resnet101" => Ok(Variant::ResNet101),
            "resnet152" => Ok(Variant::ResNet152),
            other => Err(BackboneError::UnknownModel(other.to_string())),
        }
    }

    /// Residual block variant used by this depth
    pub fn block_kind(&self) -> BlockKind {
        match self {
            Variant::ResNet18 | Variant::ResNet34 => BlockKind::Basic,
            _ => BlockKind::Bottleneck,
        }
    }

    /// Blocks per stage
    pub fn block_counts(&self) -> [usize; 4] {
        match self {
            Variant::ResNet18 => [2, 2, 2, 2],
            Variant::ResNet34 | Variant::ResNet50 => [3, 4, 6, 3],
            Variant::ResNet101 => [3, 4, 23, 3],
            Variant::ResNet152 => [3, 8, 36, 3],
        }
    }

    /// Channel counts of the four stage outputs
    pub fn stage_channels(&self) -> [usize; 4] {
        let e = self.block_kind().expansion();
        [
            STAGE_PLANES[0] * e,
            STAGE_PLANES[1] * e,
            STAGE_PLANES[2] * e,
            STAGE_PLANES[3] * e,
        ]
    }
}

/// Backbone configuration
///
/// The fusion channel counts and node grid are required for every variant;
/// there is no depth-specific default wired into the factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Depth variant
    pub variant: Variant,
    /// Blocks per stage
    pub block_counts: [usize; 4],
    /// Channel counts the two fusion modules are wired for
    /// (stage 3 output, stage 4 output)
    pub fusion_channels: [usize; 2],
    /// Node grid used by both fusion modules (height, width)
    pub fusion_grid: (usize, usize),
    /// Input channels (3 for RGB imagery)
    pub in_channels: usize,
}

impl BackboneConfig {
    /// Configuration for a variant with its canonical block counts
    pub fn new(variant: Variant, fusion_channels: [usize; 2], fusion_grid: (usize, usize)) -> Self {
        Self {
            variant,
            block_counts: variant.block_counts(),
            fusion_channels,
            fusion_grid,
            in_channels: 3,
        }
    }
}

/// The four multi-scale outputs of a forward pass
///
/// Resolutions are input/4, input/8, input/16 and input/32; the two deepest
/// maps have already been refined by their fusion modules.
#[derive(Debug, Clone)]
pub struct FeaturePyramid {
    /// Stage 1 output, input/4 resolution
    pub c2: FeatureMap,
    /// Stage 2 output, input/8 resolution
    pub c3: FeatureMap,
    /// Fused stage 3 output, input/16 resolution
    pub c4: FeatureMap,
    /// Fused stage 4 output, input/32 resolution
    pub c5: FeatureMap,
}

impl FeaturePyramid {
    /// Shapes of the four maps
    pub fn shapes(&self) -> [[usize; 4]; 4] {
        [
            shape4(&self.c2),
            shape4(&self.c3),
            shape4(&self.c4),
            shape4(&self.c5),
        ]
    }
}

fn shape4(map: &FeatureMap) -> [usize; 4] {
    let (b, c, h, w) = map.dim();
    [b, c, h, w]
}

/// Multi-scale residual backbone with graph-attention fusion after
/// stages 3 and 4
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backbone {
    /// Stem convolution (7x7, stride 2)
    pub conv1: Conv2d,
    /// Stem batch norm
    pub bn1: BatchNorm2d,
    /// Stem activation
    pub relu: ReLU,
    /// Stem max pooling (3x3, stride 2)
    pub maxpool: MaxPool2d,
    /// Stage 1 blocks
    pub layer1: Vec<ResidualBlock>,
    /// Stage 2 blocks
    pub layer2: Vec<ResidualBlock>,
    /// Stage 3 blocks
    pub layer3: Vec<ResidualBlock>,
    /// Fusion after stage 3
    pub fusion3: GatFusion,
    /// Stage 4 blocks
    pub layer4: Vec<ResidualBlock>,
    /// Fusion after stage 4
    pub fusion4: GatFusion,
    /// Construction configuration
    pub config: BackboneConfig,
}

impl Backbone {
    /// Build a backbone from a configuration
    ///
    /// Validates the fusion wiring against the stage channel counts before
    /// allocating anything; a backbone that builds successfully cannot hit
    /// a shape mismatch during forward passes.
    pub fn build(config: BackboneConfig) -> Result<Self, BackboneError> {
        for (i, &count) in config.block_counts.iter().enumerate() {
            if count == 0 {
                return Err(BackboneError::InvalidInput(format!(
                    "stage {} has zero blocks",
                    i + 1
                )));
            }
        }
        if config.fusion_grid.0 == 0 || config.fusion_grid.1 == 0 {
            return Err(BackboneError::InvalidInput(
                "fusion node grid must be non-empty".to_string(),
            ));
        }

        let kind = config.variant.block_kind();
        let stage_channels = config.variant.stage_channels();

        // The fusion modules sit on the stage 3 and stage 4 outputs, so
        // their configured channel counts must match exactly.
        for (slot, stage) in [(0usize, 2usize), (1, 3)] {
            if config.fusion_channels[slot] != stage_channels[stage] {
                return Err(BackboneError::ShapeMismatch {
                    context: format!("fusion{} input", stage + 1),
                    expected: vec![stage_channels[stage]],
                    actual: vec![config.fusion_channels[slot]],
                });
            }
        }

        let conv1 = Conv2d::new(config.in_channels, STEM_CHANNELS, 7, 2, 3, false);
        let bn1 = BatchNorm2d::new(STEM_CHANNELS);

        // Thread the running channel count through stage construction
        let (layer1, channels) =
            make_stage(kind, STEM_CHANNELS, STAGE_PLANES[0], config.block_counts[0], 1);
        let (layer2, channels) =
            make_stage(kind, channels, STAGE_PLANES[1], config.block_counts[1], 2);
        let (layer3, channels) =
            make_stage(kind, channels, STAGE_PLANES[2], config.block_counts[2], 2);
        let fusion3 = GatFusion::new(channels, config.fusion_grid);
        let (layer4, channels) =
            make_stage(kind, channels, STAGE_PLANES[3], config.block_counts[3], 2);
        let fusion4 = GatFusion::new(channels, config.fusion_grid);

        let mut backbone = Self {
            conv1,
            bn1,
            relu: ReLU::new(),
            maxpool: MaxPool2d::new(3, 2, 1),
            layer1,
            layer2,
            layer3,
            fusion3,
            layer4,
            fusion4,
            config,
        };
        backbone.init_weights();

        debug!(
            variant = backbone.config.variant.id(),
            params = backbone.num_params(),
            "constructed backbone"
        );

        Ok(backbone)
    }

    /// Re-initialize all transform and normalization layers
    ///
    /// Convolutions get N(0, sqrt(2/n)) with n = kh * kw * out_channels;
    /// batch norms get scale 1 and shift 0. Fusion parameters keep their
    /// own initialization and are not visited.
    pub fn init_weights(&mut self) {
        self.visit_layers(&mut |layer| match layer {
            LayerMut::Transform(conv) => conv.reset_parameters(),
            LayerMut::Normalize(bn) => bn.reset_parameters(),
        });
    }

    /// Forward pass producing the four multi-scale maps
    pub fn forward(&self, input: &FeatureMap) -> Result<FeaturePyramid, BackboneError> {
        self.forward_observed(input, &mut NullObserver)
    }

    /// Forward pass with intermediate taps handed to an observer
    ///
    /// The observer never influences the computed values; `forward` is the
    /// same pass with a no-op observer.
    pub fn forward_observed(
        &self,
        input: &FeatureMap,
        observer: &mut dyn FeatureObserver,
    ) -> Result<FeaturePyramid, BackboneError> {
        self.validate_input(input)?;

        let mut x = self.conv1.forward(input);
        x = self.bn1.forward(&x);
        x = self.relu.forward(&x);
        x = self.maxpool.forward(&x);

        let c2 = forward_stage(&self.layer1, &x);
        observer.record("c2", &c2);

        let c3 = forward_stage(&self.layer2, &c2);
        observer.record("c3", &c3);

        let c4 = forward_stage(&self.layer3, &c3);
        observer.record("c4", &c4);
        let c4 = self.fusion3.forward(&c4);
        observer.record("c4_fused", &c4);

        let c5 = forward_stage(&self.layer4, &c4);
        observer.record("c5", &c5);
        let c5 = self.fusion4.forward(&c5);
        observer.record("c5_fused", &c5);

        Ok(FeaturePyramid { c2, c3, c4, c5 })
    }

    /// Output shapes for a given input shape, without running the model
    pub fn output_shapes(&self, input: [usize; 4]) -> Result<[[usize; 4]; 4], BackboneError> {
        self.validate_dims(input)?;

        let [b, _, h, w] = input;
        let channels = self.config.variant.stage_channels();

        Ok([
            [b, channels[0], h / 4, w / 4],
            [b, channels[1], h / 8, w / 8],
            [b, channels[2], h / 16, w / 16],
            [b, channels[3], h / 32, w / 32],
        ])
    }

    /// Set training mode on every normalization layer
    pub fn set_training(&mut self, mode: bool) {
        self.visit_layers(&mut |layer| {
            if let LayerMut::Normalize(bn) = layer {
                bn.train(mode);
            }
        });
    }

    /// Get total number of parameters
    pub fn num_params(&self) -> usize {
        let mut params = self.conv1.num_params() + self.bn1.num_features * 2;

        for stage in [&self.layer1, &self.layer2, &self.layer3, &self.layer4] {
            for block in stage {
                params += block.num_params();
            }
        }

        params + self.fusion3.num_params() + self.fusion4.num_params()
    }

    /// Visit every transform and normalization layer in the backbone
    pub fn visit_layers(&mut self, f: &mut dyn FnMut(LayerMut)) {
        f(LayerMut::Transform(&mut self.conv1));
        f(LayerMut::Normalize(&mut self.bn1));

        for stage in [
            &mut self.layer1,
            &mut self.layer2,
            &mut self.layer3,
            &mut self.layer4,
        ] {
            for block in stage {
                block.visit_layers(f);
            }
        }
    }

    /// Visit every parameter with its dotted name
    ///
    /// The stem and stage names follow the torchvision state-dict scheme
    /// (`conv1.weight`, `layer1.0.bn1.running_mean`, ...) so published
    /// classification checkpoints intersect with this backbone by name.
    pub fn visit_named(&mut self, f: &mut dyn FnMut(String, ParamMut)) {
        self.conv1.visit_named("conv1", f);
        self.bn1.visit_named("bn1", f);

        let stages: [(&str, &mut Vec<ResidualBlock>); 4] = [
            ("layer1", &mut self.layer1),
            ("layer2", &mut self.layer2),
            ("layer3", &mut self.layer3),
            ("layer4", &mut self.layer4),
        ];
        for (name, stage) in stages {
            for (i, block) in stage.iter_mut().enumerate() {
                block.visit_named(&format!("{name}.{i}"), f);
            }
        }

        self.fusion3.visit_named("fusion3", f);
        self.fusion4.visit_named("fusion4", f);
    }

    fn validate_input(&self, input: &FeatureMap) -> Result<(), BackboneError> {
        let (b, c, h, w) = input.dim();
        self.validate_dims([b, c, h, w])
    }

    fn validate_dims(&self, dims: [usize; 4]) -> Result<(), BackboneError> {
        let [b, c, h, w] = dims;

        if b == 0 || c == 0 || h == 0 || w == 0 {
            return Err(BackboneError::InvalidInput(format!(
                "all input dimensions must be positive, got {dims:?}"
            )));
        }
        if c != self.config.in_channels {
            return Err(BackboneError::InvalidInput(format!(
                "expected {} input channels, got {c}",
                self.config.in_channels
            )));
        }
        if h % TOTAL_STRIDE != 0 || w % TOTAL_STRIDE != 0 {
            return Err(BackboneError::InvalidInput(format!(
                "input resolution {h}x{w} is not divisible by {TOTAL_STRIDE}"
            )));
        }

        // Both fusion modules need at least one pixel per graph node
        let (grid_h, grid_w) = self.config.fusion_grid;
        if h / TOTAL_STRIDE < grid_h || w / TOTAL_STRIDE < grid_w {
            return Err(BackboneError::InvalidInput(format!(
                "deepest feature map {}x{} is smaller than the {grid_h}x{grid_w} fusion grid",
                h / TOTAL_STRIDE,
                w / TOTAL_STRIDE
            )));
        }

        Ok(())
    }
}

/// Build one residual stage, returning the blocks and the channel count
/// they produce
///
/// Only the first block may change resolution or channel count; the rest
/// are stride-1 identity-shortcut blocks.
fn make_stage(
    kind: BlockKind,
    in_channels: usize,
    planes: usize,
    blocks: usize,
    stride: usize,
) -> (Vec<ResidualBlock>, usize) {
    let out_channels = planes * kind.expansion();

    let mut stage = Vec::with_capacity(blocks);
    stage.push(kind.build(in_channels, planes, stride));
    for _ in 1..blocks {
        stage.push(kind.build(out_channels, planes, 1));
    }

    (stage, out_channels)
}

/// Run a feature map through a stage
fn forward_stage(stage: &[ResidualBlock], x: &FeatureMap) -> FeatureMap {
    let mut out = stage[0].forward(x);
    for block in &stage[1..] {
        out = block.forward(&out);
    }
    out
}
