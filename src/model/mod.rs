//! Model definition: layers, residual blocks, fusion and the backbone

mod backbone;
mod blocks;
mod fusion;
mod layers;
mod pretrained;

pub use backbone::{Backbone, BackboneConfig, FeatureMap, FeaturePyramid, Variant};
pub use blocks::{BasicBlock, BlockKind, Bottleneck, ResidualBlock};
pub use fusion::GatFusion;
pub use layers::{AdaptiveAvgPool2d, BatchNorm2d, Conv2d, LayerMut, MaxPool2d, ParamMut, ReLU};
pub use pretrained::{weight_url, StateDict};
