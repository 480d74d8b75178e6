//! # Multi-scale ResNet backbone with graph-attention fusion
//!
//! This crate implements a residual convolutional backbone whose two
//! deepest stages are refined by graph-attention fusion modules. A forward
//! pass produces four feature maps at input/4, input/8, input/16 and
//! input/32 resolution for downstream perception heads.
//!
//! ## Features
//!
//! - Basic and bottleneck residual blocks with shortcut projections
//! - Five standard depth variants (resnet18 through resnet152)
//! - Graph-attention refinement over a configurable node grid
//! - Fan-out weight initialization via a tagged layer visitor
//! - Partial pretrained state-dict application by parameter name
//!
//! ## Example
//!
//! ```rust,no_run
//! use gat_backbone::{Backbone, BackboneConfig, Variant};
//! use ndarray::Array4;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BackboneConfig::new(Variant::ResNet101, [1024, 2048], (10, 10));
//!     let backbone = Backbone::build(config)?;
//!
//!     let input = Array4::zeros((1, 3, 640, 640));
//!     let pyramid = backbone.forward(&input)?;
//!     println!("{:?}", pyramid.shapes());
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod model;
pub mod observe;

pub use error::BackboneError;
pub use model::{Backbone, BackboneConfig, FeatureMap, FeaturePyramid, Variant};
pub use observe::{FeatureObserver, NullObserver, RecordingObserver};
