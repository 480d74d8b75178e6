//! Backbone inspection tool
//!
//! Builds a variant and reports its parameter count and the four output
//! shapes for a given input size, without running a forward pass.

use anyhow::Result;
use clap::Parser;
use gat_backbone::{Backbone, BackboneConfig, Variant};
use tracing::info;

#[derive(Parser)]
#[command(about = "Inspect a backbone variant's parameter count and output shapes")]
struct Args {
    /// Depth variant (resnet18, resnet34, resnet50, resnet101, resnet152)
    #[arg(long, default_value = "resnet50")]
    variant: String,

    /// Input height, must be divisible by 32
    #[arg(long, default_value_t = 640)]
    height: usize,

    /// Input width, must be divisible by 32
    #[arg(long, default_value_t = 640)]
    width: usize,

    /// Fusion node grid side length
    #[arg(long, default_value_t = 10)]
    grid: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let variant = Variant::from_id(&args.variant)?;
    let channels = variant.stage_channels();

    let config = BackboneConfig::new(variant, [channels[2], channels[3]], (args.grid, args.grid));
    let backbone = Backbone::build(config)?;

    info!(
        variant = variant.id(),
        params = backbone.num_params(),
        "constructed backbone"
    );

    let shapes = backbone.output_shapes([1, 3, args.height, args.width])?;
    for (name, shape) in ["c2", "c3", "c4", "c5"].iter().zip(shapes) {
        println!("{name}: {shape:?}");
    }

    Ok(())
}
