//! Pretrained weight registry and partial state-dict application
//!
//! Fetching the weight archive itself is a collaborator's job; this module
//! owns the identifier registry and the name-intersection logic that folds
//! a fetched state dict into a constructed backbone.

use super::backbone::{Backbone, Variant};
use super::layers::ParamMut;
use crate::error::BackboneError;
use ndarray::{ArrayD, Ix1, Ix2, Ix4};
use std::collections::HashMap;
use tracing::{debug, info};

/// Parameter name to tensor value, as exported by the model zoo
pub type StateDict = HashMap<String, ArrayD<f32>>;

/// Resolve a model identifier to its published weight archive URL
///
/// Unknown identifiers fail; the backbone they were meant for stays usable
/// with its initialized weights.
pub fn weight_url(model_id: &str) -> Result<&'static str, BackboneError> {
    match Variant::from_id(model_id)? {
        Variant::ResNet18 => Ok("https://download.pytorch.org/models/resnet18-5c106cde.pth"),
        Variant::ResNet34 => Ok("https://download.pytorch.org/models/resnet34-333f7ec4.pth"),
        Variant::ResNet50 => Ok("https://download.pytorch.org/models/resnet50-19c8e357.pth"),
        Variant::ResNet101 => Ok("https://download.pytorch.org/models/resnet101-5d3b4d8f.pth"),
        Variant::ResNet152 => Ok("https://download.pytorch.org/models/resnet152-b121ed2d.pth"),
    }
}

impl Backbone {
    /// Overwrite parameters whose names and shapes match the given state dict
    ///
    /// Entries in the dict with no counterpart in the backbone are silently
    /// ignored, as are entries whose shapes disagree; unmatched backbone
    /// parameters keep their initialized values. Applying the same dict
    /// twice is a no-op the second time. Returns the number of parameters
    /// overwritten.
    pub fn load_state_dict(&mut self, dict: &StateDict) -> usize {
        let mut applied = 0usize;

        self.visit_named(&mut |name, param| {
            let Some(value) = dict.get(&name) else {
                return;
            };

            let loaded = match param {
                ParamMut::Kernel(weight) => {
                    assign_if_compatible(&name, value, weight, |v| {
                        v.into_dimensionality::<Ix4>().ok()
                    })
                }
                ParamMut::Matrix(weight) => {
                    assign_if_compatible(&name, value, weight, |v| {
                        v.into_dimensionality::<Ix2>().ok()
                    })
                }
                ParamMut::Vector(weight) => {
                    assign_if_compatible(&name, value, weight, |v| {
                        v.into_dimensionality::<Ix1>().ok()
                    })
                }
            };
            if loaded {
                applied += 1;
            }
        });

        info!(
            applied,
            provided = dict.len(),
            "loaded pretrained parameters"
        );
        applied
    }
}

fn assign_if_compatible<D, F>(
    name: &str,
    value: &ArrayD<f32>,
    target: &mut ndarray::Array<f32, D>,
    convert: F,
) -> bool
where
    D: ndarray::Dimension,
    F: FnOnce(ArrayD<f32>) -> Option<ndarray::Array<f32, D>>,
{
    if value.shape() != target.shape() {
        debug!(
            name,
            expected = ?target.shape(),
            got = ?value.shape(),
            "skipping incompatible pretrained entry"
        );
        return false;
    }

    match convert(value.clone()) {
        Some(converted) => {
            *target = converted;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackboneConfig, Variant};
    use ndarray::{Array1, Array4};

    fn small_backbone() -> Backbone {
        Backbone::build(BackboneConfig::new(Variant::ResNet18, [256, 512], (2, 2))).unwrap()
    }

    #[test]
    fn test_weight_url_known_variants() {
        assert!(weight_url("resnet18").unwrap().ends_with(".pth"));
        assert!(weight_url("resnet101").unwrap().contains("resnet101"));
    }

    #[test]
    fn test_weight_url_unknown_model() {
        match weight_url("resnet999") {
            Err(BackboneError::UnknownModel(id)) => assert_eq!(id, "resnet999"),
            other => panic!("expected UnknownModel, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_application() {
        let mut backbone = small_backbone();

        let mut dict = StateDict::new();
        dict.insert(
            "conv1.weight".to_string(),
            Array4::ones((64, 3, 7, 7)).into_dyn(),
        );
        dict.insert(
            "bn1.weight".to_string(),
            Array1::from_elem(64, 2.0).into_dyn(),
        );
        // No counterpart in the backbone: ignored
        dict.insert("fc.weight".to_string(), Array1::ones(1000).into_dyn());

        let applied = backbone.load_state_dict(&dict);
        assert_eq!(applied, 2);
        assert!(backbone.conv1.weight.iter().all(|&w| w == 1.0));
        assert!(backbone.bn1.weight.iter().all(|&w| w == 2.0));

        // Unmatched parameters keep their initialized values
        assert!(backbone.bn1.bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_incompatible_shape_is_skipped() {
        let mut backbone = small_backbone();
        let before = backbone.conv1.weight.clone();

        let mut dict = StateDict::new();
        dict.insert(
            "conv1.weight".to_string(),
            Array4::ones((64, 3, 3, 3)).into_dyn(),
        );

        let applied = backbone.load_state_dict(&dict);
        assert_eq!(applied, 0);
        assert_eq!(backbone.conv1.weight, before);
    }

    #[test]
    fn test_load_idempotence() {
        let mut once = small_backbone();
        let mut dict = StateDict::new();
        dict.insert(
            "layer1.0.conv1.weight".to_string(),
            Array4::from_elem((64, 64, 3, 3), 0.5).into_dyn(),
        );
        dict.insert(
            "bn1.running_var".to_string(),
            Array1::from_elem(64, 4.0).into_dyn(),
        );

        once.load_state_dict(&dict);
        let mut twice = once.clone();
        twice.load_state_dict(&dict);

        assert_eq!(once.bn1.running_var, twice.bn1.running_var);
        match (&once.layer1[0], &twice.layer1[0]) {
            (
                crate::model::ResidualBlock::Basic(a),
                crate::model::ResidualBlock::Basic(b),
            ) => assert_eq!(a.conv1.weight, b.conv1.weight),
            _ => panic!("resnet18 stages hold basic blocks"),
        }
    }
}
