//! Default convolution parameter populator.
//!
//! Turns a [`ConvDescriptor`] into a [`ConvParams`] record after checking that
//! the shapes, window and backend configuration describe a convolution the
//! fixed `[N, C, spatial..]` / `[O, I, spatial..]` layout can express.

use anyhow::{anyhow, bail, Context, Result};
use runmat_thunk_api::{
    AlgorithmConfig, ConvConfig, ConvDescriptor, ConvKind, ConvParamPopulator, ConvParams,
    WindowDim,
};
use serde::Deserialize;

/// Backend configuration attached to a convolution custom call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConvBackendConfig {
    algorithm: Option<i64>,
    tensor_ops_enabled: bool,
    conv_result_scale: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorPopulator {
    default_algorithm: i64,
}

impl DescriptorPopulator {
    pub const fn new() -> Self {
        Self {
            default_algorithm: -1,
        }
    }

    pub const fn with_default_algorithm(default_algorithm: i64) -> Self {
        Self { default_algorithm }
    }

    pub fn default_algorithm(&self) -> i64 {
        self.default_algorithm
    }
}

impl Default for DescriptorPopulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvParamPopulator for DescriptorPopulator {
    fn populate(&self, descriptor: &ConvDescriptor) -> Result<ConvParams> {
        let kind = ConvKind::from_custom_call_target(&descriptor.custom_call_target)
            .ok_or_else(|| {
                anyhow!(
                    "'{}' is not a convolution custom call (target '{}')",
                    descriptor.name,
                    descriptor.custom_call_target
                )
            })?;
        validate_shapes(descriptor)
            .with_context(|| format!("invalid convolution '{}'", descriptor.name))?;
        let backend = parse_backend_config(&descriptor.backend_config)
            .with_context(|| format!("invalid backend config on '{}'", descriptor.name))?;

        let algorithm = AlgorithmConfig {
            algorithm: backend.algorithm.unwrap_or(self.default_algorithm),
            tensor_ops_enabled: backend.tensor_ops_enabled,
        };
        if algorithm.algorithm < -1 {
            bail!(
                "invalid algorithm id {} on '{}'",
                algorithm.algorithm,
                descriptor.name
            );
        }
        let result_scale = backend.conv_result_scale.unwrap_or(1.0);
        if !result_scale.is_finite() {
            bail!("non-finite result scale on '{}'", descriptor.name);
        }

        Ok(ConvParams::unresolved(
            kind,
            ConvConfig {
                input_shape: descriptor.input_shape.clone(),
                filter_shape: descriptor.filter_shape.clone(),
                output_shape: descriptor.output_shape.clone(),
                window: descriptor.window.clone(),
                feature_group_count: descriptor.feature_group_count,
                element_type: descriptor.element_type,
                algorithm,
                result_scale,
            },
        ))
    }
}

fn parse_backend_config(raw: &str) -> Result<ConvBackendConfig> {
    if raw.trim().is_empty() {
        return Ok(ConvBackendConfig::default());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Spatial extent of the output along one dimension, or `None` when the
/// dilated window does not fit the padded input.
pub fn output_extent(input: usize, dim: &WindowDim) -> Option<usize> {
    if dim.size == 0 || dim.stride == 0 || dim.dilation == 0 {
        return None;
    }
    let padded = input + dim.padding_low + dim.padding_high;
    let span = (dim.size - 1) * dim.dilation + 1;
    if padded < span {
        return None;
    }
    Some((padded - span) / dim.stride + 1)
}

fn validate_shapes(d: &ConvDescriptor) -> Result<()> {
    let rank = d.input_shape.len();
    if rank < 3 {
        bail!("input rank {rank} is below 3 (batch, feature, spatial)");
    }
    if d.filter_shape.len() != rank || d.output_shape.len() != rank {
        bail!(
            "rank mismatch: input {}, filter {}, output {}",
            rank,
            d.filter_shape.len(),
            d.output_shape.len()
        );
    }
    let spatial = rank - 2;
    if d.window.len() != spatial {
        bail!(
            "window has {} dimensions but the tensors have {} spatial dimensions",
            d.window.len(),
            spatial
        );
    }
    if d.feature_group_count == 0 {
        bail!("feature group count must be at least 1");
    }

    let (batch, in_features) = (d.input_shape[0], d.input_shape[1]);
    let (out_features, filter_in) = (d.filter_shape[0], d.filter_shape[1]);
    if in_features != filter_in * d.feature_group_count {
        bail!(
            "input has {} features but filter expects {} x {} groups",
            in_features,
            filter_in,
            d.feature_group_count
        );
    }
    if out_features % d.feature_group_count != 0 {
        bail!(
            "{} output features do not split into {} groups",
            out_features,
            d.feature_group_count
        );
    }
    if d.output_shape[0] != batch {
        bail!(
            "output batch {} does not match input batch {}",
            d.output_shape[0],
            batch
        );
    }
    if d.output_shape[1] != out_features {
        bail!(
            "output has {} features but filter produces {}",
            d.output_shape[1],
            out_features
        );
    }

    for (axis, dim) in d.window.iter().enumerate() {
        if dim.stride == 0 || dim.dilation == 0 {
            bail!("spatial dim {axis}: stride and dilation must be at least 1");
        }
        if dim.size != d.filter_shape[axis + 2] {
            bail!(
                "spatial dim {axis}: window size {} does not match filter extent {}",
                dim.size,
                d.filter_shape[axis + 2]
            );
        }
        let expected = output_extent(d.input_shape[axis + 2], dim)
            .ok_or_else(|| anyhow!("spatial dim {axis}: window larger than padded input"))?;
        if d.output_shape[axis + 2] != expected {
            bail!(
                "spatial dim {axis}: output extent {} but window yields {}",
                d.output_shape[axis + 2],
                expected
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runmat_thunk_api::{DeviceAddress, ElementType};

    fn descriptor(target: &str) -> ConvDescriptor {
        ConvDescriptor {
            name: "conv.1".to_string(),
            custom_call_target: target.to_string(),
            input_shape: vec![2, 3, 5, 5],
            filter_shape: vec![4, 3, 3, 3],
            output_shape: vec![2, 4, 3, 3],
            window: vec![WindowDim::unit(3), WindowDim::unit(3)],
            feature_group_count: 1,
            element_type: ElementType::F32,
            backend_config: String::new(),
        }
    }

    #[test]
    fn populates_kind_and_leaves_addresses_null() {
        let populator = DescriptorPopulator::new();
        let params = populator
            .populate(&descriptor("__cudnn$convBackwardFilter"))
            .unwrap();
        assert_eq!(params.kind, ConvKind::BackwardFilter);
        assert_eq!(params.input, DeviceAddress::NULL);
        assert_eq!(params.filter, DeviceAddress::NULL);
        assert_eq!(params.output, DeviceAddress::NULL);
        assert_eq!(params.config.algorithm.algorithm, -1);
        assert_eq!(params.config.result_scale, 1.0);
    }

    #[test]
    fn backend_config_overrides_defaults() {
        let populator = DescriptorPopulator::with_default_algorithm(2);
        let mut d = descriptor("__cudnn$convForward");
        assert_eq!(populator.populate(&d).unwrap().config.algorithm.algorithm, 2);

        d.backend_config =
            r#"{"algorithm": 7, "tensor_ops_enabled": true, "conv_result_scale": 0.5}"#.into();
        let params = populator.populate(&d).unwrap();
        assert_eq!(params.config.algorithm.algorithm, 7);
        assert!(params.config.algorithm.tensor_ops_enabled);
        assert_eq!(params.config.result_scale, 0.5);
    }

    #[test]
    fn rejects_unknown_target() {
        let err = DescriptorPopulator::new()
            .populate(&descriptor("__cublas$gemm"))
            .unwrap_err();
        assert!(err.to_string().contains("__cublas$gemm"));
    }

    #[test]
    fn rejects_malformed_backend_config() {
        let mut d = descriptor("__cudnn$convForward");
        d.backend_config = "{algorithm:".into();
        assert!(DescriptorPopulator::new().populate(&d).is_err());
    }

    #[test]
    fn rejects_inconsistent_output_extent() {
        let mut d = descriptor("__cudnn$convForward");
        d.output_shape = vec![2, 4, 4, 3];
        let err = DescriptorPopulator::new().populate(&d).unwrap_err();
        assert!(format!("{err:#}").contains("spatial dim 0"));
    }

    #[test]
    fn rejects_window_rank_mismatch() {
        let mut d = descriptor("__cudnn$convForward");
        d.window.pop();
        assert!(DescriptorPopulator::new().populate(&d).is_err());
    }

    #[test]
    fn output_extent_handles_stride_padding_dilation() {
        let dim = WindowDim {
            size: 3,
            stride: 2,
            padding_low: 1,
            padding_high: 1,
            dilation: 1,
        };
        assert_eq!(output_extent(5, &dim), Some(3));
        let dilated = WindowDim {
            dilation: 2,
            ..WindowDim::unit(3)
        };
        assert_eq!(output_extent(5, &dilated), Some(1));
        assert_eq!(output_extent(4, &dilated), None);
    }
}
