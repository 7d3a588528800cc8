//! Convolutional keyword classifier built from layer descriptors

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Dropout, Linear,
    Module, ModuleT, VarBuilder,
};

use super::layers::{infer_shapes, same_padding, Activation, LayerSpec, Padding, Shape};
use crate::error::KwsError;

/// Batch norm epsilon
const BN_EPS: f64 = 1e-3;

/// Weight of the current batch in the running statistics
const BN_MOMENTUM: f64 = 0.01;

enum Layer {
    Conv2d {
        conv: Conv2d,
        activation: Activation,
        l2: Option<f64>,
    },
    BatchNorm(BatchNorm),
    MaxPool2d {
        kernel: usize,
        stride: usize,
        padding: Padding,
    },
    Flatten,
    Dense {
        linear: Linear,
        activation: Activation,
    },
    Dropout(Dropout),
}

fn activate(xs: Tensor, activation: Activation) -> Result<Tensor> {
    Ok(match activation {
        Activation::Linear => xs,
        Activation::Relu => xs.relu()?,
        Activation::Softmax => candle_nn::ops::softmax_last_dim(&xs)?,
    })
}

/// Max pooling that stays differentiable for overlapping windows.
///
/// Candle only has a backward pass for `max_pool2d` when kernel and stride
/// match, so overlapping windows are gathered with `index_select` and folded
/// with `maximum`.
fn max_pool_2d(xs: &Tensor, kernel: usize, stride: usize, padding: Padding) -> Result<Tensor> {
    let xs = match padding {
        Padding::Valid => xs.clone(),
        Padding::Same => {
            let (_, _, h, w) = xs.dims4()?;
            let mut xs = xs.clone();
            // Replicated edges can never exceed the real maximum of a window
            for (dim, size) in [(2, h), (3, w)] {
                let (before, after) = same_padding(size, kernel, stride);
                if before + after > 0 {
                    xs = xs.pad_with_same(dim, before, after)?;
                }
            }
            xs
        }
    };
    if kernel == stride {
        return Ok(xs.max_pool2d_with_stride((kernel, kernel), (stride, stride))?);
    }

    let (_, _, h, w) = xs.dims4()?;
    if h < kernel || w < kernel || stride == 0 {
        return Err(KwsError::InvalidArchitecture(format!(
            "pool window {kernel}x{kernel} stride {stride} does not fit {h}x{w}"
        ))
        .into());
    }
    let (out_h, out_w) = ((h - kernel) / stride + 1, (w - kernel) / stride + 1);

    let mut pooled: Option<Tensor> = None;
    for dy in 0..kernel {
        let rows = strided_select(&xs, 2, dy, stride, out_h)?;
        for dx in 0..kernel {
            let window = strided_select(&rows, 3, dx, stride, out_w)?;
            pooled = Some(match pooled {
                Some(acc) => acc.maximum(&window)?,
                None => window,
            });
        }
    }
    pooled.ok_or_else(|| KwsError::InvalidArchitecture("empty pool window".into()).into())
}

/// Entries `offset, offset + stride, ...` along `dim`
fn strided_select(xs: &Tensor, dim: usize, offset: usize, stride: usize, count: usize) -> Result<Tensor> {
    let index: Vec<u32> = (0..count).map(|i| (offset + i * stride) as u32).collect();
    let index = Tensor::new(index.as_slice(), xs.device())?;
    Ok(xs.index_select(&index, dim)?)
}

/// Sequential CNN over [batch, 1, frames, coefficients] inputs
pub struct KeywordCnn {
    layers: Vec<Layer>,
    specs: Vec<LayerSpec>,
    input: Shape,
    shapes: Vec<Shape>,
}

impl KeywordCnn {
    /// Build the network described by `specs` for inputs of shape `input`
    pub fn new(input: Shape, specs: &[LayerSpec], vb: VarBuilder) -> Result<Self> {
        let shapes = infer_shapes(input, specs)?;
        let Some(Shape::Flat(_)) = shapes.last() else {
            return Err(KwsError::InvalidArchitecture(
                "network must end in a flat output layer".into(),
            )
            .into());
        };

        let vb = vb.pp("layers");
        let mut layers = Vec::with_capacity(specs.len());
        let mut current = input;

        for (i, (spec, &output)) in specs.iter().zip(&shapes).enumerate() {
            let vb = vb.pp(i.to_string());
            let layer = match (spec, current) {
                (
                    LayerSpec::Conv2d {
                        filters,
                        kernel,
                        activation,
                        l2,
                    },
                    Shape::Spatial(channels, _, _),
                ) => Layer::Conv2d {
                    conv: conv2d(channels, *filters, *kernel, Conv2dConfig::default(), vb)?,
                    activation: *activation,
                    l2: *l2,
                },
                (LayerSpec::BatchNorm, shape) => {
                    let features = match shape {
                        Shape::Spatial(c, _, _) => c,
                        Shape::Flat(n) => n,
                    };
                    let config = BatchNormConfig {
                        eps: BN_EPS,
                        remove_mean: true,
                        affine: true,
                        momentum: BN_MOMENTUM,
                    };
                    Layer::BatchNorm(batch_norm(features, config, vb)?)
                }
                (
                    LayerSpec::MaxPool2d {
                        kernel,
                        stride,
                        padding,
                    },
                    _,
                ) => Layer::MaxPool2d {
                    kernel: *kernel,
                    stride: *stride,
                    padding: *padding,
                },
                (LayerSpec::Flatten, _) => Layer::Flatten,
                (LayerSpec::Dense { units, activation }, Shape::Flat(in_features)) => {
                    Layer::Dense {
                        linear: linear(in_features, *units, vb)?,
                        activation: *activation,
                    }
                }
                (LayerSpec::Dropout { rate }, _) => Layer::Dropout(Dropout::new(*rate)),
                (spec, shape) => {
                    // infer_shapes already rejects these combinations
                    return Err(KwsError::InvalidArchitecture(format!(
                        "{} cannot take input of shape {}",
                        spec.name(),
                        shape
                    ))
                    .into());
                }
            };
            layers.push(layer);
            current = output;
        }

        Ok(Self {
            layers,
            specs: specs.to_vec(),
            input,
            shapes,
        })
    }

    pub fn input_shape(&self) -> Shape {
        self.input
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    pub fn num_classes(&self) -> usize {
        self.shapes.last().map_or(0, Shape::num_elements)
    }

    fn check_input(&self, xs: &Tensor) -> Result<()> {
        let Shape::Spatial(c, h, w) = self.input else {
            return Ok(());
        };
        let (_, xc, xh, xw) = xs.dims4()?;
        anyhow::ensure!(
            (xc, xh, xw) == (c, h, w),
            "input of shape ({xc}, {xh}, {xw}) does not match the network input ({c}, {h}, {w})"
        );
        Ok(())
    }

    fn run(&self, xs: &Tensor, train: bool, output_activation: bool) -> Result<Tensor> {
        self.check_input(xs)?;
        let last = self.layers.len().saturating_sub(1);
        let mut xs = xs.clone();

        for (i, layer) in self.layers.iter().enumerate() {
            xs = match layer {
                Layer::Conv2d {
                    conv, activation, ..
                } => activate(conv.forward(&xs)?, *activation)?,
                Layer::BatchNorm(bn) => bn.forward_t(&xs, train)?,
                Layer::MaxPool2d {
                    kernel,
                    stride,
                    padding,
                } => max_pool_2d(&xs, *kernel, *stride, *padding)?,
                Layer::Flatten => xs.flatten_from(1)?,
                Layer::Dense { linear, activation } => {
                    let ys = linear.forward(&xs)?;
                    if i == last && !output_activation {
                        ys
                    } else {
                        activate(ys, *activation)?
                    }
                }
                Layer::Dropout(dropout) => dropout.forward_t(&xs, train)?,
            };
        }

        Ok(xs)
    }

    /// Scores before the output activation, [batch, classes]
    pub fn logits_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.run(xs, train, false)
    }

    /// Inference-mode output: class probabilities, [batch, classes]
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, false, true)
    }

    /// Sum of `l2 * ||W||^2` over regularized conv kernels
    pub fn regularization_loss(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for layer in &self.layers {
            if let Layer::Conv2d {
                conv, l2: Some(l2), ..
            } = layer
            {
                let term = (conv.weight().sqr()?.sum_all()? * *l2)?;
                total = Some(match total {
                    Some(acc) => (acc + term)?,
                    None => term,
                });
            }
        }
        Ok(total)
    }

    pub fn num_parameters(&self) -> usize {
        let mut current = self.input;
        let mut total = 0;
        for (spec, &output) in self.specs.iter().zip(&self.shapes) {
            total += spec.num_parameters(current);
            current = output;
        }
        total
    }

    /// Layer table with output shapes and parameter counts
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("{:<4} {:<12} {:<18} {:>10}", "#", "layer", "output", "params")];
        let mut current = self.input;
        for (i, (spec, &output)) in self.specs.iter().zip(&self.shapes).enumerate() {
            lines.push(format!(
                "{:<4} {:<12} {:<18} {:>10}",
                i,
                spec.name(),
                output.to_string(),
                spec.num_parameters(current)
            ));
            current = output;
        }
        lines.push(format!("total parameters: {}", self.num_parameters()));
        lines.join("\n")
    }
}

/// Index of the largest finite value; the lowest index wins ties
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Fraction of rows whose argmax equals the target label
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> Result<f32> {
    let predicted = logits.argmax(D::Minus1)?;
    let correct = predicted
        .eq(targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct / targets.dim(0)? as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::layers::keyword_cnn;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    fn build(varmap: &VarMap) -> KeywordCnn {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        KeywordCnn::new(Shape::Spatial(1, 44, 13), &keyword_cnn(11), vb).unwrap()
    }

    #[test]
    fn test_output_is_distribution() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        assert_eq!(model.num_classes(), 11);

        let inputs = [
            Tensor::zeros((2, 1, 44, 13), DType::F32, &Device::Cpu).unwrap(),
            Tensor::randn(0f32, 10.0, (3, 1, 44, 13), &Device::Cpu).unwrap(),
        ];
        for xs in &inputs {
            let probs = model.forward(xs).unwrap();
            let (batch, classes) = probs.dims2().unwrap();
            assert_eq!(batch, xs.dim(0).unwrap());
            assert_eq!(classes, 11);
            let rows: Vec<Vec<f32>> = probs.to_vec2().unwrap();
            for row in rows {
                assert!(row.iter().all(|p| p.is_finite() && *p >= 0.0));
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_forward_deterministic_in_eval() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let xs = Tensor::randn(0f32, 1.0, (1, 1, 44, 13), &Device::Cpu).unwrap();
        let a: Vec<Vec<f32>> = model.forward(&xs).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = model.forward(&xs).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_logits_match_probabilities() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let xs = Tensor::randn(0f32, 1.0, (2, 1, 44, 13), &Device::Cpu).unwrap();
        let logits = model.logits_t(&xs, false).unwrap();
        let from_logits: Vec<Vec<f32>> = candle_nn::ops::softmax_last_dim(&logits)
            .unwrap()
            .to_vec2()
            .unwrap();
        let probs: Vec<Vec<f32>> = model.forward(&xs).unwrap().to_vec2().unwrap();
        for (a, b) in from_logits.iter().flatten().zip(probs.iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_wrong_input_shape() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let xs = Tensor::zeros((1, 1, 40, 13), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&xs).is_err());
    }

    #[test]
    fn test_variables_registered() {
        let varmap = VarMap::new();
        let _model = build(&varmap);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("layers.0.weight"));
        assert!(data.contains_key("layers.1.running_mean"));
        assert!(data.contains_key("layers.12.bias"));
        assert_eq!(data["layers.0.weight"].dims(), &[64, 1, 3, 3]);
        assert_eq!(data["layers.10.weight"].dims(), &[64, 160]);
    }

    #[test]
    fn test_regularization_loss_positive() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let loss = model.regularization_loss().unwrap().unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn test_parameter_count() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let expected = (64 * 9 + 64)
            + 128
            + (32 * 64 * 9 + 32)
            + 64
            + (32 * 32 * 4 + 32)
            + 64
            + (160 * 64 + 64)
            + (64 * 11 + 11);
        assert_eq!(model.num_parameters(), expected);
        assert!(model.summary().contains("total parameters"));
    }

    #[test]
    fn test_same_pooling_shape() {
        let xs = Tensor::arange(0f32, 42.0 * 11.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 42, 11))
            .unwrap();
        let pooled = max_pool_2d(&xs, 3, 2, Padding::Same).unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 21, 6]);
        // Bottom-right window covers the last real value
        let values: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(*values.last().unwrap(), 42.0 * 11.0 - 1.0);
    }

    #[test]
    fn test_overlapping_pool_backward() {
        // 5x5 grid holding 5 * row + col, padded by one replicated cell per side
        let xs = Var::from_tensor(
            &Tensor::arange(0f32, 25.0, &Device::Cpu)
                .unwrap()
                .reshape((1, 1, 5, 5))
                .unwrap(),
        )
        .unwrap();
        let pooled = max_pool_2d(xs.as_tensor(), 3, 2, Padding::Same).unwrap();
        let values: Vec<Vec<f32>> = pooled.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(
            values,
            vec![
                vec![6.0, 8.0, 9.0],
                vec![16.0, 18.0, 19.0],
                vec![21.0, 23.0, 24.0]
            ]
        );

        let grads = pooled.sum_all().unwrap().backward().unwrap();
        let grad: Vec<Vec<f32>> = grads
            .get(xs.as_tensor())
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();
        let total: f32 = grad.iter().flatten().sum();
        assert!((total - 9.0).abs() < 1e-5);
        assert!(grad.iter().flatten().all(|&g| g >= 0.0));
        for (row, col) in [(1, 1), (1, 3), (3, 4), (4, 4)] {
            assert!((grad[row][col] - 1.0).abs() < 1e-5, "grad[{row}][{col}]");
        }
        assert_eq!(grad[0][0], 0.0);
        assert_eq!(grad[2][2], 0.0);
    }

    #[test]
    fn test_non_overlapping_pool_matches_candle() {
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 8, 6), &Device::Cpu).unwrap();
        let ours = max_pool_2d(&xs, 2, 2, Padding::Valid).unwrap();
        let reference = xs.max_pool2d_with_stride((2, 2), (2, 2)).unwrap();
        let diff: f32 = (ours - reference).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_argmax_ties_lowest_index() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), Some(1));
        assert_eq!(argmax(&[0.25; 4]), Some(0));
        assert_eq!(argmax(&[0.0, 0.0, 1.0]), Some(2));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_argmax_skips_non_finite() {
        assert_eq!(argmax(&[0.2, f32::NAN, 0.1]), Some(0));
        assert_eq!(argmax(&[f32::NAN, 0.1, 0.3]), Some(2));
        assert_eq!(argmax(&[0.1, f32::INFINITY, 0.3]), Some(2));
        assert_eq!(argmax(&[f32::NAN, f32::NAN]), None);
    }

    #[test]
    fn test_accuracy() {
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 1, 1], &Device::Cpu).unwrap();
        let acc = accuracy(&logits, &targets).unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-6);
    }
}
