//! Declarative layer descriptors
//!
//! The network topology is data: a list of [`LayerSpec`] values that the
//! builder in [`super::cnn`] turns into candle modules. Shapes can be
//! propagated through the list without touching any tensor, which is how
//! the builder sizes each layer and how the topology is checked.

use serde::{Deserialize, Serialize};

use crate::error::KwsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    /// Only valid on the final layer
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// No padding, windows must fit entirely
    Valid,
    /// Output size is `ceil(input / stride)`
    Same,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Square-kernel 2D convolution with valid padding
    Conv2d {
        filters: usize,
        kernel: usize,
        activation: Activation,
        /// L2 penalty on the kernel weights
        #[serde(default)]
        l2: Option<f64>,
    },
    BatchNorm,
    MaxPool2d {
        kernel: usize,
        stride: usize,
        padding: Padding,
    },
    Flatten,
    Dense {
        units: usize,
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
}

/// Activation shape flowing between layers (batch axis excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    /// (channels, height, width)
    Spatial(usize, usize, usize),
    Flat(usize),
}

impl Shape {
    pub fn num_elements(&self) -> usize {
        match *self {
            Self::Spatial(c, h, w) => c * h * w,
            Self::Flat(n) => n,
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spatial(c, h, w) => write!(f, "({c}, {h}, {w})"),
            Self::Flat(n) => write!(f, "({n})"),
        }
    }
}

/// (before, after) padding that gives `ceil(input / stride)` windows
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = input.div_ceil(stride);
    let total = ((output - 1) * stride + kernel).saturating_sub(input);
    (total / 2, total - total / 2)
}

fn pooled_size(input: usize, kernel: usize, stride: usize, padding: Padding) -> Option<usize> {
    match padding {
        Padding::Same => Some(input.div_ceil(stride)),
        Padding::Valid => (input >= kernel).then(|| (input - kernel) / stride + 1),
    }
}

impl LayerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::BatchNorm => "batch_norm",
            Self::MaxPool2d { .. } => "max_pool2d",
            Self::Flatten => "flatten",
            Self::Dense { .. } => "dense",
            Self::Dropout { .. } => "dropout",
        }
    }

    /// Shape produced by this layer for `input`
    pub fn output_shape(&self, input: Shape) -> Result<Shape, KwsError> {
        let invalid = |reason: String| KwsError::InvalidArchitecture(reason);

        match (self, input) {
            (Self::Conv2d { filters, kernel, .. }, Shape::Spatial(_, h, w)) => {
                if *kernel == 0 || *filters == 0 {
                    return Err(invalid("conv2d needs non-zero filters and kernel".into()));
                }
                if h < *kernel || w < *kernel {
                    return Err(invalid(format!(
                        "conv2d kernel {kernel} does not fit input {input}"
                    )));
                }
                Ok(Shape::Spatial(*filters, h - kernel + 1, w - kernel + 1))
            }
            (Self::BatchNorm, shape) => Ok(shape),
            (
                Self::MaxPool2d {
                    kernel,
                    stride,
                    padding,
                },
                Shape::Spatial(c, h, w),
            ) => {
                if *kernel == 0 || *stride == 0 {
                    return Err(invalid("max_pool2d needs non-zero kernel and stride".into()));
                }
                let out_h = pooled_size(h, *kernel, *stride, *padding);
                let out_w = pooled_size(w, *kernel, *stride, *padding);
                match (out_h, out_w) {
                    (Some(out_h), Some(out_w)) => Ok(Shape::Spatial(c, out_h, out_w)),
                    _ => Err(invalid(format!(
                        "max_pool2d kernel {kernel} does not fit input {input}"
                    ))),
                }
            }
            (Self::Flatten, shape) => Ok(Shape::Flat(shape.num_elements())),
            (Self::Dense { units, .. }, Shape::Flat(_)) => {
                if *units == 0 {
                    return Err(invalid("dense needs at least one unit".into()));
                }
                Ok(Shape::Flat(*units))
            }
            (Self::Dropout { rate }, shape) => {
                if !(0.0..1.0).contains(rate) {
                    return Err(invalid(format!("dropout rate {rate} outside [0, 1)")));
                }
                Ok(shape)
            }
            (layer, shape) => Err(invalid(format!(
                "{} cannot take input of shape {}",
                layer.name(),
                shape
            ))),
        }
    }

    /// Trainable parameter count for `input`
    pub fn num_parameters(&self, input: Shape) -> usize {
        match (self, input) {
            (Self::Conv2d { filters, kernel, .. }, Shape::Spatial(c, _, _)) => {
                filters * c * kernel * kernel + filters
            }
            (Self::BatchNorm, Shape::Spatial(c, _, _)) => 2 * c,
            (Self::BatchNorm, Shape::Flat(n)) => 2 * n,
            (Self::Dense { units, .. }, Shape::Flat(n)) => units * n + units,
            _ => 0,
        }
    }
}

/// Output shape of every layer, checking the whole stack
pub fn infer_shapes(input: Shape, layers: &[LayerSpec]) -> Result<Vec<Shape>, KwsError> {
    let mut shapes = Vec::with_capacity(layers.len());
    let mut current = input;
    for (i, layer) in layers.iter().enumerate() {
        let is_last = i + 1 == layers.len();
        if let LayerSpec::Dense {
            activation: Activation::Softmax,
            ..
        } = layer
        {
            if !is_last {
                return Err(KwsError::InvalidArchitecture(format!(
                    "softmax on layer {i} which is not the output layer"
                )));
            }
        }
        if let LayerSpec::Conv2d {
            activation: Activation::Softmax,
            ..
        } = layer
        {
            return Err(KwsError::InvalidArchitecture(
                "softmax is not supported on conv2d".into(),
            ));
        }
        current = layer.output_shape(current)?;
        shapes.push(current);
    }
    Ok(shapes)
}

fn conv_block(filters: usize, kernel: usize, pool: usize) -> [LayerSpec; 3] {
    [
        LayerSpec::Conv2d {
            filters,
            kernel,
            activation: Activation::Relu,
            l2: Some(0.001),
        },
        LayerSpec::BatchNorm,
        LayerSpec::MaxPool2d {
            kernel: pool,
            stride: 2,
            padding: Padding::Same,
        },
    ]
}

/// Three conv blocks, a 64-unit dense layer with dropout, softmax output
pub fn keyword_cnn(num_keywords: usize) -> Vec<LayerSpec> {
    let mut layers = Vec::with_capacity(13);
    layers.extend(conv_block(64, 3, 3));
    layers.extend(conv_block(32, 3, 3));
    layers.extend(conv_block(32, 2, 2));
    layers.extend([
        LayerSpec::Flatten,
        LayerSpec::Dense {
            units: 64,
            activation: Activation::Relu,
        },
        LayerSpec::Dropout { rate: 0.3 },
        LayerSpec::Dense {
            units: num_keywords,
            activation: Activation::Softmax,
        },
    ]);
    layers
}
