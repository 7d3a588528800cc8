//! Neural network model for keyword classification
//!
//! This module contains:
//! - `layers`: Declarative layer descriptors and shape inference
//! - `cnn`: The candle network built from those descriptors
//! - `artifact`: Saving and loading trained models

pub mod artifact;
pub mod cnn;
pub mod layers;

pub use artifact::{load_metadata, load_model, save_model, ModelMetadata};
pub use cnn::{accuracy, argmax, KeywordCnn};
pub use layers::{infer_shapes, keyword_cnn, Activation, LayerSpec, Padding, Shape};
