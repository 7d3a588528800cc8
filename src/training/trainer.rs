//! Fit, evaluate and persist the keyword classifier

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use super::split::{split_dataset, DataSplits};
use crate::config::KwsConfig;
use crate::dataset::Dataset;
use crate::error::KwsError;
use crate::models::{save_model, KeywordCnn, ModelMetadata};

/// Loss and accuracy over one pass of a partition
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochMetrics {
    /// 1-based
    pub epoch: usize,
    pub train: Metrics,
    pub validation: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub train_examples: usize,
    pub validation_examples: usize,
    pub test_examples: usize,
    pub history: Vec<EpochMetrics>,
    pub test: Metrics,
}

impl TrainingReport {
    pub fn final_epoch(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }
}

pub struct Trainer {
    config: KwsConfig,
    device: Device,
}

impl Trainer {
    pub fn new(config: KwsConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &KwsConfig {
        &self.config
    }

    fn rng(&self) -> StdRng {
        match self.config.training.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    /// Refuse datasets whose features or labels do not fit the configuration
    pub fn check_dataset(&self, dataset: &Dataset) -> Result<()> {
        dataset.validate()?;
        anyhow::ensure!(!dataset.is_empty(), "dataset has no examples");

        let expected = (
            self.config.features.num_frames(),
            self.config.features.n_mfcc,
        );
        if let Some(shape) = dataset.feature_shape() {
            if shape != expected {
                return Err(KwsError::ConfigMismatch(format!(
                    "dataset features are {shape:?}, configuration expects {expected:?}"
                ))
                .into());
            }
        }

        if !dataset.mapping.is_consistent_with(&self.config.keywords) {
            return Err(KwsError::ConfigMismatch(format!(
                "dataset categories {:?} do not match the keyword order {:?}",
                dataset.mapping.names(),
                self.config.keywords
            ))
            .into());
        }

        let num_keywords = self.config.num_keywords();
        if let Some(&label) = dataset.labels.iter().find(|&&l| l as usize >= num_keywords) {
            return Err(KwsError::ConfigMismatch(format!(
                "label {label} is outside the {num_keywords} configured keywords"
            ))
            .into());
        }
        Ok(())
    }

    /// Split, fit, evaluate on the held-out test set and save the model
    pub fn train(&self, dataset: &Dataset) -> Result<TrainingReport> {
        self.check_dataset(dataset)?;

        let training = &self.config.training;
        let mut rng = self.rng();
        let splits = split_dataset(
            dataset,
            training.test_size,
            training.validation_size,
            &mut rng,
        )?;
        tracing::info!(
            "Split {} examples: {} train, {} validation, {} test",
            dataset.len(),
            splits.train.len(),
            splits.validation.len(),
            splits.test.len()
        );

        let metadata = ModelMetadata::new(&self.config);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = metadata.build(vb)?;
        tracing::info!("Model summary:\n{}", model.summary());

        let history = self.fit(&model, &varmap, &splits, &mut rng)?;

        let (test_xs, test_ys) = splits.test.to_tensors(&self.device)?;
        let test = evaluate(&model, &test_xs, &test_ys, training.batch_size)?;
        tracing::info!(
            "Test loss {:.4}, test accuracy {:.4}",
            test.loss,
            test.accuracy
        );

        save_model(&varmap, &metadata, &self.config.model_path)?;

        Ok(TrainingReport {
            train_examples: splits.train.len(),
            validation_examples: splits.validation.len(),
            test_examples: splits.test.len(),
            history,
            test,
        })
    }

    /// Run the configured number of epochs over the train partition
    pub fn fit(
        &self,
        model: &KeywordCnn,
        varmap: &VarMap,
        splits: &DataSplits,
        rng: &mut StdRng,
    ) -> Result<Vec<EpochMetrics>> {
        let training = &self.config.training;
        let (train_xs, train_ys) = splits.train.to_tensors(&self.device)?;
        let (val_xs, val_ys) = splits.validation.to_tensors(&self.device)?;

        let params = ParamsAdamW {
            lr: training.learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        };
        let mut optimizer = AdamW::new(trainable_vars(varmap)?, params)?;

        let mut order: Vec<u32> = (0..splits.train.len() as u32).collect();
        let mut history = Vec::with_capacity(training.epochs);

        for epoch in 1..=training.epochs {
            order.shuffle(rng);

            let mut loss_sum = 0.0f32;
            let mut correct = 0.0f32;
            for batch in order.chunks(training.batch_size) {
                let index = Tensor::new(batch, &self.device)?;
                let xs = train_xs.index_select(&index, 0)?;
                let ys = train_ys.index_select(&index, 0)?;

                let logits = model.logits_t(&xs, true)?;
                let loss = total_loss(model, &logits, &ys)?;
                optimizer.backward_step(&loss)?;

                let n = batch.len() as f32;
                let batch_loss = loss.to_scalar::<f32>()?;
                anyhow::ensure!(
                    batch_loss.is_finite(),
                    "loss diverged in epoch {epoch}"
                );
                loss_sum += batch_loss * n;
                correct += crate::models::accuracy(&logits, &ys)? * n;
            }

            let n = order.len() as f32;
            let train = Metrics {
                loss: loss_sum / n,
                accuracy: correct / n,
            };
            let validation = evaluate(model, &val_xs, &val_ys, training.batch_size)?;

            tracing::info!(
                "Epoch {}/{}: loss {:.4}, accuracy {:.4}, val_loss {:.4}, val_accuracy {:.4}",
                epoch,
                training.epochs,
                train.loss,
                train.accuracy,
                validation.loss,
                validation.accuracy
            );
            history.push(EpochMetrics {
                epoch,
                train,
                validation,
            });
        }

        Ok(history)
    }
}

/// Cross-entropy plus the L2 penalty of the regularized layers
fn total_loss(model: &KeywordCnn, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let loss = candle_nn::loss::cross_entropy(logits, targets)?;
    Ok(match model.regularization_loss()? {
        Some(penalty) => (loss + penalty)?,
        None => loss,
    })
}

/// Inference-mode loss and accuracy over `xs`, in batches of `batch_size`
pub fn evaluate(model: &KeywordCnn, xs: &Tensor, ys: &Tensor, batch_size: usize) -> Result<Metrics> {
    let total = xs.dim(0)?;
    anyhow::ensure!(total > 0, "cannot evaluate on an empty partition");
    let batch_size = batch_size.max(1);

    let mut loss_sum = 0.0f32;
    let mut correct = 0.0f32;
    let mut start = 0;
    while start < total {
        let len = batch_size.min(total - start);
        let bx = xs.narrow(0, start, len)?;
        let by = ys.narrow(0, start, len)?;
        let logits = model.logits_t(&bx, false)?;
        let ce = candle_nn::loss::cross_entropy(&logits, &by)?.to_scalar::<f32>()?;
        loss_sum += ce * len as f32;
        correct += crate::models::accuracy(&logits, &by)? * len as f32;
        start += len;
    }

    let penalty = match model.regularization_loss()? {
        Some(penalty) => penalty.to_scalar::<f32>()?,
        None => 0.0,
    };
    Ok(Metrics {
        loss: loss_sum / total as f32 + penalty,
        accuracy: correct / total as f32,
    })
}

/// Every variable except batch-norm running statistics
fn trainable_vars(varmap: &VarMap) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut vars: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(b.0));
    Ok(vars.into_iter().map(|(_, var)| var.clone()).collect())
}

/// Train on the dataset file at `data_path` with `config`
pub fn train_from_file(
    config: KwsConfig,
    device: Device,
    data_path: &std::path::Path,
) -> Result<TrainingReport> {
    let dataset = Dataset::load(data_path)
        .with_context(|| format!("Failed to load training data from {}", data_path.display()))?;
    tracing::info!(
        "Loaded {} examples over {} categories from {}",
        dataset.len(),
        dataset.mapping.len(),
        data_path.display()
    );
    Trainer::new(config, device)?.train(&dataset)
}
