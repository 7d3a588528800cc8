//! Random train / validation / test partitions
//!
//! The split is a plain shuffled split, not stratified: small classes can
//! end up under-represented (or absent) in the validation and test sets.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::audio::FeatureMatrix;
use crate::dataset::Dataset;

/// Subset of a dataset's features and labels
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub features: Vec<FeatureMatrix>,
    pub labels: Vec<u32>,
}

impl Partition {
    fn select(dataset: &Dataset, indices: &[usize]) -> Self {
        Self {
            features: indices.iter().map(|&i| dataset.mfccs[i].clone()).collect(),
            labels: indices.iter().map(|&i| dataset.labels[i]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Inputs as [examples, 1, frames, coefficients] and labels as [examples]
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        anyhow::ensure!(!self.is_empty(), "cannot build tensors for an empty partition");
        let (frames, coeffs) = self.features[0].shape();

        let mut flat: Vec<f32> = Vec::with_capacity(self.len() * frames * coeffs);
        for matrix in &self.features {
            anyhow::ensure!(
                matrix.shape() == (frames, coeffs),
                "feature shape {:?} differs from {:?}",
                matrix.shape(),
                (frames, coeffs)
            );
            flat.extend(matrix.frames().iter().flatten());
        }

        let xs = Tensor::from_vec(flat, (self.len(), 1, frames, coeffs), device)?;
        let ys = Tensor::from_vec(self.labels.clone(), self.len(), device)?;
        Ok((xs, ys))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSplits {
    pub train: Partition,
    pub validation: Partition,
    pub test: Partition,
}

/// Shuffle `0..n` and hold out `ceil(test_size * n)` indices.
///
/// Returns (kept, held_out).
pub fn train_test_split<R: Rng + ?Sized>(
    n: usize,
    test_size: f64,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>)> {
    anyhow::ensure!(
        test_size > 0.0 && test_size < 1.0,
        "test_size must be in (0, 1), got {test_size}"
    );
    let n_test = (test_size * n as f64).ceil() as usize;
    anyhow::ensure!(
        n_test < n,
        "{n} examples are too few to hold out {test_size} of them"
    );

    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let train = indices.split_off(n_test);
    Ok((train, indices))
}

/// Hold out `test_size` for testing, then `validation_size` of the rest
pub fn split_dataset<R: Rng + ?Sized>(
    dataset: &Dataset,
    test_size: f64,
    validation_size: f64,
    rng: &mut R,
) -> Result<DataSplits> {
    let (rest, test) = train_test_split(dataset.len(), test_size, rng)?;
    let (train, validation) = train_test_split(rest.len(), validation_size, rng)?;

    let train: Vec<usize> = train.into_iter().map(|i| rest[i]).collect();
    let validation: Vec<usize> = validation.into_iter().map(|i| rest[i]).collect();

    Ok(DataSplits {
        train: Partition::select(dataset, &train),
        validation: Partition::select(dataset, &validation),
        test: Partition::select(dataset, &test),
    })
}
