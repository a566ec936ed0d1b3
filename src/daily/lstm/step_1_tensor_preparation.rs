// External crates
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

// Internal modules
use crate::constants::{CLOSE_FEATURE_INDEX, NUM_FEATURES};
use crate::error::{PredictorError, Result};
use crate::util::feature_engineering::PriceRow;

/// A complete feature vector in `FEATURE_COLUMNS` order
pub type FeatureVector = [f64; NUM_FEATURES];

/// Fills missing feature values: forward fill first, then zero fill.
///
/// A gap in the middle of a column inherits the last valid value; only
/// leading gaps become zero. Fails when every value of the table is missing.
pub fn fill_missing_features(rows: &[PriceRow]) -> Result<Vec<FeatureVector>> {
    let mut last_valid: [Option<f64>; NUM_FEATURES] = [None; NUM_FEATURES];
    let mut observed = 0usize;

    let filled: Vec<FeatureVector> = rows
        .iter()
        .map(|row| {
            let mut vector = [0.0; NUM_FEATURES];
            for (j, value) in row.features().into_iter().enumerate() {
                if value.is_some() {
                    last_valid[j] = value;
                    observed += 1;
                }
                vector[j] = last_valid[j].unwrap_or(0.0);
            }
            vector
        })
        .collect();

    if !rows.is_empty() && observed == 0 {
        return Err(PredictorError::DegenerateIndicator(format!(
            "all {} feature values of {} rows are missing",
            rows.len() * NUM_FEATURES,
            rows.len()
        )));
    }

    Ok(filled)
}

/// Stacks feature vectors into a `[rows, features]` matrix
pub fn feature_matrix(features: &[FeatureVector]) -> Array2<f64> {
    Array2::from_shape_fn((features.len(), NUM_FEATURES), |(i, j)| features[i][j])
}

/// Per-dimension min-max scaling into [0, 1].
///
/// Dimensions with zero range are shifted by their minimum only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    data_min: Vec<f64>,
    data_max: Vec<f64>,
}

impl MinMaxScaler {
    /// Fits the observed min/max of every column of `data`
    pub fn fit(data: ArrayView2<f64>) -> Result<Self> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(PredictorError::insufficient("scaler fit", 1, data.nrows()));
        }
        let finite_rows = data
            .axis_iter(Axis(0))
            .filter(|row| row.iter().all(|v| v.is_finite()))
            .count();
        if finite_rows < data.nrows() {
            // Non-finite values never reach the scaler through the fill policy
            return Err(PredictorError::insufficient(
                "scaler fit (finite rows)",
                data.nrows(),
                finite_rows,
            ));
        }

        let data_min = data.fold_axis(Axis(0), f64::INFINITY, |&acc, &v| acc.min(v));
        let data_max = data.fold_axis(Axis(0), f64::NEG_INFINITY, |&acc, &v| acc.max(v));

        Ok(Self {
            data_min: data_min.to_vec(),
            data_max: data_max.to_vec(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.data_min.len()
    }

    pub fn data_min(&self) -> &[f64] {
        &self.data_min
    }

    pub fn data_max(&self) -> &[f64] {
        &self.data_max
    }

    fn range(&self, j: usize) -> f64 {
        let range = self.data_max[j] - self.data_min[j];
        if range == 0.0 {
            1.0
        } else {
            range
        }
    }

    pub fn transform_value(&self, j: usize, value: f64) -> f64 {
        (value - self.data_min[j]) / self.range(j)
    }

    pub fn inverse_transform_value(&self, j: usize, value: f64) -> f64 {
        value * self.range(j) + self.data_min[j]
    }

    pub fn transform(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let mut out = data.to_owned();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            column.mapv_inplace(|v| self.transform_value(j, v));
        }
        out
    }

    pub fn inverse_transform(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let mut out = data.to_owned();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            column.mapv_inplace(|v| self.inverse_transform_value(j, v));
        }
        out
    }
}

/// The fitted feature and target transforms of one symbol.
///
/// Fitted once per training run and stored in the checkpoint; inference
/// only ever applies the stored instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingTransform {
    pub features: MinMaxScaler,
    pub target: MinMaxScaler,
}

impl ScalingTransform {
    /// Fits both transforms on the whole feature table
    pub fn fit(features: &[FeatureVector]) -> Result<Self> {
        let matrix = feature_matrix(features);
        let target = matrix.column(CLOSE_FEATURE_INDEX).to_owned().insert_axis(Axis(1));

        Ok(Self {
            features: MinMaxScaler::fit(matrix.view())?,
            target: MinMaxScaler::fit(target.view())?,
        })
    }

    pub fn scale_features(&self, features: &[FeatureVector]) -> Array2<f64> {
        self.features.transform(feature_matrix(features).view())
    }

    pub fn scale_target(&self, close: ArrayView1<f64>) -> Array1<f64> {
        close.mapv(|v| self.target.transform_value(0, v))
    }

    pub fn unscale_target(&self, value: f64) -> f64 {
        self.target.inverse_transform_value(0, value)
    }
}

/// Overlapping windows of scaled features paired with the next scaled close
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    sequence_length: usize,
    num_features: usize,
    // [windows, sequence_length, num_features], row-major
    inputs: Vec<f32>,
    targets: Vec<f32>,
}

impl SequenceDataset {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn window(&self, index: usize) -> &[f32] {
        let size = self.sequence_length * self.num_features;
        &self.inputs[index * size..(index + 1) * size]
    }

    pub fn target(&self, index: usize) -> f32 {
        self.targets[index]
    }

    pub fn targets(&self, range: Range<usize>) -> &[f32] {
        &self.targets[range]
    }

    /// Time-ordered split: the first `1 - validation_split` windows train,
    /// the tail validates.
    pub fn split(&self, validation_split: f64) -> Result<(Range<usize>, Range<usize>)> {
        if !(0.0..1.0).contains(&validation_split) || validation_split == 0.0 {
            return Err(PredictorError::Config(format!(
                "validation split must be in (0, 1), got {validation_split}"
            )));
        }

        let n_samples = self.len();
        let split_idx = (n_samples as f64 * (1.0 - validation_split)) as usize;
        if split_idx == 0 || split_idx >= n_samples {
            return Err(PredictorError::insufficient(
                "train/validation split (windows)",
                2,
                n_samples,
            ));
        }

        Ok((0..split_idx, split_idx..n_samples))
    }

    /// Converts a range of windows into `[n, seq, features]` inputs and `[n, 1]` targets
    pub fn to_tensors<B: Backend>(
        &self,
        range: Range<usize>,
        device: &B::Device,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let size = self.sequence_length * self.num_features;
        let n = range.len();

        let inputs = self.inputs[range.start * size..range.end * size].to_vec();
        let targets = self.targets[range].to_vec();

        let features_tensor = Tensor::<B, 3>::from_data(
            TensorData::new(inputs, [n, self.sequence_length, self.num_features]),
            device,
        );
        let targets_tensor = Tensor::<B, 2>::from_data(TensorData::new(targets, [n, 1]), device);

        (features_tensor, targets_tensor)
    }
}

/// Slices scaled rows into windows `[i, i + L)` labelled with the target at `i + L`.
///
/// Produces `N - L` windows from `N` rows.
pub fn prepare_sequences(
    scaled_features: ArrayView2<f64>,
    scaled_target: ArrayView1<f64>,
    sequence_length: usize,
) -> Result<SequenceDataset> {
    let n_rows = scaled_features.nrows();
    if sequence_length == 0 || n_rows <= sequence_length {
        return Err(PredictorError::insufficient(
            "sequence windows (rows)",
            sequence_length + 1,
            n_rows,
        ));
    }

    let num_features = scaled_features.ncols();
    let num_samples = n_rows - sequence_length;
    let mut inputs = Vec::with_capacity(num_samples * sequence_length * num_features);
    let mut targets = Vec::with_capacity(num_samples);

    for i in 0..num_samples {
        for row in scaled_features.slice(ndarray::s![i..i + sequence_length, ..]).rows() {
            inputs.extend(row.iter().map(|&v| v as f32));
        }
        targets.push(scaled_target[i + sequence_length] as f32);
    }

    debug!(
        "Prepared {} windows of {}x{} from {} rows",
        num_samples, sequence_length, num_features, n_rows
    );

    Ok(SequenceDataset {
        sequence_length,
        num_features,
        inputs,
        targets,
    })
}

/// Fills, fits the scaling transform on the whole table and windows it
pub fn prepare_training_data(
    rows: &[PriceRow],
    sequence_length: usize,
) -> Result<(ScalingTransform, SequenceDataset)> {
    if rows.len() <= sequence_length {
        return Err(PredictorError::insufficient(
            "sequence windows (rows)",
            sequence_length + 1,
            rows.len(),
        ));
    }

    let features = fill_missing_features(rows)?;
    let scaling = ScalingTransform::fit(&features)?;

    let scaled_features = scaling.scale_features(&features);
    let close = feature_matrix(&features).column(CLOSE_FEATURE_INDEX).to_owned();
    let scaled_target = scaling.scale_target(close.view());

    let dataset = prepare_sequences(scaled_features.view(), scaled_target.view(), sequence_length)?;
    info!(
        "Prepared {} training windows from {} rows",
        dataset.len(),
        rows.len()
    );

    Ok((scaling, dataset))
}

/// Scales the most recent `sequence_length` feature vectors with a stored transform
pub fn latest_window<B: Backend>(
    features: &[FeatureVector],
    scaling: &ScalingTransform,
    sequence_length: usize,
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    if features.len() < sequence_length {
        return Err(PredictorError::insufficient(
            "prediction window (rows)",
            sequence_length,
            features.len(),
        ));
    }

    let recent = &features[features.len() - sequence_length..];
    let scaled = scaling.scale_features(recent);
    let data: Vec<f32> = scaled.iter().map(|&v| v as f32).collect();

    Ok(Tensor::<B, 3>::from_data(
        TensorData::new(data, [1, sequence_length, NUM_FEATURES]),
        device,
    ))
}
