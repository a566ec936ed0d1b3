// External imports
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_2_lstm_cell::StackedLstm;
use crate::constants::{DENSE_SIZE, DROPOUT, HIDDEN_SIZE, NUM_LAYERS};

/// Stacked LSTM whose hidden states are pooled with learned attention weights
/// before a small dense regression head.
#[derive(Module, Debug)]
pub struct AttentionLstmModel<B: Backend> {
    // Model hyperparameters
    input_size: usize,
    hidden_size: usize,

    // Model layers
    lstm: StackedLstm<B>,
    attention: Linear<B>,
    dense: Linear<B>,
    dropout: Dropout,
    output_layer: Linear<B>,
}

impl<B: Backend> AttentionLstmModel<B> {
    /// Create a new model from its configuration
    pub fn new(config: &AttentionLstmConfig, device: &B::Device) -> Self {
        let lstm = StackedLstm::new(
            config.input_size,
            config.hidden_size,
            config.num_layers,
            config.dropout,
            device,
        );

        Self {
            input_size: config.input_size,
            hidden_size: config.hidden_size,
            lstm,
            attention: LinearConfig::new(config.hidden_size, 1).init(device),
            dense: LinearConfig::new(config.hidden_size, config.dense_size).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output_layer: LinearConfig::new(config.dense_size, 1).init(device),
        }
    }

    /// Softmax-normalized attention weights over the time axis
    ///
    /// # Arguments
    ///
    /// * `hidden` - LSTM hidden states of shape [batch_size, sequence_length, hidden_size]
    ///
    /// # Returns
    ///
    /// Weights of shape [batch_size, sequence_length, 1] summing to 1 per window
    pub fn attention_weights(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let scores = self.attention.forward(hidden);
        activation::softmax(scores, 1)
    }

    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch_size, sequence_length, input_size]
    ///
    /// # Returns
    ///
    /// The predicted scaled next-day close of shape [batch_size, 1]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, _, _] = x.dims();

        let hidden = self.lstm.forward(x);
        let weights = self
            .attention_weights(hidden.clone())
            .repeat_dim(2, self.hidden_size);

        // Weighted sum collapses the time axis
        let context = (weights * hidden)
            .sum_dim(1)
            .reshape([batch_size, self.hidden_size]);

        let dense = activation::relu(self.dense.forward(context));
        let dropped = self.dropout.forward(dense);
        self.output_layer.forward(dropped)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }
}

/// Architecture of an [`AttentionLstmModel`], stored alongside its weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionLstmConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dense_size: usize,
    pub dropout: f64,
}

impl AttentionLstmConfig {
    /// Default architecture: 2 layers of 128 units, dense head of 64, dropout 0.2
    pub fn new(input_size: usize) -> Self {
        Self {
            input_size,
            hidden_size: HIDDEN_SIZE,
            num_layers: NUM_LAYERS,
            dense_size: DENSE_SIZE,
            dropout: DROPOUT,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionLstmModel<B> {
        AttentionLstmModel::new(self, device)
    }
}
