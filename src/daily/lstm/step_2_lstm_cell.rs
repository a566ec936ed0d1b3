// External imports
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};

/// A single LSTM layer unrolled over the time axis
#[derive(Module, Debug)]
pub struct LstmLayer<B: Backend> {
    input_size: usize,
    hidden_size: usize,

    // Input projections
    input_gate: Linear<B>,
    forget_gate: Linear<B>,
    cell_gate: Linear<B>,
    output_gate: Linear<B>,

    // Recurrent connections
    input_recurrent: Linear<B>,
    forget_recurrent: Linear<B>,
    cell_recurrent: Linear<B>,
    output_recurrent: Linear<B>,
}

impl<B: Backend> LstmLayer<B> {
    /// Create a new LSTM layer
    ///
    /// # Arguments
    ///
    /// * `input_size` - Number of input features per timestep
    /// * `hidden_size` - Size of hidden state
    /// * `device` - Device to place tensors on
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let input_projection = || LinearConfig::new(input_size, hidden_size).init(device);
        let recurrent_projection = || LinearConfig::new(hidden_size, hidden_size).init(device);

        Self {
            input_size,
            hidden_size,
            input_gate: input_projection(),
            forget_gate: input_projection(),
            cell_gate: input_projection(),
            output_gate: input_projection(),
            input_recurrent: recurrent_projection(),
            forget_recurrent: recurrent_projection(),
            cell_recurrent: recurrent_projection(),
            output_recurrent: recurrent_projection(),
        }
    }

    /// Forward pass through the layer
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch_size, sequence_length, input_size]
    ///
    /// # Returns
    ///
    /// Hidden states of shape [batch_size, sequence_length, hidden_size]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let device = x.device();
        let [batch_size, sequence_length, _] = x.dims();

        // Project every timestep at once, the recurrence only adds the hidden terms
        let x_i = self.input_gate.forward(x.clone());
        let x_f = self.forget_gate.forward(x.clone());
        let x_g = self.cell_gate.forward(x.clone());
        let x_o = self.output_gate.forward(x);

        let mut h = Tensor::<B, 2>::zeros([batch_size, self.hidden_size], &device);
        let mut c = Tensor::<B, 2>::zeros([batch_size, self.hidden_size], &device);
        let mut outputs = Vec::with_capacity(sequence_length);

        for t in 0..sequence_length {
            let at_t = |projection: &Tensor<B, 3>| {
                projection
                    .clone()
                    .narrow(1, t, 1)
                    .reshape([batch_size, self.hidden_size])
            };

            let i_t = activation::sigmoid(at_t(&x_i) + self.input_recurrent.forward(h.clone()));
            let f_t = activation::sigmoid(at_t(&x_f) + self.forget_recurrent.forward(h.clone()));
            let g_t = activation::tanh(at_t(&x_g) + self.cell_recurrent.forward(h.clone()));
            let o_t = activation::sigmoid(at_t(&x_o) + self.output_recurrent.forward(h.clone()));

            c = f_t * c + i_t * g_t;
            h = o_t * activation::tanh(c.clone());

            outputs.push(h.clone());
        }

        Tensor::stack::<3>(outputs, 1)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// Stacked LSTM with dropout between layers (not after the last one)
#[derive(Module, Debug)]
pub struct StackedLstm<B: Backend> {
    hidden_size: usize,
    layers: Vec<LstmLayer<B>>,
    dropout: Dropout,
}

impl<B: Backend> StackedLstm<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout_rate: f64,
        device: &B::Device,
    ) -> Self {
        let layers = (0..num_layers.max(1))
            .map(|layer| {
                let layer_input = if layer == 0 { input_size } else { hidden_size };
                LstmLayer::new(layer_input, hidden_size, device)
            })
            .collect();

        Self {
            hidden_size,
            layers,
            dropout: DropoutConfig::new(dropout_rate).init(),
        }
    }

    /// Maps [batch_size, sequence_length, input_size] to the top layer's
    /// hidden states [batch_size, sequence_length, hidden_size]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let last = self.layers.len() - 1;
        self.layers
            .iter()
            .enumerate()
            .fold(x, |input, (i, layer)| {
                let output = layer.forward(input);
                if i < last {
                    self.dropout.forward(output)
                } else {
                    output
                }
            })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
