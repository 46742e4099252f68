//! Classification head: pool, refine with global attention, project to
//! class probabilities.

use candle_core::{Result, Tensor};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};
use layers::GlobalAttention;

use crate::config::ModelConfig;

#[derive(Debug, Clone)]
pub struct ClassifierHead {
    attn: GlobalAttention,
    hidden: Linear,
    output: Linear,
    dropout: (f32, f32),
}

impl ClassifierHead {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let channels = config.final_channels();
        let attn = GlobalAttention::new(
            channels,
            config.head_num_heads,
            config.head_attn_dropout,
            vb.pp("attn"),
        )?;
        let hidden = linear(channels, config.head_hidden, vb.pp("fc1"))?;
        let output = linear(config.head_hidden, config.num_classes, vb.pp("fc2"))?;
        Ok(Self {
            attn,
            hidden,
            output,
            dropout: config.head_dropout,
        })
    }

    /// `x` is the final stage's `(batch, channels, h, w)` feature map; the
    /// result is a `(batch, num_classes)` probability matrix whose rows sum
    /// to one.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let pooled = x.mean(3)?.mean(2)?;
        // Length-1 sequence: attention degenerates into a learned reweighting.
        let refined = self.attn.forward(&pooled.unsqueeze(1)?, train)?;
        let mut h = refined.squeeze(1)?;
        if train && self.dropout.0 > 0.0 {
            h = ops::dropout(&h, self.dropout.0)?;
        }
        h = self.hidden.forward(&h)?.silu()?;
        if train && self.dropout.1 > 0.0 {
            h = ops::dropout(&h, self.dropout.1)?;
        }
        let logits = self.output.forward(&h)?;
        ops::softmax(&logits, candle_core::D::Minus1)
    }
}
