//! Squeeze-excite channel gating.
//!
//! Global-average-pools a feature map to one scalar per channel, pushes the
//! summary through a bottleneck pair of dense layers (swish then sigmoid),
//! and rescales the map channel-wise. The convolutional path consumes
//! channels-first maps, the transformer path channels-last ones, so both
//! entry points are provided over the same parameters.

use candle_core::{Error, Result, Tensor};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};

#[derive(Debug, Clone)]
pub struct SqueezeExcite {
    reduce: Linear,
    expand: Linear,
    channels: usize,
}

impl SqueezeExcite {
    /// `reduction` divides the channel count to size the bottleneck.
    pub fn new(channels: usize, reduction: usize, vb: VarBuilder) -> Result<Self> {
        if reduction == 0 {
            return Err(Error::Msg("squeeze-excite reduction must be non-zero".into()));
        }
        let hidden = (channels / reduction).max(1);
        let reduce = linear(channels, hidden, vb.pp("reduce"))?;
        let expand = linear(hidden, channels, vb.pp("expand"))?;
        Ok(Self {
            reduce,
            expand,
            channels,
        })
    }

    /// Per-channel gate in `[0, 1]`, computed from a pooled `(batch, channels)`
    /// summary.
    fn gate(&self, pooled: &Tensor) -> Result<Tensor> {
        let hidden = self.reduce.forward(pooled)?.silu()?;
        ops::sigmoid(&self.expand.forward(&hidden)?)
    }

    /// Rescales a `(batch, channels, h, w)` map.
    pub fn scale_nchw(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, _, _) = x.dims4()?;
        self.check_channels(channels)?;
        let pooled = x.mean(3)?.mean(2)?;
        let gate = self.gate(&pooled)?.reshape((batch, channels, 1, 1))?;
        x.broadcast_mul(&gate)
    }

    /// Rescales a `(batch, h, w, channels)` map.
    pub fn scale_nhwc(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, _, _, channels) = x.dims4()?;
        self.check_channels(channels)?;
        let pooled = x.mean(2)?.mean(1)?;
        let gate = self.gate(&pooled)?.reshape((batch, 1, 1, channels))?;
        x.broadcast_mul(&gate)
    }

    fn check_channels(&self, channels: usize) -> Result<()> {
        if channels != self.channels {
            return Err(Error::Msg(format!(
                "squeeze-excite built for {} channels, input has {}",
                self.channels, channels
            )));
        }
        Ok(())
    }
}
