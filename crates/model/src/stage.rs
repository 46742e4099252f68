//! Per-resolution stage: optional downsampling, an inverted residual block,
//! and a windowed-attention transformer block.

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, linear, ops, LayerNorm, LayerNormConfig, Linear, Module, VarBuilder};
use layers::{
    window_partition, window_reverse, DownsampleBlock, DropPath, InvertedResidual, SqueezeExcite,
    WindowAttention,
};

use crate::config::{ModelConfig, StageConfig};

const NORM_EPS: f64 = 1e-5;
const FF_GATE_REDUCTION: usize = 4;

/// Pre-norm transformer block over spatial windows.
///
/// Residual one: layer norm, window partition, gated attention, window
/// reverse, stochastic depth, add. Residual two: layer norm, feed-forward
/// with GELU, squeeze-excite gate on the feed-forward output, stochastic
/// depth, add. Operates channels-last internally; callers hand in NCHW maps.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    norm_attn: LayerNorm,
    attn: WindowAttention,
    norm_mlp: LayerNorm,
    ff_expand: Linear,
    ff_project: Linear,
    se: SqueezeExcite,
    drop_path: DropPath,
    window_size: usize,
    dropout_p: f32,
}

impl TransformerBlock {
    pub fn new(
        dim: usize,
        num_heads: usize,
        window_size: usize,
        mlp_ratio: usize,
        drop_path: f64,
        dropout_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = LayerNormConfig {
            eps: NORM_EPS,
            ..Default::default()
        };
        let norm_attn = layer_norm(dim, cfg, vb.pp("norm1"))?;
        let attn = WindowAttention::new(dim, dim, num_heads, window_size, dropout_p, vb.pp("attn"))?;
        let norm_mlp = layer_norm(dim, cfg, vb.pp("norm2"))?;
        let ff_expand = linear(dim, dim * mlp_ratio, vb.pp("mlp_fc1"))?;
        let ff_project = linear(dim * mlp_ratio, dim, vb.pp("mlp_fc2"))?;
        let se = SqueezeExcite::new(dim, FF_GATE_REDUCTION, vb.pp("se"))?;
        let drop_path = DropPath::new(drop_path)?;
        Ok(Self {
            norm_attn,
            attn,
            norm_mlp,
            ff_expand,
            ff_project,
            se,
            drop_path,
            window_size,
            dropout_p,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_, channels, _, _) = x.dims4()?;
        let nhwc = x.permute((0, 2, 3, 1))?.contiguous()?;

        // Attention residual.
        let normed = self.norm_attn.forward(&nhwc)?;
        let (windows, grid) = window_partition(&normed, self.window_size)?;
        let n_windows = windows.dim(0)?;
        let flat = windows.reshape((n_windows, self.window_size * self.window_size, channels))?;
        let attended = self.attn.forward(&flat, train)?;
        let attended =
            attended.reshape((n_windows, self.window_size, self.window_size, channels))?;
        let restored = window_reverse(&attended, self.window_size, grid)?;
        let branch = self.drop_path.forward(&restored, train)?;
        let after_attn = nhwc.add(&branch)?;

        // Feed-forward residual.
        let normed = self.norm_mlp.forward(&after_attn)?;
        let mut hidden = self.ff_expand.forward(&normed)?.gelu()?;
        if train && self.dropout_p > 0.0 {
            hidden = ops::dropout(&hidden, self.dropout_p)?;
        }
        let mut projected = self.ff_project.forward(&hidden)?;
        if train && self.dropout_p > 0.0 {
            projected = ops::dropout(&projected, self.dropout_p)?;
        }
        let gated = self.se.scale_nhwc(&projected)?;
        let branch = self.drop_path.forward(&gated, train)?;
        let out = after_attn.add(&branch)?;

        out.permute((0, 3, 1, 2))?.contiguous()
    }
}

/// One entry of the stage table, assembled.
#[derive(Debug, Clone)]
pub struct HybridStage {
    downsample: Option<DownsampleBlock>,
    conv: InvertedResidual,
    transformer: TransformerBlock,
}

impl HybridStage {
    /// `first` skips the downsampling block: the stem already halved the
    /// input resolution. The downsample keeps the stage's input width; the
    /// inverted residual block performs the widening.
    pub fn new(
        model: &ModelConfig,
        stage: &StageConfig,
        first: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let downsample = if first {
            None
        } else {
            Some(DownsampleBlock::new(
                stage.channels_in,
                stage.channels_in,
                vb.pp("down"),
            )?)
        };
        let conv = InvertedResidual::new(
            stage.channels_in,
            stage.channels_out,
            model.expansion_ratio,
            3,
            1,
            vb.pp("ir"),
        )?;
        let transformer = TransformerBlock::new(
            stage.channels_out,
            stage.num_heads,
            model.window_size,
            model.mlp_ratio,
            stage.drop_path,
            0.0,
            vb.pp("swin"),
        )?;
        Ok(Self {
            downsample,
            conv,
            transformer,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = match &self.downsample {
            Some(block) => block.forward(x, train)?,
            None => x.clone(),
        };
        h = self.conv.forward(&h, train)?;
        self.transformer.forward(&h, train)
    }
}
