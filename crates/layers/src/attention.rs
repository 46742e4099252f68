//! Multi-head attention variants used by the hybrid network.
//!
//! [`WindowAttention`] runs inside flattened spatial windows and deviates
//! from vanilla attention in two ways that must be preserved: a learned
//! sigmoid gate multiplies the *projected* output (not the raw input), and a
//! relative position bias table indexed by pairwise coordinate offsets is
//! added to the attention scores. [`GlobalAttention`] is the plain variant
//! the classifier head applies once over a pooled length-1 sequence.

use candle_core::{Error, Result, Tensor};
use candle_nn::{linear, linear_no_bias, ops, Init, Linear, Module, VarBuilder};

fn split_heads(x: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, seq, _) = x.dims3()?;
    x.reshape((batch, seq, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

fn merge_heads(x: &Tensor, dim: usize) -> Result<Tensor> {
    let (batch, _, seq, _) = x.dims4()?;
    x.transpose(1, 2)?.contiguous()?.reshape((batch, seq, dim))
}

fn check_head_split(dim: usize, num_heads: usize) -> Result<usize> {
    if num_heads == 0 {
        return Err(Error::Msg("attention requires at least one head".into()));
    }
    if dim % num_heads != 0 {
        return Err(Error::Msg(format!(
            "attention dim {dim} is not divisible by head count {num_heads}"
        )));
    }
    Ok(dim / num_heads)
}

/// Relative position bias over one square window.
///
/// The table holds one bias per head for every pairwise offset
/// `(-ws+1..=ws-1)^2`; the index tensor maps each (query, key) position pair
/// inside the window to its table row.
#[derive(Debug, Clone)]
struct RelativePositionBias {
    table: Tensor,
    index: Tensor,
    tokens: usize,
    num_heads: usize,
}

impl RelativePositionBias {
    fn new(window_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let span = 2 * window_size - 1;
        let table = vb.get_with_hints(
            (span * span, num_heads),
            "relative_position_bias_table",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;

        let tokens = window_size * window_size;
        let mut index = Vec::with_capacity(tokens * tokens);
        for a in 0..tokens {
            let (ai, aj) = (a / window_size, a % window_size);
            for b in 0..tokens {
                let (bi, bj) = (b / window_size, b % window_size);
                let rel_i = ai + window_size - 1 - bi;
                let rel_j = aj + window_size - 1 - bj;
                index.push((rel_i * span + rel_j) as u32);
            }
        }
        let index = Tensor::from_vec(index, tokens * tokens, vb.device())?;

        Ok(Self {
            table,
            index,
            tokens,
            num_heads,
        })
    }

    /// Bias shaped `(1, heads, tokens, tokens)` for broadcast onto scores.
    fn bias(&self) -> Result<Tensor> {
        self.table
            .index_select(&self.index, 0)?
            .reshape((self.tokens, self.tokens, self.num_heads))?
            .permute((2, 0, 1))?
            .contiguous()?
            .unsqueeze(0)
    }
}

/// Gated multi-head self-attention over flattened windows.
#[derive(Debug, Clone)]
pub struct WindowAttention {
    qkv: Linear,
    proj: Linear,
    gate: Linear,
    relative_bias: RelativePositionBias,
    dim: usize,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout_p: f32,
}

impl WindowAttention {
    pub fn new(
        in_channels: usize,
        dim: usize,
        num_heads: usize,
        window_size: usize,
        dropout_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = check_head_split(dim, num_heads)?;
        if window_size == 0 {
            return Err(Error::Msg("window_size must be greater than zero".into()));
        }
        let qkv = linear(in_channels, dim * 3, vb.pp("qkv"))?;
        let proj = linear_no_bias(dim, dim, vb.pp("proj"))?;
        let gate = linear_no_bias(dim, dim, vb.pp("gate"))?;
        let relative_bias =
            RelativePositionBias::new(window_size, num_heads, vb.pp("rel_bias"))?;
        Ok(Self {
            qkv,
            proj,
            gate,
            relative_bias,
            dim,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            dropout_p,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `x` is `(windows, window_size^2, in_channels)`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq, _) = x.dims3()?;
        if seq != self.relative_bias.tokens {
            return Err(Error::Msg(format!(
                "window attention expects {} tokens per window, got {}",
                self.relative_bias.tokens, seq
            )));
        }

        let qkv = self.qkv.forward(x)?;
        let q = split_heads(&qkv.narrow(2, 0, self.dim)?, self.num_heads, self.head_dim)?;
        let k = split_heads(
            &qkv.narrow(2, self.dim, self.dim)?,
            self.num_heads,
            self.head_dim,
        )?;
        let v = split_heads(
            &qkv.narrow(2, 2 * self.dim, self.dim)?,
            self.num_heads,
            self.head_dim,
        )?;

        let mut scores = (q.matmul(&k.t()?)? * self.scale)?;
        scores = scores.broadcast_add(&self.relative_bias.bias()?)?;
        let mut attn = ops::softmax(&scores, candle_core::D::Minus1)?;
        if train && self.dropout_p > 0.0 {
            attn = ops::dropout(&attn, self.dropout_p)?;
        }

        let context = merge_heads(&attn.matmul(&v)?, self.dim)?;
        let mut out = self.proj.forward(&context)?;
        if train && self.dropout_p > 0.0 {
            out = ops::dropout(&out, self.dropout_p)?;
        }

        // The gate reads the projected output, not the block input.
        let gate = ops::sigmoid(&self.gate.forward(&out)?)?;
        out.mul(&gate)
    }
}

/// Plain multi-head attention for the classifier head.
///
/// Applied to a pooled feature vector reshaped as a length-1 sequence, this
/// degenerates into a learned reweighting, but it reuses the same projection
/// mechanism as the windowed variant.
#[derive(Debug, Clone)]
pub struct GlobalAttention {
    qkv: Linear,
    proj: Linear,
    dim: usize,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout_p: f32,
}

impl GlobalAttention {
    pub fn new(dim: usize, num_heads: usize, dropout_p: f32, vb: VarBuilder) -> Result<Self> {
        let head_dim = check_head_split(dim, num_heads)?;
        let qkv = linear(dim, dim * 3, vb.pp("qkv"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            dim,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            dropout_p,
        })
    }

    /// `x` is `(batch, seq, dim)`; output keeps the same shape.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let qkv = self.qkv.forward(x)?;
        let q = split_heads(&qkv.narrow(2, 0, self.dim)?, self.num_heads, self.head_dim)?;
        let k = split_heads(
            &qkv.narrow(2, self.dim, self.dim)?,
            self.num_heads,
            self.head_dim,
        )?;
        let v = split_heads(
            &qkv.narrow(2, 2 * self.dim, self.dim)?,
            self.num_heads,
            self.head_dim,
        )?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let mut attn = ops::softmax(&scores, candle_core::D::Minus1)?;
        if train && self.dropout_p > 0.0 {
            attn = ops::dropout(&attn, self.dropout_p)?;
        }

        let context = merge_heads(&attn.matmul(&v)?, self.dim)?;
        let mut out = self.proj.forward(&context)?;
        if train && self.dropout_p > 0.0 {
            out = ops::dropout(&out, self.dropout_p)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn builder() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn window_attention_preserves_token_shape() -> Result<()> {
        for (dim, heads) in [(8usize, 2usize), (12, 3), (16, 4)] {
            let (_varmap, vb) = builder();
            let attn = WindowAttention::new(dim, dim, heads, 3, 0.0, vb)?;
            let x = Tensor::randn(0f32, 1.0, (4, 9, dim), &Device::Cpu)?;
            let out = attn.forward(&x, false)?;
            assert_eq!(out.dims(), x.dims());
        }
        Ok(())
    }

    #[test]
    fn window_attention_projects_mismatched_channels() -> Result<()> {
        let (_varmap, vb) = builder();
        let attn = WindowAttention::new(6, 8, 2, 2, 0.0, vb)?;
        let x = Tensor::randn(0f32, 1.0, (3, 4, 6), &Device::Cpu)?;
        let out = attn.forward(&x, false)?;
        assert_eq!(out.dims(), &[3, 4, 8]);
        Ok(())
    }

    #[test]
    fn indivisible_head_count_fails_fast() {
        let (_varmap, vb) = builder();
        assert!(WindowAttention::new(10, 10, 3, 2, 0.0, vb).is_err());
        let (_varmap, vb) = builder();
        assert!(GlobalAttention::new(10, 4, 0.0, vb).is_err());
    }

    #[test]
    fn wrong_token_count_is_rejected() -> Result<()> {
        let (_varmap, vb) = builder();
        let attn = WindowAttention::new(8, 8, 2, 3, 0.0, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &Device::Cpu)?;
        assert!(attn.forward(&x, false).is_err());
        Ok(())
    }

    #[test]
    fn evaluation_forward_is_deterministic() -> Result<()> {
        let (_varmap, vb) = builder();
        let attn = WindowAttention::new(8, 8, 2, 2, 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &Device::Cpu)?;
        let a = attn.forward(&x, false)?;
        let b = attn.forward(&x, false)?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn global_attention_handles_length_one_sequences() -> Result<()> {
        let (_varmap, vb) = builder();
        let attn = GlobalAttention::new(12, 6, 0.1, vb)?;
        let x = Tensor::randn(0f32, 1.0, (5, 1, 12), &Device::Cpu)?;
        let out = attn.forward(&x, false)?;
        assert_eq!(out.dims(), &[5, 1, 12]);
        Ok(())
    }

    #[test]
    fn relative_bias_index_covers_offset_span() -> Result<()> {
        let (_varmap, vb) = builder();
        let bias = RelativePositionBias::new(3, 2, vb)?;
        let index = bias.index.to_vec1::<u32>()?;
        let span = (2 * 3 - 1) * (2 * 3 - 1);
        assert_eq!(index.len(), 81);
        assert!(index.iter().all(|&i| (i as usize) < span));
        // Zero offset maps to the table centre for every diagonal pair.
        let centre = index[0];
        for t in 0..9usize {
            assert_eq!(index[t * 9 + t], centre);
        }
        Ok(())
    }
}
