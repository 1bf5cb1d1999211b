use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{self as nn, VarBuilder};

use crate::error::{DynamicsError, DynamicsResult};

/// Multi-Head Attention using Candle's built-in primitives
/// Uses nn::Linear for projections, Tensor::matmul for attention, nn::ops::softmax
pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    attn_dropout: nn::Dropout,
}

impl MultiHeadAttention {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize) -> DynamicsResult<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(DynamicsError::invalid_config(format!(
                "attention dim {dim} is not divisible by num_heads {num_heads}"
            )));
        }
        let head_dim = dim / num_heads;
        let scale = (head_dim as f64).sqrt();

        let q_proj = nn::linear(dim, dim, vb.pp("q_proj"))?;
        let k_proj = nn::linear(dim, dim, vb.pp("k_proj"))?;
        let v_proj = nn::linear(dim, dim, vb.pp("v_proj"))?;
        let out_proj = nn::linear(dim, dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            scale,
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            attn_dropout: nn::Dropout::new(0.0),
        })
    }

    /// Dropout on the attention weights, active only when `attend` runs with `train`.
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.attn_dropout = nn::Dropout::new(p);
        self
    }

    /// Self-attention: query, key, value all come from the same source
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> DynamicsResult<Tensor> {
        self.forward_cross(x, x, mask)
    }

    /// Cross-attention: query from one source, key/value from another.
    ///
    /// `mask` is additive and must broadcast to [B, num_heads, T_q, T_kv]; use
    /// [`create_causal_mask`] or [`key_padding_mask`] to build one.
    pub fn forward_cross(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        mask: Option<&Tensor>,
    ) -> DynamicsResult<Tensor> {
        self.attend(query, key_value, mask, false)
    }

    /// Cross-attention with attention-weight dropout when `train` is set.
    pub fn attend(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> DynamicsResult<Tensor> {
        let (b, t_q, _) = query.dims3()?;
        let (_, t_kv, _) = key_value.dims3()?;

        let q = self.q_proj.forward(query)?;
        let k = self.k_proj.forward(key_value)?;
        let v = self.v_proj.forward(key_value)?;

        // [B, T, D] -> [B, num_heads, T, head_dim]
        let q = q
            .reshape((b, t_q, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, t_kv, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, t_kv, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // [B, H, T_q, head_dim] @ [B, H, head_dim, T_kv] -> [B, H, T_q, T_kv]
        let k_t = k.transpose(D::Minus2, D::Minus1)?;
        let scores = (q.matmul(&k_t)? / self.scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };

        self.attention_scores_to_output(scores, &v, b, t_q, train)
    }

    fn attention_scores_to_output(
        &self,
        scores: Tensor,
        v: &Tensor,
        b: usize,
        t_q: usize,
        train: bool,
    ) -> DynamicsResult<Tensor> {
        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn_weights = self.attn_dropout.forward(&attn_weights, train)?;

        // [B, H, T_q, T_kv] @ [B, H, T_kv, head_dim] -> [B, H, T_q, head_dim]
        let attn_output = attn_weights.matmul(v)?;

        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            b,
            t_q,
            self.num_heads * self.head_dim,
        ))?;

        Ok(self.out_proj.forward(&attn_output)?)
    }
}

/// Layer norm over the last dim, written with plain tensor ops so gradients reach
/// the input and the affine parameters. Stored as `weight`/`bias` like `nn::LayerNorm`.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

pub fn layer_norm(dim: usize, eps: f64, vb: VarBuilder<'_>) -> DynamicsResult<LayerNorm> {
    let weight = vb.get_with_hints(dim, "weight", nn::Init::Const(1.0))?;
    let bias = vb.get_with_hints(dim, "bias", nn::Init::Const(0.0))?;
    Ok(LayerNorm { weight, bias, eps })
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let dim = x.dim(D::Minus1)?;
        let mean = (x.sum_keepdim(D::Minus1)? / dim as f64)?;
        let x = x.broadcast_sub(&mean)?;
        let var = (x.sqr()?.sum_keepdim(D::Minus1)? / dim as f64)?;
        let x = x.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Encoder block: self-attention and a ReLU feed-forward, each followed by
/// residual + layer norm (post-norm).
pub struct TransformerBlock {
    attn: MultiHeadAttention,
    ln1: LayerNorm,
    ln2: LayerNorm,
    ff1: nn::Linear,
    ff2: nn::Linear,
}

impl TransformerBlock {
    pub fn new(
        vb: VarBuilder<'_>,
        dim: usize,
        num_heads: usize,
        ff_dim: usize,
    ) -> DynamicsResult<Self> {
        let attn = MultiHeadAttention::new(vb.pp("attn"), dim, num_heads)?;
        let ln1 = layer_norm(dim, 1e-5, vb.pp("ln1"))?;
        let ln2 = layer_norm(dim, 1e-5, vb.pp("ln2"))?;
        let ff1 = nn::linear(dim, ff_dim, vb.pp("ff1"))?;
        let ff2 = nn::linear(ff_dim, dim, vb.pp("ff2"))?;

        Ok(Self {
            attn,
            ln1,
            ln2,
            ff1,
            ff2,
        })
    }

    pub fn forward(&self, x: &Tensor) -> DynamicsResult<Tensor> {
        let attn_out = self.attn.forward(x, None)?;
        let x = self.ln1.forward(&(x + attn_out)?)?;

        let ff_out = self.ff1.forward(&x)?.relu()?;
        let ff_out = self.ff2.forward(&ff_out)?;
        Ok(self.ln2.forward(&(x + ff_out)?)?)
    }
}

/// Decoder block: causal self-attention, cross-attention to a memory sequence,
/// then a ReLU feed-forward. Post-norm with dropout on the attention weights and on
/// every sublayer output.
pub struct DecoderBlock {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ln1: LayerNorm,
    ln2: LayerNorm,
    ln3: LayerNorm,
    ff1: nn::Linear,
    ff2: nn::Linear,
    dropout: nn::Dropout,
}

impl DecoderBlock {
    pub fn new(
        vb: VarBuilder<'_>,
        dim: usize,
        num_heads: usize,
        ff_dim: usize,
        dropout: f32,
    ) -> DynamicsResult<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(vb.pp("self_attn"), dim, num_heads)?
                .with_dropout(dropout),
            cross_attn: MultiHeadAttention::new(vb.pp("cross_attn"), dim, num_heads)?
                .with_dropout(dropout),
            ln1: layer_norm(dim, 1e-5, vb.pp("ln1"))?,
            ln2: layer_norm(dim, 1e-5, vb.pp("ln2"))?,
            ln3: layer_norm(dim, 1e-5, vb.pp("ln3"))?,
            ff1: nn::linear(dim, ff_dim, vb.pp("ff1"))?,
            ff2: nn::linear(ff_dim, dim, vb.pp("ff2"))?,
            dropout: nn::Dropout::new(dropout),
        })
    }

    /// x: [B, T, D] target sequence, memory: [B, S, D]; every memory position is visible.
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        self_mask: Option<&Tensor>,
        train: bool,
    ) -> DynamicsResult<Tensor> {
        let sa = self.self_attn.attend(x, x, self_mask, train)?;
        let sa = self.dropout.forward(&sa, train)?;
        let x = self.ln1.forward(&(x + sa)?)?;

        let ca = self.cross_attn.attend(&x, memory, None, train)?;
        let ca = self.dropout.forward(&ca, train)?;
        let x = self.ln2.forward(&(x + ca)?)?;

        let ff = self.ff1.forward(&x)?.relu()?;
        let ff = self.dropout.forward(&ff, train)?;
        let ff = self.ff2.forward(&ff)?;
        let ff = self.dropout.forward(&ff, train)?;
        Ok(self.ln3.forward(&(x + ff)?)?)
    }
}

/// Fixed 2-D sine/cosine position encoding over a row-major patch grid.
///
/// The first half of the channels encodes the grid row, the second half the
/// column; each half is `[sin(pos * w_i)..., cos(pos * w_i)...]` with
/// `w_i = 1 / 10000^(i / (dim / 4))`. Returns [1, grid_size^2, dim].
pub fn patch_position_encoding(
    grid_size: usize,
    dim: usize,
    device: &Device,
) -> DynamicsResult<Tensor> {
    if dim % 4 != 0 {
        return Err(DynamicsError::invalid_config(format!(
            "position encoding dim {dim} must be divisible by 4"
        )));
    }
    let half = dim / 2;
    let quarter = dim / 4;
    let num_patches = grid_size * grid_size;
    let omega: Vec<f64> = (0..quarter)
        .map(|i| 1.0 / 10000f64.powf(i as f64 / quarter as f64))
        .collect();

    let mut pe = vec![0f32; num_patches * dim];
    for row in 0..grid_size {
        for col in 0..grid_size {
            let base = (row * grid_size + col) * dim;
            for (offset, pos) in [(0, row), (half, col)] {
                for (i, w) in omega.iter().enumerate() {
                    let angle = pos as f64 * w;
                    pe[base + offset + i] = angle.sin() as f32;
                    pe[base + offset + quarter + i] = angle.cos() as f32;
                }
            }
        }
    }

    Ok(Tensor::from_vec(pe, (1, num_patches, dim), device)?)
}

/// Causal mask for decoder self-attention (prevents attending to future tokens)
/// Returns a mask where mask[i][j] = 0 if j <= i, else -inf
pub fn create_causal_mask(seq_len: usize, device: &Device) -> DynamicsResult<Tensor> {
    let mut mask_data = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(mask_data, (seq_len, seq_len), device)?)
}

/// Additive mask [B, 1, 1, T] from a [B, T] padding flag tensor (nonzero = padded).
pub fn key_padding_mask(padding: &Tensor) -> DynamicsResult<Tensor> {
    let (b, t) = padding.dims2()?;
    let device = padding.device();
    let padded = padding.to_dtype(DType::U8)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (b, t), device)?;
    let zeros = Tensor::zeros((b, t), DType::F32, device)?;
    let additive = padded.where_cond(&neg_inf, &zeros)?;
    Ok(additive.reshape((b, 1, 1, t))?)
}
