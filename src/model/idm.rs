use candle_core::{Device, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};
use rand::Rng;
use tracing::debug;

use super::attention::{create_causal_mask, layer_norm, DecoderBlock, LayerNorm};
use super::augment::PairedAugment;
use super::encoders::OnlineEncoder;
use crate::config::ModelConfig;
use crate::data::{normalize_obs, TransitionBatch};
use crate::error::{DynamicsError, DynamicsResult};

/// Training runs augmentation, patch dropping, dropout and a random decode length;
/// eval runs none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Latent action sequence inferred for a batch of transitions.
#[derive(Debug, Clone)]
pub struct LatentActions {
    /// [B, N, action_dim]
    pub la: Tensor,
    /// [B, N * action_dim], eval only
    pub la_flat: Option<Tensor>,
}

impl LatentActions {
    pub fn num_tokens(&self) -> usize {
        self.la.dims()[1]
    }
}

/// Per-sample set of "after" patches that go through the transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepMask {
    indices: Vec<Vec<u32>>,
    num_patches: usize,
}

impl KeepMask {
    /// Draw `keep` distinct patches per sample, uniformly without replacement.
    pub fn sample<R: Rng + ?Sized>(batch: usize, num_patches: usize, keep: usize, rng: &mut R) -> Self {
        let keep = keep.clamp(1, num_patches);
        let indices = (0..batch)
            .map(|_| {
                let mut row: Vec<u32> = rand::seq::index::sample(rng, num_patches, keep)
                    .into_iter()
                    .map(|i| i as u32)
                    .collect();
                row.sort_unstable();
                row
            })
            .collect();
        Self {
            indices,
            num_patches,
        }
    }

    /// Explicit mask; every row must hold the same number of distinct in-range indices.
    pub fn from_indices(indices: Vec<Vec<u32>>, num_patches: usize) -> DynamicsResult<Self> {
        let keep = indices.first().map(Vec::len).unwrap_or(0);
        if keep == 0 {
            return Err(DynamicsError::invalid_config("keep mask must retain at least one patch"));
        }
        let mut rows = Vec::with_capacity(indices.len());
        for mut row in indices {
            row.sort_unstable();
            row.dedup();
            if row.len() != keep || row.iter().any(|&i| i as usize >= num_patches) {
                return Err(DynamicsError::invalid_config(format!(
                    "keep mask rows need {keep} distinct indices below {num_patches}"
                )));
            }
            rows.push(row);
        }
        Ok(Self {
            indices: rows,
            num_patches,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.indices.len()
    }

    pub fn keep_count(&self) -> usize {
        self.indices.first().map(Vec::len).unwrap_or(0)
    }

    pub fn indices(&self) -> &[Vec<u32>] {
        &self.indices
    }

    /// [B, K] u32 patch indices, ascending per row.
    pub fn index_tensor(&self, device: &Device) -> DynamicsResult<Tensor> {
        let flat: Vec<u32> = self.indices.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (self.batch_size(), self.keep_count()), device)?)
    }

    /// [B, P] u8, 1 where the patch is kept.
    pub fn mask_tensor(&self, device: &Device) -> DynamicsResult<Tensor> {
        let mut mask = vec![0u8; self.batch_size() * self.num_patches];
        for (b, row) in self.indices.iter().enumerate() {
            for &i in row {
                mask[b * self.num_patches + i as usize] = 1;
            }
        }
        Ok(Tensor::from_vec(mask, (self.batch_size(), self.num_patches), device)?)
    }
}

/// Inverse dynamics model: infers a sequence of latent actions from a before/after pair.
///
/// The context is a per-patch interleaving of the layerwise "before" and "after"
/// latents, [B, P, 2 * depth * E]. A post-norm transformer decoder then produces
/// one action per step, feeding its own last hidden state back as the next input.
pub struct Idm {
    encoder: OnlineEncoder,
    augment: PairedAugment,
    layers: Vec<DecoderBlock>,
    final_norm: LayerNorm,
    mask_token: Tensor,
    drop_token: Tensor,
    action_head: nn::Linear,
    keep_count: usize,
    min_tokens: usize,
    max_tokens: usize,
    num_eval_tokens: usize,
    action_dim: usize,
    device: Device,
}

impl Idm {
    pub fn new(
        vb: VarBuilder<'_>,
        encoder: OnlineEncoder,
        config: &ModelConfig,
        device: &Device,
    ) -> DynamicsResult<Self> {
        config.validate()?;
        let d_context = config.idm_context_dim();
        let depth = config.encoder_depth;

        let mut layers = Vec::with_capacity(config.idm_decoder_layers);
        for i in 0..config.idm_decoder_layers {
            layers.push(DecoderBlock::new(
                vb.pp(format!("decoder.layer_{i}")),
                d_context,
                depth,
                4 * d_context,
                config.idm_dropout,
            )?);
        }
        let final_norm = layer_norm(d_context, 1e-5, vb.pp("decoder.norm"))?;
        let token_init = nn::Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let mask_token = vb.get_with_hints((1, 1, d_context), "mask_token", token_init)?;
        let drop_token = vb.get_with_hints((1, 1, depth * config.embed_dim), "drop_token", token_init)?;
        let action_head = nn::linear(d_context, config.action_dim, vb.pp("action_head"))?;

        Ok(Self {
            encoder,
            augment: PairedAugment::default(),
            layers,
            final_norm,
            mask_token,
            drop_token,
            action_head,
            keep_count: config.keep_count(),
            min_tokens: config.min_tokens,
            max_tokens: config.max_tokens,
            num_eval_tokens: config.num_eval_tokens,
            action_dim: config.action_dim,
            device: device.clone(),
        })
    }

    pub fn encoder(&self) -> &OnlineEncoder {
        &self.encoder
    }

    /// [1, 1, depth * E], written into every dropped "after" patch.
    pub fn drop_token(&self) -> &Tensor {
        &self.drop_token
    }

    pub fn keep_count(&self) -> usize {
        self.keep_count
    }

    fn check_pair(&self, before: &Tensor, after: &Tensor) -> DynamicsResult<()> {
        if before.dims() != after.dims() {
            return Err(DynamicsError::shape_mismatch(
                format!("after frame shaped like before {:?}", before.dims()),
                format!("{:?}", after.dims()),
            ));
        }
        self.encoder.check_images(before)
    }

    /// Per-patch context [B, P, 2 * depth * E]. Training augments the pair and
    /// drops all but `keep_count` "after" patches with a freshly sampled mask.
    pub fn encode_vision_context<R: Rng + ?Sized>(
        &self,
        before: &Tensor,
        after: &Tensor,
        mode: Mode,
        rng: &mut R,
    ) -> DynamicsResult<Tensor> {
        self.check_pair(before, after)?;
        match mode {
            Mode::Eval => self.build_context(before, after, None),
            Mode::Train => {
                let (before, after) = self.augment.forward(before, after, rng)?;
                let keep = KeepMask::sample(
                    before.dim(0)?,
                    self.encoder.num_patches(),
                    self.keep_count,
                    rng,
                );
                self.build_context(&before, &after, Some(&keep))
            }
        }
    }

    /// Context for already-augmented images. With a keep mask only the kept "after"
    /// patches are encoded; every other position holds the drop token.
    pub fn build_context(
        &self,
        before: &Tensor,
        after: &Tensor,
        keep: Option<&KeepMask>,
    ) -> DynamicsResult<Tensor> {
        self.check_pair(before, after)?;
        let before_tokens = self.encoder.patch_and_embed(before)?;
        let after_tokens = self.encoder.patch_and_embed(after)?;
        let (b, p, e) = before_tokens.dims3()?;
        let d = self.encoder.depth();

        let after_ctx = match keep {
            Some(keep) => self.encode_kept(&after_tokens, keep)?,
            None => self
                .encoder
                .run_transformer(&after_tokens)?
                .transpose(1, 2)?
                .contiguous()?,
        };
        let before_ctx = self
            .encoder
            .run_transformer(&before_tokens)?
            .transpose(1, 2)?
            .contiguous()?;

        // [B, P, D, 2, E]: each depth level contributes (before_l, after_l).
        let combined = Tensor::stack(&[&before_ctx, &after_ctx], 3)?;
        Ok(combined.reshape((b, p, d * 2 * e))?)
    }

    /// tokens: [B, P, E] -> [B, P, D, E] with only kept patches run through the encoder.
    fn encode_kept(&self, tokens: &Tensor, keep: &KeepMask) -> DynamicsResult<Tensor> {
        let (b, p, e) = tokens.dims3()?;
        let d = self.encoder.depth();
        let k = keep.keep_count();
        if keep.batch_size() != b || keep.num_patches != p {
            return Err(DynamicsError::shape_mismatch(
                format!("keep mask for {b} samples of {p} patches"),
                format!("{} samples of {} patches", keep.batch_size(), keep.num_patches),
            ));
        }
        let device = tokens.device();
        let index = keep.index_tensor(device)?.unsqueeze(2)?;

        let gather_index = index.broadcast_as((b, k, e))?.contiguous()?;
        let kept = tokens.gather(&gather_index, 1)?;
        let kept = self
            .encoder
            .run_transformer(&kept)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, k, d * e))?;

        let scatter_index = index.broadcast_as((b, k, d * e))?.contiguous()?;
        let placed = Tensor::zeros((b, p, d * e), kept.dtype(), device)?.scatter_add(
            &scatter_index,
            &kept,
            1,
        )?;
        let kept_mask = keep
            .mask_tensor(device)?
            .unsqueeze(2)?
            .broadcast_as((b, p, d * e))?
            .contiguous()?;
        let dropped = self.drop_token.broadcast_as((b, p, d * e))?.contiguous()?;
        let full = kept_mask.where_cond(&placed, &dropped)?;
        Ok(full.reshape((b, p, d, e))?)
    }

    fn start_sequence(&self, batch: usize) -> DynamicsResult<Tensor> {
        let (_, _, d_context) = self.mask_token.dims3()?;
        Ok(self
            .mask_token
            .broadcast_as((batch, 1, d_context))?
            .contiguous()?)
    }

    /// One decode step over the whole target so far. Returns the last hidden state
    /// [B, 1, d_context] and its action [B, 1, action_dim].
    fn decode_step(&self, tgt: &Tensor, memory: &Tensor, train: bool) -> DynamicsResult<(Tensor, Tensor)> {
        let t = tgt.dim(1)?;
        let causal = create_causal_mask(t, tgt.device())?;
        let mut h = tgt.clone();
        for layer in &self.layers {
            h = layer.forward(&h, memory, Some(&causal), train)?;
        }
        let h = self.final_norm.forward(&h)?;
        let last = h.narrow(1, t - 1, 1)?;
        let action = self.action_head.forward(&last)?;
        Ok((last, action))
    }

    /// Fixed-length decode over a context encoded once, without augmentation or dropping.
    pub fn infer_eval(&self, before: &Tensor, after: &Tensor) -> DynamicsResult<LatentActions> {
        let b = before.dim(0)?;
        let memory = self.build_context(before, after, None)?;
        let mut tgt = self.start_sequence(b)?;
        let mut actions = Vec::with_capacity(self.num_eval_tokens);
        for _ in 0..self.num_eval_tokens {
            let (last, action) = self.decode_step(&tgt, &memory, false)?;
            actions.push(action);
            tgt = Tensor::cat(&[&tgt, &last], 1)?;
        }
        let la = Tensor::cat(&actions, 1)?;
        let la_flat = la.reshape((b, self.num_eval_tokens * self.action_dim))?;
        Ok(LatentActions {
            la,
            la_flat: Some(la_flat),
        })
    }

    /// Random-length decode. The context is re-encoded before every step with a new
    /// augmentation draw and a new keep mask.
    pub fn infer_train<R: Rng + ?Sized>(
        &self,
        before: &Tensor,
        after: &Tensor,
        rng: &mut R,
    ) -> DynamicsResult<LatentActions> {
        self.check_pair(before, after)?;
        let b = before.dim(0)?;
        let num_tokens = rng.gen_range(self.min_tokens..=self.max_tokens);
        debug!(num_tokens, "idm decode length");

        let mut tgt = self.start_sequence(b)?;
        let mut actions = Vec::with_capacity(num_tokens);
        for _ in 0..num_tokens {
            let memory = self.encode_vision_context(before, after, Mode::Train, rng)?;
            let (last, action) = self.decode_step(&tgt, &memory, true)?;
            actions.push(action);
            tgt = Tensor::cat(&[&tgt, &last], 1)?;
        }
        Ok(LatentActions {
            la: Tensor::cat(&actions, 1)?,
            la_flat: None,
        })
    }

    pub fn infer<R: Rng + ?Sized>(
        &self,
        before: &Tensor,
        after: &Tensor,
        mode: Mode,
        rng: &mut R,
    ) -> DynamicsResult<LatentActions> {
        match mode {
            Mode::Train => self.infer_train(before, after, rng),
            Mode::Eval => self.infer_eval(before, after),
        }
    }

    /// Write inferred actions into the batch, replacing any previous labels.
    pub fn label<R: Rng + ?Sized>(
        &self,
        batch: &mut TransitionBatch,
        mode: Mode,
        rng: &mut R,
    ) -> DynamicsResult<()> {
        let before = batch.before()?;
        let after = batch.after()?;
        let LatentActions { la, la_flat } = self.infer(&before, &after, mode, rng)?;
        batch.la = Some(la);
        batch.la_flat = la_flat;
        batch.la_mask = None;
        Ok(())
    }

    /// Eval-mode labels for an [N, T, C, H, W] observation tensor, `chunk_size`
    /// sequences at a time. Outputs are detached and land on the observations' device.
    pub fn label_chunked(&self, obs: &Tensor, chunk_size: usize) -> DynamicsResult<LatentActions> {
        if chunk_size == 0 {
            return Err(DynamicsError::invalid_config("chunk_size must be at least 1"));
        }
        let (n, t, _, _, _) = obs.dims5()?;
        if t < 2 {
            return Err(DynamicsError::shape_mismatch(
                "[N, T >= 2, C, H, W]",
                format!("{:?}", obs.dims()),
            ));
        }
        if n == 0 {
            return Err(DynamicsError::data("no observations to label"));
        }

        let frame = |chunk: &Tensor, offset: usize| -> DynamicsResult<Tensor> {
            let x = chunk.narrow(1, t - offset, 1)?.squeeze(1)?.to_device(&self.device)?;
            Ok(normalize_obs(&x)?.contiguous()?)
        };

        let mut la_chunks = Vec::new();
        let mut flat_chunks = Vec::new();
        let mut start = 0;
        while start < n {
            let len = chunk_size.min(n - start);
            let chunk = obs.narrow(0, start, len)?;
            let out = self.infer_eval(&frame(&chunk, 2)?, &frame(&chunk, 1)?)?;
            la_chunks.push(out.la.detach().to_device(obs.device())?);
            if let Some(flat) = out.la_flat {
                flat_chunks.push(flat.detach().to_device(obs.device())?);
            }
            start += len;
        }
        debug!(chunks = la_chunks.len(), sequences = n, "labelled observations");

        Ok(LatentActions {
            la: Tensor::cat(&la_chunks, 0)?,
            la_flat: Some(Tensor::cat(&flat_chunks, 0)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::encoders::ENCODER_PREFIX;
    use candle_core::DType;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(config: &ModelConfig, device: &Device) -> (VarMap, Idm) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = OnlineEncoder::new(vb.pp(ENCODER_PREFIX), config, device).unwrap();
        let idm = Idm::new(vb.pp("idm"), encoder, config, device).unwrap();
        (varmap, idm)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn images(b: usize, device: &Device) -> Tensor {
        Tensor::rand(0f32, 1.0, (b, 3, 16, 16), device).unwrap()
    }

    #[test]
    fn test_keep_mask_cardinality() {
        let config = ModelConfig {
            image_size: 100,
            patch_size: 10,
            top_pct: 0.1,
            ..ModelConfig::default()
        };
        assert_eq!(config.num_patches(), 100);
        let mut rng = StdRng::seed_from_u64(5);
        let keep = KeepMask::sample(4, config.num_patches(), config.keep_count(), &mut rng);
        assert_eq!(keep.keep_count(), 10);
        for row in keep.indices() {
            assert_eq!(row.len(), 10);
            assert!(row.windows(2).all(|w| w[0] < w[1]));
            assert!(row.iter().all(|&i| i < 100));
        }
        let mask = keep.mask_tensor(&Device::Cpu).unwrap();
        let per_row: Vec<u32> = mask.to_dtype(DType::U32).unwrap().sum(1).unwrap().to_vec1().unwrap();
        assert_eq!(per_row, vec![10; 4]);
    }

    #[test]
    fn test_keep_mask_rejects_bad_rows() {
        assert!(KeepMask::from_indices(vec![vec![0, 0]], 4).is_err());
        assert!(KeepMask::from_indices(vec![vec![0, 4]], 4).is_err());
        assert!(KeepMask::from_indices(vec![vec![0, 1], vec![2]], 4).is_err());
        assert!(KeepMask::from_indices(vec![vec![]], 4).is_err());
        let keep = KeepMask::from_indices(vec![vec![3, 1]], 4).unwrap();
        assert_eq!(keep.indices(), &[vec![1, 3]]);
    }

    #[test]
    fn test_dropped_patches_carry_drop_token() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);
        let (d, e, p) = (2, 16, 16);

        let before = images(2, &device);
        let after = images(2, &device);
        let keep = KeepMask::from_indices(vec![vec![0, 5, 6, 15], vec![1, 2, 3, 4]], p).unwrap();
        let ctx = idm.build_context(&before, &after, Some(&keep)).unwrap();
        assert_eq!(ctx.dims(), &[2, p, 2 * d * e]);

        let split = ctx.reshape((2, p, d, 2, e)).unwrap();
        let after_ctx = split.narrow(3, 1, 1).unwrap().squeeze(3).unwrap();
        let after_ctx = after_ctx.reshape((2, p, d * e)).unwrap();
        let drop = idm.drop_token().flatten_all().unwrap();

        let dropped = after_ctx.get(0).unwrap().get(1).unwrap();
        assert_eq!(max_abs_diff(&dropped, &drop), 0.0);
        let dropped = after_ctx.get(1).unwrap().get(15).unwrap();
        assert_eq!(max_abs_diff(&dropped, &drop), 0.0);

        // Kept patches match an encoder pass over just those patches.
        let tokens = idm.encoder().patch_and_embed(&after).unwrap();
        let index = Tensor::new(&[0u32, 5, 6, 15], &device).unwrap();
        let sample0 = tokens.get(0).unwrap().index_select(&index, 0).unwrap().unsqueeze(0).unwrap();
        let expected = idm.encoder().run_transformer(&sample0).unwrap(); // [1, D, 4, E]
        let expected_patch5 = expected
            .get(0)
            .unwrap()
            .narrow(1, 1, 1)
            .unwrap()
            .squeeze(1)
            .unwrap()
            .flatten_all()
            .unwrap();
        let got_patch5 = after_ctx.get(0).unwrap().get(5).unwrap();
        assert!(max_abs_diff(&got_patch5, &expected_patch5) < 1e-5);
    }

    #[test]
    fn test_context_interleaves_depthwise() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);

        let before = images(2, &device);
        let after = images(2, &device);
        let ctx = idm.build_context(&before, &after, None).unwrap();
        let split = ctx.reshape((2, 16, 2, 2, 16)).unwrap();

        let before_expected = idm.encoder().forward(&before).unwrap().transpose(1, 2).unwrap();
        let after_expected = idm.encoder().forward(&after).unwrap().transpose(1, 2).unwrap();
        let before_got = split.narrow(3, 0, 1).unwrap().squeeze(3).unwrap();
        let after_got = split.narrow(3, 1, 1).unwrap().squeeze(3).unwrap();
        assert!(max_abs_diff(&before_got, &before_expected) < 1e-5);
        assert!(max_abs_diff(&after_got, &after_expected) < 1e-5);
    }

    #[test]
    fn test_eval_length_is_fixed() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);
        let mut rng = StdRng::seed_from_u64(0);

        let before = images(2, &device);
        let after = images(2, &device);
        let out = idm.infer(&before, &after, Mode::Eval, &mut rng).unwrap();
        assert_eq!(out.la.dims(), &[2, 3, 8]);
        assert_eq!(out.la_flat.as_ref().unwrap().dims(), &[2, 24]);

        let again = idm.infer(&before, &after, Mode::Eval, &mut rng).unwrap();
        assert_eq!(max_abs_diff(&out.la, &again.la), 0.0);
    }

    #[test]
    fn test_train_length_within_bounds() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);
        let before = images(2, &device);
        let after = images(2, &device);

        let mut seen = std::collections::HashSet::new();
        for seed in 0..12 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = idm.infer(&before, &after, Mode::Train, &mut rng).unwrap();
            let n = out.num_tokens();
            assert!((config.min_tokens..=config.max_tokens).contains(&n));
            assert_eq!(out.la.dims(), &[2, n, 8]);
            assert!(out.la_flat.is_none());
            seen.insert(n);
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_label_fills_batch() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);
        let obs = Tensor::rand(0f32, 1.0, (3, 2, 3, 16, 16), &device).unwrap();
        let mut batch = TransitionBatch::new(obs).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        idm.label(&mut batch, Mode::Eval, &mut rng).unwrap();
        assert_eq!(batch.la.as_ref().unwrap().dims(), &[3, 3, 8]);
        assert!(batch.la_flat.is_some());

        idm.label(&mut batch, Mode::Train, &mut rng).unwrap();
        assert!(batch.la.is_some());
        assert!(batch.la_flat.is_none());
    }

    #[test]
    fn test_label_chunked_matches_single_pass() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);
        let obs = Tensor::rand(0f32, 1.0, (5, 3, 3, 16, 16), &device).unwrap();

        let chunked = idm.label_chunked(&obs, 2).unwrap();
        assert_eq!(chunked.la.dims(), &[5, 3, 8]);
        assert_eq!(chunked.la_flat.as_ref().unwrap().dims(), &[5, 24]);

        let batch = TransitionBatch::new(obs).unwrap();
        let direct = idm
            .infer_eval(&batch.before().unwrap(), &batch.after().unwrap())
            .unwrap();
        assert!(max_abs_diff(&chunked.la, &direct.la) < 1e-4);

        assert!(idm.label_chunked(&batch.obs, 0).is_err());
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let (_varmap, idm) = build(&config, &device);
        let mut rng = StdRng::seed_from_u64(0);
        let before = images(2, &device);
        let after = images(3, &device);
        assert!(matches!(
            idm.infer(&before, &after, Mode::Train, &mut rng),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            idm.infer(&before, &after, Mode::Eval, &mut rng),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
    }
}
