//! BYOL-style augmentations applied identically to a before/after image pair.
//!
//! Parameters are sampled once per sample and then applied to both views, so the
//! two frames stay spatially aligned patch for patch. Geometry (flip, resized crop)
//! and blur are expressed as row/column interpolation matrices, so every transform
//! is a handful of batched matmuls on the image's own device.

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::error::{DynamicsError, DynamicsResult};

/// Pixel-space crop box in source image coordinates. A flip mirrors the resized
/// crop, so the box always names the pixels that are read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropBox {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorJitter {
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    /// Hue rotation in turns
    pub hue: f64,
}

/// One sample's augmentation draw. Applying the same value to two images
/// applies the same transform to both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    pub flip: bool,
    pub crop: Option<CropBox>,
    pub jitter: Option<ColorJitter>,
    pub grayscale: bool,
    pub blur_sigma: Option<f64>,
    /// Brightness shift added before the solarize threshold; `None` skips solarizing.
    pub solarize: Option<f64>,
}

impl AugmentParams {
    /// No-op parameters.
    pub fn identity() -> Self {
        Self {
            flip: false,
            crop: None,
            jitter: None,
            grayscale: false,
            blur_sigma: None,
            solarize: None,
        }
    }
}

/// Paired augmentation with BYOL-style distributions.
#[derive(Debug, Clone)]
pub struct PairedAugment {
    pub flip_p: f64,
    pub crop_p: f64,
    pub crop_scale: (f64, f64),
    pub crop_ratio: (f64, f64),
    pub jitter_p: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub hue: f64,
    pub grayscale_p: f64,
    pub blur_p: f64,
    pub blur_kernel: usize,
    pub blur_sigma: (f64, f64),
    pub solarize_p: f64,
    pub solarize_threshold: f64,
    /// Half-width of the uniform brightness shift drawn with each solarize
    pub solarize_addition: f64,
}

impl Default for PairedAugment {
    fn default() -> Self {
        Self {
            flip_p: 0.5,
            crop_p: 0.5,
            crop_scale: (0.7, 1.0),
            crop_ratio: (0.9, 1.1),
            jitter_p: 0.8,
            brightness: 0.4,
            contrast: 0.4,
            saturation: 0.4,
            hue: 0.1,
            grayscale_p: 0.2,
            blur_p: 1.0,
            blur_kernel: 7,
            blur_sigma: (0.1, 2.0),
            solarize_p: 0.2,
            solarize_threshold: 0.5,
            solarize_addition: 0.1,
        }
    }
}

impl PairedAugment {
    /// Draw one parameter set for an image of `height` x `width`.
    pub fn sample_one<R: Rng + ?Sized>(&self, height: usize, width: usize, rng: &mut R) -> AugmentParams {
        let flip = rng.gen_bool(self.flip_p);
        let crop = if rng.gen_bool(self.crop_p) {
            Some(self.sample_crop(height, width, rng))
        } else {
            None
        };
        let jitter = if rng.gen_bool(self.jitter_p) {
            Some(ColorJitter {
                brightness: rng.gen_range(1.0 - self.brightness..=1.0 + self.brightness),
                contrast: rng.gen_range(1.0 - self.contrast..=1.0 + self.contrast),
                saturation: rng.gen_range(1.0 - self.saturation..=1.0 + self.saturation),
                hue: rng.gen_range(-self.hue..=self.hue),
            })
        } else {
            None
        };
        let grayscale = rng.gen_bool(self.grayscale_p);
        let blur_sigma = if rng.gen_bool(self.blur_p) {
            Some(rng.gen_range(self.blur_sigma.0..=self.blur_sigma.1))
        } else {
            None
        };
        let solarize = if rng.gen_bool(self.solarize_p) {
            Some(rng.gen_range(-self.solarize_addition..=self.solarize_addition))
        } else {
            None
        };
        AugmentParams {
            flip,
            crop,
            jitter,
            grayscale,
            blur_sigma,
            solarize,
        }
    }

    /// Draw one parameter set per sample.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch: usize,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> Vec<AugmentParams> {
        (0..batch).map(|_| self.sample_one(height, width, rng)).collect()
    }

    fn sample_crop<R: Rng + ?Sized>(&self, height: usize, width: usize, rng: &mut R) -> CropBox {
        let area = (height * width) as f64;
        let scale = rng.gen_range(self.crop_scale.0..=self.crop_scale.1);
        let log_ratio = rng.gen_range(self.crop_ratio.0.ln()..=self.crop_ratio.1.ln());
        let ratio = log_ratio.exp();
        let target = area * scale;
        let crop_w = ((target * ratio).sqrt().round() as usize).clamp(1, width);
        let crop_h = ((target / ratio).sqrt().round() as usize).clamp(1, height);
        CropBox {
            top: rng.gen_range(0..=height - crop_h),
            left: rng.gen_range(0..=width - crop_w),
            height: crop_h,
            width: crop_w,
        }
    }

    /// Apply per-sample parameters to a [B, C, H, W] batch in [0, 1].
    /// The result has the same shape and carries no gradient history.
    pub fn apply(&self, images: &Tensor, params: &[AugmentParams]) -> DynamicsResult<Tensor> {
        let (b, _, _, _) = images.dims4()?;
        if params.len() != b {
            return Err(DynamicsError::shape_mismatch(
                format!("{b} augmentation parameter sets"),
                format!("{}", params.len()),
            ));
        }
        let images = images.detach();
        let mut out = Vec::with_capacity(b);
        for (i, p) in params.iter().enumerate() {
            out.push(self.apply_one(&images.get(i)?, p)?);
        }
        Ok(Tensor::stack(&out, 0)?)
    }

    /// Sample once and apply the same draw to both inputs.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x1: &Tensor,
        x2: &Tensor,
        rng: &mut R,
    ) -> DynamicsResult<(Tensor, Tensor)> {
        if x1.dims() != x2.dims() {
            return Err(DynamicsError::shape_mismatch(
                format!("{:?}", x1.dims()),
                format!("{:?}", x2.dims()),
            ));
        }
        let (b, _, h, w) = x1.dims4()?;
        let params = self.sample(b, h, w, rng);
        Ok((self.apply(x1, &params)?, self.apply(x2, &params)?))
    }

    /// x: [C, H, W]
    fn apply_one(&self, x: &Tensor, p: &AugmentParams) -> DynamicsResult<Tensor> {
        let (c, h, w) = x.dims3()?;
        let device = x.device();

        let mut x = if p.flip || p.crop.is_some() {
            let crop = p.crop.unwrap_or(CropBox {
                top: 0,
                left: 0,
                height: h,
                width: w,
            });
            let rows = resize_matrix(h, crop.top, crop.height, h, false);
            let cols = resize_matrix(w, crop.left, crop.width, w, p.flip);
            separable(x, rows, cols, h, w, device)?
        } else {
            x.clone()
        };

        if let Some(j) = p.jitter {
            x = x.affine(j.brightness, 0.0)?.clamp(0f32, 1f32)?;
            let mean = grayscale(&x)?.mean_all()?;
            x = x
                .broadcast_sub(&mean)?
                .affine(j.contrast, 0.0)?
                .broadcast_add(&mean)?
                .clamp(0f32, 1f32)?;
            if c == 3 {
                let gray = grayscale(&x)?;
                x = x
                    .broadcast_sub(&gray)?
                    .affine(j.saturation, 0.0)?
                    .broadcast_add(&gray)?
                    .clamp(0f32, 1f32)?;
                x = rotate_hue(&x, j.hue)?.clamp(0f32, 1f32)?;
            }
        }

        if p.grayscale && c == 3 {
            x = grayscale(&x)?.broadcast_as((c, h, w))?.contiguous()?;
        }

        if let Some(sigma) = p.blur_sigma {
            let rows = blur_matrix(h, self.blur_kernel, sigma);
            let cols = blur_matrix(w, self.blur_kernel, sigma);
            x = separable(&x, rows, cols, h, w, device)?;
        }

        if let Some(addition) = p.solarize {
            x = x.affine(1.0, addition)?.clamp(0f32, 1f32)?;
            let over = x.ge(self.solarize_threshold)?;
            x = over.where_cond(&x.affine(-1.0, 1.0)?, &x)?;
        }

        Ok(x.clamp(0f32, 1f32)?)
    }
}

/// out = rows · x · colsᵀ per channel. `rows` is [H_out, H] and `cols` is [W_out, W],
/// both row-major.
fn separable(
    x: &Tensor,
    rows: Vec<f32>,
    cols: Vec<f32>,
    h: usize,
    w: usize,
    device: &Device,
) -> DynamicsResult<Tensor> {
    let h_out = rows.len() / h;
    let w_out = cols.len() / w;
    let rows = Tensor::from_vec(rows, (h_out, h), device)?;
    let cols_t = Tensor::from_vec(cols, (w_out, w), device)?.t()?.contiguous()?;
    let x = rows.broadcast_matmul(&x.contiguous()?)?;
    Ok(x.broadcast_matmul(&cols_t)?)
}

/// Bilinear sampling matrix [out_len, src_len] reading only `start..start + len`
/// of the source axis. `mirror` reverses the output axis. Sample centres follow the
/// half-pixel convention, so a full-length window is the identity.
fn resize_matrix(src_len: usize, start: usize, len: usize, out_len: usize, mirror: bool) -> Vec<f32> {
    let mut m = vec![0f32; out_len * src_len];
    let scale = len as f64 / out_len as f64;
    for o in 0..out_len {
        let pos = ((o as f64 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f64);
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(len - 1);
        let frac = (pos - lo as f64) as f32;
        let row = if mirror { out_len - 1 - o } else { o };
        for (idx, weight) in [(lo, 1.0 - frac), (hi, frac)] {
            m[row * src_len + start + idx] += weight;
        }
    }
    m
}

/// Gaussian blur as a [len, len] matrix with reflect borders.
fn blur_matrix(len: usize, kernel: usize, sigma: f64) -> Vec<f32> {
    let radius = (kernel / 2) as isize;
    let taps: Vec<f64> = (-radius..=radius)
        .map(|k| (-((k * k) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f64 = taps.iter().sum();

    let mut m = vec![0f32; len * len];
    for i in 0..len {
        for (t, k) in (-radius..=radius).enumerate() {
            let j = reflect(i as isize + k, len);
            m[i * len + j] += (taps[t] / norm) as f32;
        }
    }
    m
}

fn reflect(idx: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut i = idx.rem_euclid(period);
    if i >= len as isize {
        i = period - i;
    }
    i as usize
}

/// ITU-R 601 luma; [C, H, W] -> [1, H, W]. Single-channel input is returned unchanged.
fn grayscale(x: &Tensor) -> DynamicsResult<Tensor> {
    let (c, _, _) = x.dims3()?;
    if c != 3 {
        return Ok(x.mean_keepdim(0)?);
    }
    let weights = Tensor::new(&[0.299f32, 0.587, 0.114], x.device())?.reshape((3, 1, 1))?;
    Ok(x.broadcast_mul(&weights)?.sum_keepdim(0)?)
}

/// Rotate chroma in YIQ space by `turns` of a full circle.
fn rotate_hue(x: &Tensor, turns: f64) -> DynamicsResult<Tensor> {
    let (c, h, w) = x.dims3()?;
    let theta = turns * std::f64::consts::TAU;
    let (sin, cos) = theta.sin_cos();
    let to_yiq = [
        [0.299, 0.587, 0.114],
        [0.596, -0.274, -0.322],
        [0.211, -0.523, 0.312],
    ];
    let from_yiq = [[1.0, 0.956, 0.621], [1.0, -0.272, -0.647], [1.0, -1.106, 1.703]];
    let rot = [[1.0, 0.0, 0.0], [0.0, cos, -sin], [0.0, sin, cos]];
    let m = matmul3(&from_yiq, &matmul3(&rot, &to_yiq));
    let flat: Vec<f32> = m.iter().flatten().map(|v| *v as f32).collect();
    let m = Tensor::from_vec(flat, (3, 3), x.device())?;
    let pixels = x.reshape((c, h * w))?;
    Ok(m.matmul(&pixels)?.reshape((c, h, w))?)
}

fn matmul3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use candle_core::DType;
    use rand::SeedableRng;

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

    #[test]
    fn test_identity_params_preserve_image() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let x = Tensor::rand(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
        let params = vec![AugmentParams::identity(); 2];
        let y = aug.apply(&x, &params).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-6);
    }

    #[test]
    fn test_full_window_resize_is_identity() {
        let m = resize_matrix(5, 0, 5, 5, false);
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(m[i * 5 + j], expected);
            }
        }
    }

    #[test]
    fn test_blur_rows_sum_to_one() {
        let m = blur_matrix(9, 7, 1.5);
        for i in 0..9 {
            let sum: f32 = m[i * 9..(i + 1) * 9].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        assert_eq!(reflect(-1, 9), 1);
        assert_eq!(reflect(9, 9), 7);
    }

    #[test]
    fn test_flip_mirrors_columns() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let ramp: Vec<f32> = (0..16).map(|i| (i % 4) as f32 / 3.0).collect();
        let x = Tensor::from_vec(ramp, (1, 1, 4, 4), &device).unwrap();
        let params = [AugmentParams {
            flip: true,
            ..AugmentParams::identity()
        }];
        let y = aug.apply(&x, &params).unwrap();
        let row: Vec<f32> = y.get(0).unwrap().get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert!((row[0] - 1.0).abs() < 1e-6);
        assert!(row[3].abs() < 1e-6);
    }

    #[test]
    fn test_forced_crop_reads_only_crop_support() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let crop = CropBox {
            top: 2,
            left: 4,
            height: 8,
            width: 6,
        };

        // Two different images that agree only inside the crop box.
        let a = Tensor::rand(0f32, 1.0, (1, 3, 16, 16), &device).unwrap();
        let b = Tensor::rand(0f32, 1.0, (1, 3, 16, 16), &device).unwrap();
        let mut mask = vec![0f32; 16 * 16];
        for r in crop.top..crop.top + crop.height {
            for c in crop.left..crop.left + crop.width {
                mask[r * 16 + c] = 1.0;
            }
        }
        let mask = Tensor::from_vec(mask, (1, 1, 16, 16), &device).unwrap();
        let inv = mask.affine(-1.0, 1.0).unwrap();
        let b = (a.broadcast_mul(&mask).unwrap() + b.broadcast_mul(&inv).unwrap()).unwrap();
        assert!(max_abs_diff(&a, &b) > 0.1);

        for flip in [false, true] {
            let params = [AugmentParams {
                flip,
                crop: Some(crop),
                blur_sigma: Some(1.0),
                ..AugmentParams::identity()
            }];
            let ya = aug.apply(&a, &params).unwrap();
            let yb = aug.apply(&b, &params).unwrap();
            assert_eq!(ya.dims(), &[1, 3, 16, 16]);
            assert!(max_abs_diff(&ya, &yb) < 1e-6, "flip = {flip}");
        }
    }

    #[test]
    fn test_flip_mirrors_the_crop() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let crop = CropBox {
            top: 0,
            left: 3,
            height: 16,
            width: 8,
        };
        let x = Tensor::rand(0f32, 1.0, (1, 1, 16, 16), &device).unwrap();
        let plain = [AugmentParams {
            crop: Some(crop),
            ..AugmentParams::identity()
        }];
        let flipped = [AugmentParams {
            flip: true,
            ..plain[0]
        }];

        let y = aug.apply(&x, &plain).unwrap();
        let y_flip = aug.apply(&x, &flipped).unwrap();
        let reversed = Tensor::new((0..16u32).rev().collect::<Vec<_>>().as_slice(), &device).unwrap();
        let expected = y.index_select(&reversed, 3).unwrap();
        assert!(max_abs_diff(&y_flip, &expected) < 1e-6);
    }

    #[test]
    fn test_pair_receives_identical_draw() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let mut rng = StdRng::seed_from_u64(3);
        let x = Tensor::rand(0f32, 1.0, (4, 3, 16, 16), &device).unwrap();
        for _ in 0..5 {
            let (y1, y2) = aug.forward(&x, &x.clone(), &mut rng).unwrap();
            assert_eq!(y1.dims(), x.dims());
            assert!(max_abs_diff(&y1, &y2) == 0.0);
            let min = y1.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
            let max = y1.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
            assert!(min >= 0.0 && max <= 1.0);
        }
    }

    #[test]
    fn test_pair_shape_mismatch_is_rejected() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let mut rng = StdRng::seed_from_u64(0);
        let a = Tensor::zeros((2, 3, 16, 16), DType::F32, &device).unwrap();
        let b = Tensor::zeros((3, 3, 16, 16), DType::F32, &device).unwrap();
        assert!(matches!(
            aug.forward(&a, &b, &mut rng),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_sampling_is_seeded_and_in_range() {
        let aug = PairedAugment::default();
        let a = aug.sample(64, 32, 32, &mut StdRng::seed_from_u64(11));
        let b = aug.sample(64, 32, 32, &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
        for p in &a {
            if let Some(crop) = p.crop {
                assert!(crop.top + crop.height <= 32);
                assert!(crop.left + crop.width <= 32);
                assert!(crop.height * crop.width >= 32 * 32 * 6 / 10);
            }
            if let Some(j) = p.jitter {
                assert!((0.6..=1.4).contains(&j.brightness));
                assert!((-0.1..=0.1).contains(&j.hue));
            }
            let sigma = p.blur_sigma.unwrap();
            assert!((0.1..=2.0).contains(&sigma));
            if let Some(addition) = p.solarize {
                assert!((-0.1..=0.1).contains(&addition));
            }
        }
        assert!(a.iter().any(|p| p.flip) && a.iter().any(|p| !p.flip));
    }

    #[test]
    fn test_solarize_inverts_bright_pixels() {
        let device = Device::Cpu;
        let aug = PairedAugment::default();
        let x = Tensor::new(&[0.2f32, 0.8], &device)
            .unwrap()
            .reshape((1, 1, 1, 2))
            .unwrap();
        let params = [AugmentParams {
            solarize: Some(0.0),
            ..AugmentParams::identity()
        }];
        let y: Vec<f32> = aug.apply(&x, &params).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((y[0] - 0.2).abs() < 1e-6);
        assert!((y[1] - 0.2).abs() < 1e-6);

        // The brightness shift lands before the threshold: 0.45 + 0.1 crosses it.
        let x = Tensor::new(&[0.45f32, 0.95], &device)
            .unwrap()
            .reshape((1, 1, 1, 2))
            .unwrap();
        let params = [AugmentParams {
            solarize: Some(0.1),
            ..AugmentParams::identity()
        }];
        let y: Vec<f32> = aug.apply(&x, &params).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((y[0] - 0.45).abs() < 1e-6);
        assert!(y[1].abs() < 1e-6);
    }
}
