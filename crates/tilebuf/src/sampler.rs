//! Samplers: fractional-coordinate reads over a buffer.
//!
//! Samplers are clients of the buffer: they read pixels through the
//! ordinary access paths and interpolate. The buffer caches one sampler
//! instance across [`Buffer::sample`] calls while the requested format and
//! kind are stable.

use tilebuf_core::{decode_pixel, encode_pixel, PixelFormat};

use crate::buffer::{AbyssPolicy, Buffer};

/// A 2×2 scale/transform hint passed through to samplers.
///
/// Row-major `[a, b, c, d]` for the matrix `[[a, b], [c, d]]`. The
/// bundled samplers ignore it; anisotropic samplers use it to size their
/// footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix2 {
    /// Row-major coefficients.
    pub coeffs: [f64; 4],
}

impl Matrix2 {
    /// The identity transform.
    pub const IDENTITY: Matrix2 = Matrix2 {
        coeffs: [1.0, 0.0, 0.0, 1.0],
    };
}

/// Which interpolation a [`Buffer::sample`] call wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Pick the pixel containing the sample point.
    Nearest,
    /// Bilinear interpolation of the four surrounding pixels.
    Linear,
}

/// A sampler instance bound to an output format.
pub trait Sampler: Send + Sync {
    /// Samples the buffer at (x, y), writing one pixel in the sampler's
    /// output format.
    fn sample(
        &self,
        buffer: &Buffer,
        x: f64,
        y: f64,
        scale: Option<&Matrix2>,
        dst: &mut [u8],
        policy: AbyssPolicy,
    );
}

pub(crate) struct CachedSampler {
    pub(crate) kind: SamplerKind,
    pub(crate) format: PixelFormat,
    pub(crate) sampler: Box<dyn Sampler>,
}

pub(crate) fn make_sampler(kind: SamplerKind, format: PixelFormat) -> CachedSampler {
    let sampler: Box<dyn Sampler> = match kind {
        SamplerKind::Nearest => Box::new(NearestSampler { format }),
        SamplerKind::Linear => Box::new(LinearSampler { format }),
    };
    CachedSampler {
        kind,
        format,
        sampler,
    }
}

struct NearestSampler {
    format: PixelFormat,
}

impl Sampler for NearestSampler {
    fn sample(
        &self,
        buffer: &Buffer,
        x: f64,
        y: f64,
        _scale: Option<&Matrix2>,
        dst: &mut [u8],
        policy: AbyssPolicy,
    ) {
        buffer.get_pixel(x.floor() as i32, y.floor() as i32, Some(self.format), dst, policy);
    }
}

struct LinearSampler {
    format: PixelFormat,
}

impl Sampler for LinearSampler {
    fn sample(
        &self,
        buffer: &Buffer,
        x: f64,
        y: f64,
        _scale: Option<&Matrix2>,
        dst: &mut [u8],
        policy: AbyssPolicy,
    ) {
        let x0 = x.floor() as i32;
        let y0 = y.floor() as i32;
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;

        let fetch = |px: i32, py: i32| -> [f32; 4] {
            let mut raw = [0u8; 16];
            buffer.get_pixel(px, py, Some(PixelFormat::RGBA_F32), &mut raw, policy);
            decode_pixel(PixelFormat::RGBA_F32, &raw)
        };

        let p00 = fetch(x0, y0);
        let p10 = fetch(x0 + 1, y0);
        let p01 = fetch(x0, y0 + 1);
        let p11 = fetch(x0 + 1, y0 + 1);

        let mut out = [0.0f32; 4];
        for (c, value) in out.iter_mut().enumerate() {
            let top = p00[c] * (1.0 - fx) + p10[c] * fx;
            let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
            *value = top * (1.0 - fy) + bottom * fy;
        }
        encode_pixel(self.format, out, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilebuf_core::Rect;

    fn gradient_buffer() -> Buffer {
        let b = Buffer::new(Rect::new(0, 0, 4, 4), PixelFormat::Y_F32);
        for y in 0..4 {
            for x in 0..4 {
                b.set_pixel(x, y, None, &(x as f32).to_ne_bytes());
            }
        }
        b
    }

    #[test]
    fn test_nearest_sampler_picks_containing_pixel() {
        let b = gradient_buffer();
        let mut out = [0u8; 4];
        b.sample(
            2.9,
            0.1,
            None,
            &mut out,
            None,
            SamplerKind::Nearest,
            AbyssPolicy::None,
        );
        assert_eq!(f32::from_ne_bytes(out), 2.0);
    }

    #[test]
    fn test_linear_sampler_interpolates() {
        let b = gradient_buffer();
        let mut out = [0u8; 4];
        b.sample(
            1.5,
            1.0,
            None,
            &mut out,
            None,
            SamplerKind::Linear,
            AbyssPolicy::Clamp,
        );
        let v = f32::from_ne_bytes(out);
        assert!((v - 1.5).abs() < 1e-5, "got {v}");
    }

    #[test]
    fn test_sampler_instance_cached_across_calls() {
        let b = gradient_buffer();
        let mut out = [0u8; 4];
        b.sample(1.0, 1.0, None, &mut out, None, SamplerKind::Linear, AbyssPolicy::None);
        b.sample(2.0, 1.0, None, &mut out, None, SamplerKind::Linear, AbyssPolicy::None);
        b.sample_cleanup();
    }
}
