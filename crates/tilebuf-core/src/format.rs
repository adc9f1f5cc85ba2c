//! Pixel formats and conversions.
//!
//! A [`PixelFormat`] pairs a component [`BaseType`] (u8, u16, f16, f32) with
//! a channel layout ([`Channels`]: Y, YA, RGB, RGBA). The buffer core only
//! depends on two properties of a format: its byte width and the ability to
//! [`convert`] a run of pixels to another format.
//!
//! Formats have stable textual names such as `"Y float"` or `"RGBA u8"`,
//! used by the on-disk header and by diagnostics.
//!
//! # Conversion model
//!
//! Conversions go through an RGBA f32 intermediate:
//!
//! - integer components are normalized to [0, 1]
//! - a missing alpha channel decodes as 1.0
//! - RGB collapses to Y through Rec.709 luminance
//!
//! The identity case is a straight byte copy.
//!
//! # Usage
//!
//! ```rust
//! use tilebuf_core::{convert, PixelFormat};
//!
//! let src = [255u8, 0, 0, 255]; // one RGBA u8 pixel
//! let mut dst = [0u8; 4];       // one Y f32 pixel
//! convert(PixelFormat::RGBA_U8, PixelFormat::Y_F32, &src, &mut dst, 1);
//! let y = f32::from_ne_bytes(dst);
//! assert!((y - 0.2126).abs() < 1e-4);
//! ```

use half::f16;

/// Rec.709 luminance coefficients as an array [R, G, B].
pub const REC709_LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// Calculate Rec.709 luminance from RGB values.
///
/// `Y = 0.2126*R + 0.7152*G + 0.0722*B`
#[inline]
pub fn luminance_rec709(rgb: [f32; 3]) -> f32 {
    rgb[0] * REC709_LUMA[0] + rgb[1] * REC709_LUMA[1] + rgb[2] * REC709_LUMA[2]
}

/// Component type of a pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BaseType {
    /// 8-bit unsigned, normalized to [0, 1].
    U8,
    /// 16-bit unsigned, normalized to [0, 1].
    U16,
    /// 16-bit half-precision float.
    F16,
    /// 32-bit single-precision float.
    F32,
}

impl BaseType {
    /// Bytes per component.
    #[inline]
    pub const fn bytes(&self) -> usize {
        match self {
            BaseType::U8 => 1,
            BaseType::U16 => 2,
            BaseType::F16 => 2,
            BaseType::F32 => 4,
        }
    }

    /// Whether this is a floating-point component type.
    #[inline]
    pub const fn is_float(&self) -> bool {
        matches!(self, BaseType::F16 | BaseType::F32)
    }

    /// Stable textual name, as used in format names.
    pub const fn name(&self) -> &'static str {
        match self {
            BaseType::U8 => "u8",
            BaseType::U16 => "u16",
            BaseType::F16 => "half",
            BaseType::F32 => "float",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "u8" => Some(BaseType::U8),
            "u16" => Some(BaseType::U16),
            "half" => Some(BaseType::F16),
            "float" => Some(BaseType::F32),
            _ => None,
        }
    }
}

/// Channel layout of a pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Channels {
    /// Single-channel grayscale.
    Y,
    /// Grayscale with alpha.
    Ya,
    /// Three-channel color.
    Rgb,
    /// Color with alpha.
    Rgba,
}

impl Channels {
    /// Number of channels.
    #[inline]
    pub const fn count(&self) -> usize {
        match self {
            Channels::Y => 1,
            Channels::Ya => 2,
            Channels::Rgb => 3,
            Channels::Rgba => 4,
        }
    }

    /// Whether the last channel is alpha.
    #[inline]
    pub const fn has_alpha(&self) -> bool {
        matches!(self, Channels::Ya | Channels::Rgba)
    }

    /// Stable textual name, as used in format names.
    pub const fn name(&self) -> &'static str {
        match self {
            Channels::Y => "Y",
            Channels::Ya => "YA",
            Channels::Rgb => "RGB",
            Channels::Rgba => "RGBA",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Y" => Some(Channels::Y),
            "YA" => Some(Channels::Ya),
            "RGB" => Some(Channels::Rgb),
            "RGBA" => Some(Channels::Rgba),
            _ => None,
        }
    }
}

/// A pixel format: component type × channel layout.
///
/// Formats are small copyable values compared by value; two formats are
/// interchangeable exactly when they are equal.
///
/// # Example
///
/// ```rust
/// use tilebuf_core::PixelFormat;
///
/// let f = PixelFormat::RGBA_F32;
/// assert_eq!(f.bytes_per_pixel(), 16);
/// assert_eq!(f.name(), "RGBA float");
/// assert_eq!(PixelFormat::from_name("RGBA float"), Some(f));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PixelFormat {
    /// Component type.
    pub base: BaseType,
    /// Channel layout.
    pub channels: Channels,
}

impl PixelFormat {
    /// Single-channel 8-bit.
    pub const Y_U8: PixelFormat = PixelFormat::new(BaseType::U8, Channels::Y);
    /// Single-channel 16-bit.
    pub const Y_U16: PixelFormat = PixelFormat::new(BaseType::U16, Channels::Y);
    /// Single-channel half float.
    pub const Y_F16: PixelFormat = PixelFormat::new(BaseType::F16, Channels::Y);
    /// Single-channel float.
    pub const Y_F32: PixelFormat = PixelFormat::new(BaseType::F32, Channels::Y);
    /// RGB 8-bit.
    pub const RGB_U8: PixelFormat = PixelFormat::new(BaseType::U8, Channels::Rgb);
    /// RGB float.
    pub const RGB_F32: PixelFormat = PixelFormat::new(BaseType::F32, Channels::Rgb);
    /// RGBA 8-bit.
    pub const RGBA_U8: PixelFormat = PixelFormat::new(BaseType::U8, Channels::Rgba);
    /// RGBA half float.
    pub const RGBA_F16: PixelFormat = PixelFormat::new(BaseType::F16, Channels::Rgba);
    /// RGBA float, the conversion intermediate.
    pub const RGBA_F32: PixelFormat = PixelFormat::new(BaseType::F32, Channels::Rgba);

    /// Creates a format from its parts.
    #[inline]
    pub const fn new(base: BaseType, channels: Channels) -> Self {
        Self { base, channels }
    }

    /// Bytes per pixel.
    #[inline]
    pub const fn bytes_per_pixel(&self) -> usize {
        self.base.bytes() * self.channels.count()
    }

    /// Number of channels.
    #[inline]
    pub const fn n_channels(&self) -> usize {
        self.channels.count()
    }

    /// Stable textual name, e.g. `"Y float"`.
    pub fn name(&self) -> String {
        format!("{} {}", self.channels.name(), self.base.name())
    }

    /// Parses a format from its [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        let mut parts = name.split_whitespace();
        let channels = Channels::from_name(parts.next()?)?;
        let base = BaseType::from_name(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(base, channels))
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.channels.name(), self.base.name())
    }
}

#[inline]
fn decode_component(base: BaseType, bytes: &[u8]) -> f32 {
    match base {
        BaseType::U8 => bytes[0] as f32 / 255.0,
        BaseType::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 65535.0,
        BaseType::F16 => f16::from_bits(u16::from_ne_bytes([bytes[0], bytes[1]])).to_f32(),
        BaseType::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

#[inline]
fn encode_component(base: BaseType, value: f32, out: &mut [u8]) {
    match base {
        BaseType::U8 => out[0] = (value.clamp(0.0, 1.0) * 255.0).round() as u8,
        BaseType::U16 => {
            let v = (value.clamp(0.0, 1.0) * 65535.0).round() as u16;
            out[..2].copy_from_slice(&v.to_ne_bytes());
        }
        BaseType::F16 => {
            out[..2].copy_from_slice(&f16::from_f32(value).to_bits().to_ne_bytes());
        }
        BaseType::F32 => out[..4].copy_from_slice(&value.to_ne_bytes()),
    }
}

/// Decodes one pixel into the RGBA f32 intermediate.
pub fn decode_pixel(format: PixelFormat, bytes: &[u8]) -> [f32; 4] {
    let cb = format.base.bytes();
    let c = |i: usize| decode_component(format.base, &bytes[i * cb..]);
    match format.channels {
        Channels::Y => {
            let y = c(0);
            [y, y, y, 1.0]
        }
        Channels::Ya => {
            let y = c(0);
            [y, y, y, c(1)]
        }
        Channels::Rgb => [c(0), c(1), c(2), 1.0],
        Channels::Rgba => [c(0), c(1), c(2), c(3)],
    }
}

/// Encodes one RGBA f32 pixel into `out`.
pub fn encode_pixel(format: PixelFormat, rgba: [f32; 4], out: &mut [u8]) {
    let cb = format.base.bytes();
    match format.channels {
        Channels::Y => {
            encode_component(format.base, luminance_rec709([rgba[0], rgba[1], rgba[2]]), out);
        }
        Channels::Ya => {
            encode_component(format.base, luminance_rec709([rgba[0], rgba[1], rgba[2]]), out);
            encode_component(format.base, rgba[3], &mut out[cb..]);
        }
        Channels::Rgb => {
            for i in 0..3 {
                encode_component(format.base, rgba[i], &mut out[i * cb..]);
            }
        }
        Channels::Rgba => {
            for i in 0..4 {
                encode_component(format.base, rgba[i], &mut out[i * cb..]);
            }
        }
    }
}

/// Converts `n_pixels` pixels from `src_fmt` to `dst_fmt`.
///
/// The identity case is a plain byte copy. `src` must hold at least
/// `n_pixels * src_fmt.bytes_per_pixel()` bytes and `dst` at least
/// `n_pixels * dst_fmt.bytes_per_pixel()`.
pub fn convert(src_fmt: PixelFormat, dst_fmt: PixelFormat, src: &[u8], dst: &mut [u8], n_pixels: usize) {
    let sbpp = src_fmt.bytes_per_pixel();
    let dbpp = dst_fmt.bytes_per_pixel();
    if src_fmt == dst_fmt {
        dst[..n_pixels * dbpp].copy_from_slice(&src[..n_pixels * sbpp]);
        return;
    }
    for i in 0..n_pixels {
        let rgba = decode_pixel(src_fmt, &src[i * sbpp..]);
        encode_pixel(dst_fmt, rgba, &mut dst[i * dbpp..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelFormat::Y_U8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Y_F32.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGBA_U8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGBA_F16.bytes_per_pixel(), 8);
        assert_eq!(PixelFormat::RGBA_F32.bytes_per_pixel(), 16);
    }

    #[test]
    fn test_name_round_trip() {
        for f in [
            PixelFormat::Y_U8,
            PixelFormat::Y_F32,
            PixelFormat::RGB_U8,
            PixelFormat::RGBA_F16,
            PixelFormat::RGBA_F32,
        ] {
            assert_eq!(PixelFormat::from_name(&f.name()), Some(f));
        }
        assert_eq!(PixelFormat::from_name("YCbCr u8"), None);
        assert_eq!(PixelFormat::from_name("Y"), None);
    }

    #[test]
    fn test_convert_identity() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 8];
        convert(PixelFormat::RGBA_U8, PixelFormat::RGBA_U8, &src, &mut dst, 2);
        assert_eq!(src, dst);
    }

    #[test]
    fn test_convert_u8_to_f32() {
        let src = [0u8, 128, 255];
        let mut dst = [0u8; 12];
        convert(PixelFormat::Y_U8, PixelFormat::Y_F32, &src, &mut dst, 3);
        let v1 = f32::from_ne_bytes(dst[4..8].try_into().unwrap());
        let v2 = f32::from_ne_bytes(dst[8..12].try_into().unwrap());
        assert_abs_diff_eq!(v1, 128.0 / 255.0, epsilon = 1e-6);
        assert_abs_diff_eq!(v2, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_convert_f32_to_u8_round_trip() {
        let values = [0.0f32, 0.25, 0.5, 1.0];
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        let mut u8s = [0u8; 4];
        convert(PixelFormat::Y_F32, PixelFormat::Y_U8, &bytes, &mut u8s, 4);
        let mut back = [0u8; 16];
        convert(PixelFormat::Y_U8, PixelFormat::Y_F32, &u8s, &mut back, 4);
        for (i, v) in values.iter().enumerate() {
            let r = f32::from_ne_bytes(back[i * 4..i * 4 + 4].try_into().unwrap());
            assert_abs_diff_eq!(r, *v, epsilon = 1.0 / 255.0);
        }
    }

    #[test]
    fn test_rgb_to_y_luminance() {
        let src = [1.0f32, 0.0, 0.0];
        let mut bytes = Vec::new();
        for v in src {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        let mut dst = [0u8; 4];
        convert(PixelFormat::RGB_F32, PixelFormat::Y_F32, &bytes, &mut dst, 1);
        let y = f32::from_ne_bytes(dst);
        assert_abs_diff_eq!(y, REC709_LUMA[0], epsilon = 1e-6);
    }

    #[test]
    fn test_alpha_defaults_to_opaque() {
        let src = [0.5f32.to_ne_bytes(), 0.25f32.to_ne_bytes(), 0.75f32.to_ne_bytes()].concat();
        let mut dst = [0u8; 16];
        convert(PixelFormat::RGB_F32, PixelFormat::RGBA_F32, &src, &mut dst, 1);
        let a = f32::from_ne_bytes(dst[12..16].try_into().unwrap());
        assert_abs_diff_eq!(a, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_f16_round_trip() {
        let src = [0.5f32.to_ne_bytes(), 1.0f32.to_ne_bytes()].concat();
        let mut half = [0u8; 4];
        convert(PixelFormat::Y_F32, PixelFormat::Y_F16, &src, &mut half, 2);
        let mut back = [0u8; 8];
        convert(PixelFormat::Y_F16, PixelFormat::Y_F32, &half, &mut back, 2);
        assert_abs_diff_eq!(
            f32::from_ne_bytes(back[0..4].try_into().unwrap()),
            0.5,
            epsilon = 1e-3
        );
    }
}
