// ============================================================================
// COMPOSITION MODES — per-pixel blending on premultiplied RGBA8
// ============================================================================

use crate::log_warn;

/// Premultiplied RGBA8 pixel.
pub type Premul = [u8; 4];

pub const TRANSPARENT: Premul = [0, 0, 0, 0];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Additive,
    Subtract,
    Divide,
    LinearBurn,
    LinearLight,
    VividLight,
    PinLight,
    HardMix,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// Returns all blend modes for UI display
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Additive,
            BlendMode::Subtract,
            BlendMode::Divide,
            BlendMode::LinearBurn,
            BlendMode::LinearLight,
            BlendMode::VividLight,
            BlendMode::PinLight,
            BlendMode::HardMix,
            BlendMode::Hue,
            BlendMode::Saturation,
            BlendMode::Color,
            BlendMode::Luminosity,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::HardLight => "Hard Light",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::Difference => "Difference",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Additive => "Additive",
            BlendMode::Subtract => "Subtract",
            BlendMode::Divide => "Divide",
            BlendMode::LinearBurn => "Linear Burn",
            BlendMode::LinearLight => "Linear Light",
            BlendMode::VividLight => "Vivid Light",
            BlendMode::PinLight => "Pin Light",
            BlendMode::HardMix => "Hard Mix",
            BlendMode::Hue => "Hue",
            BlendMode::Saturation => "Saturation",
            BlendMode::Color => "Color",
            BlendMode::Luminosity => "Luminosity",
        }
    }

    /// Modes with no separable per-channel equation; blended by dedicated
    /// whole-pixel functions.
    pub fn is_custom(&self) -> bool {
        matches!(
            self,
            BlendMode::Hue | BlendMode::Saturation | BlendMode::Color | BlendMode::Luminosity
        )
    }

    /// OpenRaster `composite-op` attribute value.
    pub fn composite_op(&self) -> &'static str {
        match self {
            BlendMode::Normal => "svg:src-over",
            BlendMode::Multiply => "svg:multiply",
            BlendMode::Screen => "svg:screen",
            BlendMode::Overlay => "svg:overlay",
            BlendMode::Darken => "svg:darken",
            BlendMode::Lighten => "svg:lighten",
            BlendMode::ColorDodge => "svg:color-dodge",
            BlendMode::ColorBurn => "svg:color-burn",
            BlendMode::HardLight => "svg:hard-light",
            BlendMode::SoftLight => "svg:soft-light",
            BlendMode::Difference => "svg:difference",
            BlendMode::Exclusion => "svg:exclusion",
            BlendMode::Additive => "svg:plus",
            BlendMode::Subtract => "stackpaint:subtract",
            BlendMode::Divide => "stackpaint:divide",
            BlendMode::LinearBurn => "stackpaint:linear-burn",
            BlendMode::LinearLight => "stackpaint:linear-light",
            BlendMode::VividLight => "stackpaint:vivid-light",
            BlendMode::PinLight => "stackpaint:pin-light",
            BlendMode::HardMix => "stackpaint:hard-mix",
            BlendMode::Hue => "svg:hue",
            BlendMode::Saturation => "svg:saturation",
            BlendMode::Color => "svg:color",
            BlendMode::Luminosity => "svg:luminosity",
        }
    }

    /// Parse a `composite-op` value (unknown values fall back to Normal).
    pub fn from_composite_op(op: &str) -> Self {
        match Self::all().iter().find(|m| m.composite_op() == op) {
            Some(mode) => *mode,
            None => {
                log_warn!("Unknown composite op '{}', using Normal", op);
                BlendMode::Normal
            }
        }
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        Self::all().iter().position(|m| m == self).unwrap_or(0) as u8
    }

    /// Reconstruct from a u8 (defaults to Normal for unknown values)
    pub fn from_u8(v: u8) -> Self {
        Self::all().get(v as usize).copied().unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

/// Float channel (0..=255 scale) to u8.  Truncates, with a small bias so
/// values a float ulp below an integer land on it.
#[inline]
pub fn to_u8(v: f32) -> u8 {
    (v + 1e-3).clamp(0.0, 255.0) as u8
}

#[inline]
pub fn premultiply(px: [u8; 4]) -> Premul {
    let a = px[3] as u32;
    if a == 255 {
        return px;
    }
    if a == 0 {
        return TRANSPARENT;
    }
    let m = |c: u8| ((c as u32 * a + 127) / 255) as u8;
    [m(px[0]), m(px[1]), m(px[2]), px[3]]
}

#[inline]
pub fn unpremultiply(px: Premul) -> [u8; 4] {
    let a = px[3] as u32;
    if a == 255 {
        return px;
    }
    if a == 0 {
        return TRANSPARENT;
    }
    let u = |c: u8| ((c as u32 * 255 + a / 2) / a).min(255) as u8;
    [u(px[0]), u(px[1]), u(px[2]), px[3]]
}

/// Scale every channel of a premultiplied pixel by `f` in `[0, 1]`.
#[inline]
pub fn scale_pixel(px: Premul, f: f32) -> Premul {
    if f >= 1.0 {
        return px;
    }
    if f <= 0.0 {
        return TRANSPARENT;
    }
    [
        to_u8(px[0] as f32 * f),
        to_u8(px[1] as f32 * f),
        to_u8(px[2] as f32 * f),
        to_u8(px[3] as f32 * f),
    ]
}

// ----------------------------------------------------------------------------
// Blending
// ----------------------------------------------------------------------------

/// Composite `top` over `base` with `mode` at `opacity`.  Both pixels are
/// premultiplied; so is the result.
pub fn blend_pixel(base: Premul, top: Premul, mode: BlendMode, opacity: f32) -> Premul {
    // Fast path: fully transparent top pixel, nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    // Fast path: Normal blend, full opacity, fully opaque top pixel: overwrite
    if mode == BlendMode::Normal && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);
    let sa = top[3] as f32 / 255.0 * opacity;
    let da = base[3] as f32 / 255.0;
    let s = [
        top[0] as f32 / 255.0 * opacity,
        top[1] as f32 / 255.0 * opacity,
        top[2] as f32 / 255.0 * opacity,
    ];
    let d = [base[0] as f32 / 255.0, base[1] as f32 / 255.0, base[2] as f32 / 255.0];
    let out_a = sa + da * (1.0 - sa);

    if mode == BlendMode::Normal || da <= 0.0 {
        // Backdrop is empty (or the mode is plain source-over): B(cb, cs) is irrelevant.
        return [
            to_u8((s[0] + d[0] * (1.0 - sa)) * 255.0),
            to_u8((s[1] + d[1] * (1.0 - sa)) * 255.0),
            to_u8((s[2] + d[2] * (1.0 - sa)) * 255.0),
            to_u8(out_a * 255.0),
        ];
    }

    // Straight colours for the blend function.
    let cs = [s[0] / sa, s[1] / sa, s[2] / sa].map(|c| c.clamp(0.0, 1.0));
    let cb = [d[0] / da, d[1] / da, d[2] / da].map(|c| c.clamp(0.0, 1.0));

    let mixed = if mode.is_custom() {
        blend_non_separable(cb, cs, mode)
    } else {
        [
            blend_channel(cb[0], cs[0], mode),
            blend_channel(cb[1], cs[1], mode),
            blend_channel(cb[2], cs[2], mode),
        ]
    };

    let mut out = [0u8; 4];
    for i in 0..3 {
        let c = s[i] * (1.0 - da) + d[i] * (1.0 - sa) + sa * da * mixed[i].clamp(0.0, 1.0);
        out[i] = to_u8(c * 255.0);
    }
    out[3] = to_u8(out_a * 255.0);
    out
}

/// Separable blend function `B(cb, cs)` on straight colour channels.
fn blend_channel(base: f32, top: f32, mode: BlendMode) -> f32 {
    match mode {
        BlendMode::Normal => top,
        BlendMode::Multiply => base * top,
        BlendMode::Screen => 1.0 - (1.0 - base) * (1.0 - top),
        BlendMode::Overlay => overlay_channel(base, top),
        BlendMode::Darken => base.min(top),
        BlendMode::Lighten => base.max(top),
        BlendMode::ColorDodge => color_dodge_channel(base, top),
        BlendMode::ColorBurn => color_burn_channel(base, top),
        BlendMode::HardLight => overlay_channel(top, base),
        BlendMode::SoftLight => soft_light_channel(base, top),
        BlendMode::Difference => (base - top).abs(),
        BlendMode::Exclusion => base + top - 2.0 * base * top,
        BlendMode::Additive => (base + top).min(1.0),
        BlendMode::Subtract => (base - top).max(0.0),
        BlendMode::Divide => divide_channel(base, top),
        BlendMode::LinearBurn => (base + top - 1.0).max(0.0),
        BlendMode::LinearLight => (base + 2.0 * top - 1.0).clamp(0.0, 1.0),
        BlendMode::VividLight => vivid_light_channel(base, top),
        BlendMode::PinLight => pin_light_channel(base, top),
        BlendMode::HardMix => {
            if base + top >= 1.0 { 1.0 } else { 0.0 }
        }
        BlendMode::Hue | BlendMode::Saturation | BlendMode::Color | BlendMode::Luminosity => {
            unreachable!("non-separable modes are blended per pixel")
        }
    }
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if base >= 1.0 {
        1.0
    } else if top <= 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if base <= 0.0 {
        0.0
    } else if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

fn divide_channel(base: f32, top: f32) -> f32 {
    if top <= 0.0 { 1.0 } else { (base / top).min(1.0) }
}

fn vivid_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        color_burn_channel(base, 2.0 * top)
    } else {
        color_dodge_channel(base, 2.0 * (top - 0.5))
    }
}

fn pin_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base.min(2.0 * top)
    } else {
        base.max(2.0 * (top - 0.5))
    }
}

// ----------------------------------------------------------------------------
// Non-separable modes (W3C compositing spec, section 10)
// ----------------------------------------------------------------------------

fn blend_non_separable(cb: [f32; 3], cs: [f32; 3], mode: BlendMode) -> [f32; 3] {
    match mode {
        BlendMode::Hue => set_lum(set_sat(cs, sat(cb)), lum(cb)),
        BlendMode::Saturation => set_lum(set_sat(cb, sat(cs)), lum(cb)),
        BlendMode::Color => set_lum(cs, lum(cb)),
        BlendMode::Luminosity => set_lum(cb, lum(cs)),
        _ => unreachable!("separable mode routed to the non-separable path"),
    }
}

fn lum(c: [f32; 3]) -> f32 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

fn clip_color(c: [f32; 3]) -> [f32; 3] {
    let l = lum(c);
    let n = c[0].min(c[1]).min(c[2]);
    let x = c[0].max(c[1]).max(c[2]);
    let mut out = c;
    if n < 0.0 && (l - n).abs() > f32::EPSILON {
        out = out.map(|v| l + (v - l) * l / (l - n));
    }
    if x > 1.0 && (x - l).abs() > f32::EPSILON {
        out = out.map(|v| l + (v - l) * (1.0 - l) / (x - l));
    }
    out
}

fn set_lum(c: [f32; 3], l: f32) -> [f32; 3] {
    let d = l - lum(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

fn sat(c: [f32; 3]) -> f32 {
    c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])
}

fn set_sat(c: [f32; 3], s: f32) -> [f32; 3] {
    let max = c[0].max(c[1]).max(c[2]);
    let min = c[0].min(c[1]).min(c[2]);
    if max - min <= f32::EPSILON {
        return [0.0; 3];
    }
    c.map(|v| (v - min) * s / (max - min))
}

// ----------------------------------------------------------------------------
// Porter-Duff utility operators used internally by the engine
// ----------------------------------------------------------------------------

/// Keep `base` only where `mask` (0..=255) is set.
#[inline]
pub fn destination_in(base: Premul, mask: u8) -> Premul {
    match mask {
        255 => base,
        0 => TRANSPARENT,
        m => scale_pixel(base, m as f32 / 255.0),
    }
}

/// Remove `amount` (0..=255) of coverage from `base` (eraser).
#[inline]
pub fn destination_out(base: Premul, amount: u8) -> Premul {
    match amount {
        0 => base,
        255 => TRANSPARENT,
        m => scale_pixel(base, 1.0 - m as f32 / 255.0),
    }
}

/// Paint `top` only where `base` already has coverage; alpha stays `base`'s.
#[inline]
pub fn source_atop(base: Premul, top: Premul) -> Premul {
    if base[3] == 0 || top[3] == 0 {
        return base;
    }
    let da = base[3] as f32 / 255.0;
    let sa = top[3] as f32 / 255.0;
    let mut out = [0u8; 4];
    for i in 0..3 {
        out[i] = to_u8(top[i] as f32 * da + base[i] as f32 * (1.0 - sa));
    }
    out[3] = base[3];
    out
}
