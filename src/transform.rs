//! Affine transform algebra shared by layers, the renderer and the brush.
//!
//! A [`Transform`] maps a layer's local pixel space into its parent's space.
//! `a.then(b)` applies `a` first and `b` second.  Angles are in degrees with
//! the screen convention: the y axis points down, so a positive angle turns
//! clockwise on screen.

use kurbo::{Affine, Point, Rect, Vec2};

use crate::geometry::PixelRect;

const SINGULAR_EPSILON: f64 = 1e-10;
const COMPARE_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform(Affine);

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Transform split into offset, per-axis scale and rotation about an origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decomposed {
    pub x_offset: f64,
    pub y_offset: f64,
    pub x_scale: f64,
    pub y_scale: f64,
    /// Degrees in `[0, 360)`.
    pub angle: f64,
}

impl Transform {
    pub const IDENTITY: Transform = Transform(Affine::IDENTITY);

    pub fn from_affine(affine: Affine) -> Self {
        Self(affine)
    }

    /// `None` if the matrix is singular (or not finite).
    pub fn new_checked(affine: Affine) -> Option<Self> {
        let t = Self(affine);
        t.is_invertible().then_some(t)
    }

    /// Coefficients `[a, b, c, d, e, f]`: `x' = a·x + c·y + e`, `y' = b·x + d·y + f`.
    pub fn from_coeffs(c: [f64; 6]) -> Self {
        Self(Affine::new(c))
    }

    pub fn coeffs(&self) -> [f64; 6] {
        self.0.as_coeffs()
    }

    pub fn affine(&self) -> Affine {
        self.0
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self(Affine::translate((dx, dy)))
    }

    pub fn scale(sx: f64, sy: f64) -> Self {
        Self(Affine::scale_non_uniform(sx, sy))
    }

    pub fn rotation_degrees(angle: f64) -> Self {
        Self(Affine::rotate(angle.to_radians()))
    }

    /// Apply `self`, then `next`.
    pub fn then(&self, next: &Transform) -> Transform {
        Transform(next.0 * self.0)
    }

    pub fn determinant(&self) -> f64 {
        self.0.determinant()
    }

    pub fn is_invertible(&self) -> bool {
        let det = self.determinant();
        det.is_finite() && det.abs() > SINGULAR_EPSILON && self.coeffs().iter().all(|c| c.is_finite())
    }

    /// Inverse transform.
    ///
    /// # Panics
    /// If the matrix is singular.
    pub fn inverse(&self) -> Transform {
        assert!(
            self.is_invertible(),
            "attempted to invert a singular transform {:?}",
            self.coeffs()
        );
        Transform(self.0.inverse())
    }

    pub fn try_inverse(&self) -> Option<Transform> {
        self.is_invertible().then(|| Transform(self.0.inverse()))
    }

    pub fn offset(&self) -> Vec2 {
        self.0.translation()
    }

    pub fn is_identity(&self) -> bool {
        self.approx_eq(&Self::IDENTITY)
    }

    pub fn is_translation_only(&self) -> bool {
        let [a, b, c, d, _, _] = self.coeffs();
        (a - 1.0).abs() < COMPARE_EPSILON
            && b.abs() < COMPARE_EPSILON
            && c.abs() < COMPARE_EPSILON
            && (d - 1.0).abs() < COMPARE_EPSILON
    }

    /// Whole-pixel translation, if that is all this transform does.
    pub fn integer_translation(&self) -> Option<(i32, i32)> {
        if !self.is_translation_only() {
            return None;
        }
        let v = self.offset();
        let (rx, ry) = (v.x.round(), v.y.round());
        ((v.x - rx).abs() < 1e-6 && (v.y - ry).abs() < 1e-6).then_some((rx as i32, ry as i32))
    }

    pub fn approx_eq(&self, other: &Transform) -> bool {
        self.approx_eq_within(other, 1e-6)
    }

    pub fn approx_eq_within(&self, other: &Transform, tolerance: f64) -> bool {
        self.coeffs()
            .iter()
            .zip(other.coeffs().iter())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    pub fn map_point(&self, p: Point) -> Point {
        self.0 * p
    }

    /// Maps all four corners and returns their axis-aligned bounding box.
    pub fn map_rect(&self, r: Rect) -> Rect {
        self.0.transform_rect_bbox(r)
    }

    pub fn map_pixel_rect(&self, r: PixelRect) -> PixelRect {
        if r.is_empty() {
            return PixelRect::EMPTY;
        }
        PixelRect::bounding(self.map_rect(r.to_kurbo()))
    }

    /// Square root of the absolute determinant: how much a length grows.
    pub fn linear_scale(&self) -> f64 {
        self.determinant().abs().sqrt()
    }

    /// Split into offset/scale/rotation about `origin`, canonicalised so both
    /// scale factors are never negative together, and a mirrored transform
    /// reports an angle below 180°.
    pub fn decompose(&self, origin: Point) -> Decomposed {
        let [a, b, c, d, e, f] = self.coeffs();
        let det = a * d - b * c;
        let mut x_scale = a.hypot(b);
        let mut y_scale = if x_scale > 0.0 { det / x_scale } else { d.hypot(c) };
        let mut angle = normalize_degrees(b.atan2(a).to_degrees());

        // The tolerance keeps angles that land a hair under 180° from
        // flipping on alternate round trips.
        if y_scale < 0.0 && angle >= 180.0 - 1e-9 {
            x_scale = -x_scale;
            y_scale = -y_scale;
            angle = normalize_degrees(angle - 180.0);
        }

        // offset = translation + M·origin − origin
        let x_offset = e + a * origin.x + c * origin.y - origin.x;
        let y_offset = f + b * origin.x + d * origin.y - origin.y;
        Decomposed { x_offset, y_offset, x_scale, y_scale, angle }
    }

    /// Inverse of [`Transform::decompose`]: scale, then rotate about `origin`,
    /// then shift by the offset.
    pub fn recompose(parts: &Decomposed, origin: Point) -> Transform {
        let o = origin.to_vec2();
        let shift = Vec2::new(parts.x_offset, parts.y_offset);
        Transform(
            Affine::translate(o + shift)
                * Affine::rotate(parts.angle.to_radians())
                * Affine::scale_non_uniform(parts.x_scale, parts.y_scale)
                * Affine::translate(-o),
        )
    }
}

impl Decomposed {
    pub fn approx_eq(&self, other: &Decomposed, tolerance: f64) -> bool {
        let angle_diff = (self.angle - other.angle).rem_euclid(360.0);
        (self.x_offset - other.x_offset).abs() <= tolerance
            && (self.y_offset - other.y_offset).abs() <= tolerance
            && (self.x_scale - other.x_scale).abs() <= tolerance
            && (self.y_scale - other.y_scale).abs() <= tolerance
            && (angle_diff <= tolerance || 360.0 - angle_diff <= tolerance)
    }
}

fn normalize_degrees(angle: f64) -> f64 {
    let a = angle.rem_euclid(360.0);
    if (360.0 - a).abs() < 1e-9 { 0.0 } else { a }
}
