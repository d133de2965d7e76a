use kurbo::Rect;
use serde::{Deserialize, Serialize};

/// Integer pixel rectangle (`x`, `y` inclusive; `right`, `bottom` exclusive).
/// Any rect with a non-positive side is empty and compares equal to
/// [`PixelRect::EMPTY`] after normalisation by the set operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub const EMPTY: PixelRect = PixelRect { x: 0, y: 0, width: 0, height: 0 };

    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        if x1 <= x0 || y1 <= y0 {
            return Self::EMPTY;
        }
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Smallest pixel rect covering `r`.
    pub fn bounding(r: Rect) -> Self {
        if !(r.width() > 0.0 && r.height() > 0.0) {
            return Self::EMPTY;
        }
        // Snap values within rounding noise of an integer so exact translations stay exact.
        let snap = |v: f64| {
            let n = v.round();
            if (v - n).abs() < 1e-6 { n } else { v }
        };
        Self::from_corners(
            snap(r.x0).floor() as i32,
            snap(r.y0).floor() as i32,
            snap(r.x1).ceil() as i32,
            snap(r.y1).ceil() as i32,
        )
    }

    pub fn to_kurbo(&self) -> Rect {
        Rect::new(
            self.x as f64,
            self.y as f64,
            self.right() as f64,
            self.bottom() as f64,
        )
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() { 0 } else { self.width as u64 * self.height as u64 }
    }

    pub fn intersect(&self, other: &PixelRect) -> PixelRect {
        Self::from_corners(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        )
    }

    pub fn union(&self, other: &PixelRect) -> PixelRect {
        if self.is_empty() {
            return if other.is_empty() { Self::EMPTY } else { *other };
        }
        if other.is_empty() {
            return *self;
        }
        Self::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    pub fn contains_rect(&self, other: &PixelRect) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    pub fn translated(&self, dx: i32, dy: i32) -> PixelRect {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn expanded(&self, n: i32) -> PixelRect {
        if self.is_empty() {
            return Self::EMPTY;
        }
        Self::from_corners(self.x - n, self.y - n, self.right() + n, self.bottom() + n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_ignores_empty() {
        let a = PixelRect::new(5, 5, 10, 10);
        assert_eq!(a.union(&PixelRect::EMPTY), a);
        assert_eq!(PixelRect::EMPTY.union(&a), a);
        assert_eq!(a.union(&PixelRect::new(0, 0, 1, 1)), PixelRect::new(0, 0, 15, 15));
    }

    #[test]
    fn disjoint_intersection_is_empty() {
        let a = PixelRect::new(0, 0, 4, 4);
        let b = PixelRect::new(10, 10, 4, 4);
        assert!(a.intersect(&b).is_empty());
        assert_eq!(a.intersect(&PixelRect::new(2, 2, 4, 4)), PixelRect::new(2, 2, 2, 2));
    }

    #[test]
    fn bounding_snaps_integral_edges() {
        let r = Rect::new(15.0000000001, 14.9999999999, 25.0, 25.0);
        assert_eq!(PixelRect::bounding(r), PixelRect::new(15, 15, 10, 10));
        let r = Rect::new(0.5, 0.5, 1.5, 1.5);
        assert_eq!(PixelRect::bounding(r), PixelRect::new(0, 0, 2, 2));
    }
}
