//! Integer geometry primitives used by the ROI transforms.
//!
//! All arithmetic is component-wise. A [`Roi`] is stored as top-left corner
//! plus size; its bottom-right corner is inclusive.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Rem, Sub, SubAssign};

/// Pixel coordinate or per-axis integer vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl Point {
    /// Point at `(x, y)`.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Same value on both axes.
    pub const fn splat(v: i32) -> Self {
        Self { x: v, y: v }
    }

    /// True at the origin.
    pub fn is_null(&self) -> bool {
        self.x == 0 && self.y == 0
    }

    /// Round each axis down to a multiple of `align`.
    pub fn align_floor(self, align: Point) -> Point {
        Point::new(
            self.x.div_euclid(align.x) * align.x,
            self.y.div_euclid(align.y) * align.y,
        )
    }

    /// Round each axis up to a multiple of `align`.
    pub fn align_ceil(self, align: Point) -> Point {
        Point::new(
            -((-self.x).div_euclid(align.x) * align.x),
            -((-self.y).div_euclid(align.y) * align.y),
        )
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}>", self.x, self.y)
    }
}

macro_rules! point_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for Point {
            type Output = Point;
            fn $method(self, rhs: Point) -> Point {
                Point::new(self.x $op rhs.x, self.y $op rhs.y)
            }
        }

        impl $trait<i32> for Point {
            type Output = Point;
            fn $method(self, rhs: i32) -> Point {
                Point::new(self.x $op rhs, self.y $op rhs)
            }
        }
    };
}

point_op!(Add, add, +);
point_op!(Sub, sub, -);
point_op!(Mul, mul, *);
point_op!(Div, div, /);
point_op!(Rem, rem, %);

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        *self = *self + rhs;
    }
}

impl SubAssign for Point {
    fn sub_assign(&mut self, rhs: Point) {
        *self = *self - rhs;
    }
}

impl From<Size> for Point {
    fn from(s: Size) -> Point {
        Point::new(s.w, s.h)
    }
}

impl From<Bin> for Point {
    fn from(b: Bin) -> Point {
        Point::new(b.x, b.y)
    }
}

impl From<Flip> for Point {
    fn from(f: Flip) -> Point {
        Point::new(i32::from(f.x), i32::from(f.y))
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    /// Width.
    pub w: i32,
    /// Height.
    pub h: i32,
}

impl Size {
    /// Size of `w` by `h`.
    pub const fn new(w: i32, h: i32) -> Self {
        Self { w, h }
    }

    /// True when either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Coordinates of a corner pixel.
    pub fn corner(&self, corner: Corner) -> Point {
        Point::new(
            if corner.right { self.w - 1 } else { 0 },
            if corner.bottom { self.h - 1 } else { 0 },
        )
    }

    /// Express `p` as the distance from `corner`, counted towards the
    /// opposite corner.
    pub fn corner_coords(&self, p: Point, corner: Corner) -> Point {
        (p - self.corner(corner)) * corner.dir()
    }
}

impl From<Point> for Size {
    fn from(p: Point) -> Size {
        Size::new(p.x, p.y)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

/// Binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bin {
    /// Horizontal factor.
    pub x: i32,
    /// Vertical factor.
    pub y: i32,
}

impl Bin {
    /// Binning of `x` by `y`.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Default for Bin {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Per-axis mirroring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flip {
    /// Mirror columns.
    pub x: bool,
    /// Mirror rows.
    pub y: bool,
}

impl Flip {
    /// Flip along the given axes.
    pub const fn new(x: bool, y: bool) -> Self {
        Self { x, y }
    }

    /// Corner that becomes the origin once this flip is applied.
    pub fn ref_corner(self) -> Corner {
        Corner {
            right: self.x,
            bottom: self.y,
        }
    }

    /// Compose two flips: mirroring twice cancels out.
    pub fn compose(self, other: Flip) -> Flip {
        Flip::new(self.x ^ other.x, self.y ^ other.y)
    }

    /// Axes flipped in both.
    pub fn and(self, other: Flip) -> Flip {
        Flip::new(self.x && other.x, self.y && other.y)
    }
}

/// One of the four sensor corners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Corner {
    /// Right column side.
    pub right: bool,
    /// Bottom row side.
    pub bottom: bool,
}

impl Corner {
    /// Origin corner.
    pub const TOP_LEFT: Corner = Corner {
        right: false,
        bottom: false,
    };

    /// Direction of increasing distance from this corner.
    pub fn dir(self) -> Point {
        Point::new(
            if self.right { -1 } else { 1 },
            if self.bottom { -1 } else { 1 },
        )
    }
}

/// Rectangular region of interest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Roi {
    top_left: Point,
    size: Size,
}

impl Roi {
    /// ROI at `top_left` spanning `size`.
    pub const fn new(top_left: Point, size: Size) -> Self {
        Self { top_left, size }
    }

    /// Region spanned by two opposite corners, in any order.
    pub fn from_corners(p1: Point, p2: Point) -> Self {
        let tl = Point::new(p1.x.min(p2.x), p1.y.min(p2.y));
        let br = Point::new(p1.x.max(p2.x), p1.y.max(p2.y));
        Self::new(tl, Size::from(br - tl + 1))
    }

    /// `x, y, width, height` shorthand.
    pub const fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self::new(Point::new(x, y), Size::new(w, h))
    }

    /// First pixel.
    pub fn top_left(&self) -> Point {
        self.top_left
    }

    /// Move the ROI, keeping its size.
    pub fn set_top_left(&mut self, top_left: Point) {
        self.top_left = top_left;
    }

    /// Width and height.
    pub fn size(&self) -> Size {
        self.size
    }

    /// Last pixel, inclusive.
    pub fn bottom_right(&self) -> Point {
        self.top_left + Point::from(self.size) - 1
    }

    /// A ROI with an empty size means "full frame".
    pub fn is_active(&self) -> bool {
        !self.size.is_empty()
    }

    /// The ROI in binned coordinates.
    pub fn binned(&self, bin: Bin) -> Roi {
        let b = Point::from(bin);
        Roi::new(self.top_left / b, Size::from(Point::from(self.size) / b))
    }

    /// The ROI in unbinned coordinates.
    pub fn unbinned(&self, bin: Bin) -> Roi {
        let b = Point::from(bin);
        Roi::new(self.top_left * b, Size::from(Point::from(self.size) * b))
    }

    /// Grow the region outwards so both corners sit on `align` boundaries.
    pub fn align_corners_to(&self, align: Point) -> Roi {
        let tl = self.top_left.align_floor(align);
        let br = (self.bottom_right() + 1).align_ceil(align);
        Roi::new(tl, Size::from(br - tl))
    }

    /// True when `p` lies inside.
    pub fn contains_point(&self, p: Point) -> bool {
        let br = self.bottom_right();
        p.x >= self.top_left.x && p.y >= self.top_left.y && p.x <= br.x && p.y <= br.y
    }

    /// True when `other` lies entirely inside.
    pub fn contains_roi(&self, other: &Roi) -> bool {
        self.contains_point(other.top_left()) && self.contains_point(other.bottom_right())
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}-{}>", self.top_left.x, self.top_left.y, self.size)
    }
}
