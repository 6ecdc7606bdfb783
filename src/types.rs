//! Geometric value types: points, bounding regions, and octant
//! directions.

use serde::{Deserialize, Serialize};

/// A point in index space. 2D structures leave `z` at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Point3 {
        Point3 { x, y, z }
    }

    /// A 2D point with `z` pinned to zero.
    pub fn flat(x: f64, y: f64) -> Point3 {
        Point3 { x, y, z: 0.0 }
    }
}

/// An axis-aligned bounding region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Point3,
    pub max: Point3,
}

impl Bounds {
    pub fn new(min: Point3, max: Point3) -> Bounds {
        Bounds { min, max }
    }

    /// The center of the region.
    pub fn mid(&self) -> Point3 {
        Point3 {
            x: (self.min.x + self.max.x) / 2.0,
            y: (self.min.y + self.max.y) / 2.0,
            z: (self.min.z + self.max.z) / 2.0,
        }
    }

    /// Inclusive containment on every face. Cell membership during
    /// descent is decided by [`Dir::from_point`], not by this predicate.
    pub fn contains(&self, p: &Point3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Shrink to the child region in the given direction. In tubular
    /// mode the z axis is left alone; the vertical component of the
    /// direction advances the tick instead.
    pub fn go(&self, dir: Dir, tubular: bool) -> Bounds {
        let mid = self.mid();
        let mut next = *self;

        if dir.east() {
            next.min.x = mid.x;
        } else {
            next.max.x = mid.x;
        }

        if dir.north() {
            next.min.y = mid.y;
        } else {
            next.max.y = mid.y;
        }

        if !tubular {
            if dir.up() {
                next.min.z = mid.z;
            } else {
                next.max.z = mid.z;
            }
        }

        next
    }

    /// Expand to a cube centered on the current midpoint, sized by the
    /// longest axis.
    pub fn cubeify(&self) -> Bounds {
        let mid = self.mid();
        let half = (self.max.x - self.min.x)
            .max(self.max.y - self.min.y)
            .max(self.max.z - self.min.z)
            / 2.0;

        Bounds {
            min: Point3::new(mid.x - half, mid.y - half, mid.z - half),
            max: Point3::new(mid.x + half, mid.y + half, mid.z + half),
        }
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }
}

/// A child direction: one of eight octants, or one of the four downward
/// quadrants when `dimensions == 2`.
///
/// The integral order packs east into bit 0, north into bit 1, and up
/// into bit 2, so the first four variants are exactly the quadrants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Dir {
    Swd = 0,
    Sed = 1,
    Nwd = 2,
    Ned = 3,
    Swu = 4,
    Seu = 5,
    Nwu = 6,
    Neu = 7,
}

impl Dir {
    const ALL: [Dir; 8] = [
        Dir::Swd,
        Dir::Sed,
        Dir::Nwd,
        Dir::Ned,
        Dir::Swu,
        Dir::Seu,
        Dir::Nwu,
        Dir::Neu,
    ];

    /// The directions meaningful for a structure with the given
    /// fan-out: four for quadtrees, eight for octrees.
    pub fn iter(factor: u64) -> impl Iterator<Item = Dir> {
        Self::ALL.into_iter().take(factor as usize)
    }

    /// Total order over directions.
    pub fn index(self) -> u64 {
        self as u64
    }

    pub fn from_index(index: u64) -> Option<Dir> {
        Self::ALL.get(index as usize).copied()
    }

    /// The direction of `p` relative to a cell midpoint. A coordinate
    /// strictly greater than the midpoint takes the high side, so
    /// points on the midline land low.
    pub fn from_point(p: &Point3, mid: &Point3) -> Dir {
        let mut index = 0;
        if p.x > mid.x {
            index |= 1;
        }
        if p.y > mid.y {
            index |= 2;
        }
        if p.z > mid.z {
            index |= 4;
        }
        Self::ALL[index]
    }

    pub fn east(self) -> bool {
        self.index() & 1 != 0
    }

    pub fn north(self) -> bool {
        self.index() & 2 != 0
    }

    pub fn up(self) -> bool {
        self.index() & 4 != 0
    }

    /// The quadrant component, with the vertical bit dropped.
    pub fn horizontal(self) -> u64 {
        self.index() & 3
    }

    /// The JSON key for this direction: two letters in 2D, three in 3D.
    pub fn token(self, dimensions: u32) -> &'static str {
        if dimensions == 2 {
            match self {
                Dir::Swd | Dir::Swu => "sw",
                Dir::Sed | Dir::Seu => "se",
                Dir::Nwd | Dir::Nwu => "nw",
                Dir::Ned | Dir::Neu => "ne",
            }
        } else {
            match self {
                Dir::Swd => "swd",
                Dir::Sed => "sed",
                Dir::Nwd => "nwd",
                Dir::Ned => "ned",
                Dir::Swu => "swu",
                Dir::Seu => "seu",
                Dir::Nwu => "nwu",
                Dir::Neu => "neu",
            }
        }
    }
}
