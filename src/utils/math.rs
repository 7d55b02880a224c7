use glam::{Mat4, Vec2, Vec3, Vec4};

/// Axis-aligned box in world space, used for block and zone culling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AABox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for AABox {
    fn default() -> Self {
        Self::empty()
    }
}

impl AABox {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// An inverted box that any `extend` call will overwrite
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut aabox = Self::empty();
        for p in points {
            aabox.extend(p);
        }
        aabox
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn extend(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(&self, other: &AABox) -> AABox {
        AABox {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

/// Result of testing a box against a frustum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Inside,
    Outside,
    Intersecting,
}

/// Plane in the form `normal . p + d = 0`, positive half-space is "inside"
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    pub fn from_vec4(v: Vec4) -> Self {
        let normal = v.truncate();
        let len = normal.length();
        if len > f32::EPSILON {
            Self { normal: normal / len, d: v.w / len }
        } else {
            Self { normal, d: v.w }
        }
    }

    pub fn distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// View frustum built from a view-projection matrix (wgpu clip space, depth 0..1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn from_view_projection(m: Mat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        Self {
            planes: [
                Plane::from_vec4(r3 + r0), // left
                Plane::from_vec4(r3 - r0), // right
                Plane::from_vec4(r3 + r1), // bottom
                Plane::from_vec4(r3 - r1), // top
                Plane::from_vec4(r2),      // near
                Plane::from_vec4(r3 - r2), // far
            ],
        }
    }

    pub fn is_box_inside(&self, aabox: &AABox) -> Containment {
        let mut result = Containment::Inside;
        for plane in &self.planes {
            // Farthest corner along the plane normal, and the nearest one
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabox.max, aabox.min);
            let negative = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabox.min, aabox.max);
            if plane.distance(positive) < 0.0 {
                return Containment::Outside;
            }
            if plane.distance(negative) < 0.0 {
                result = Containment::Intersecting;
            }
        }
        result
    }
}

/// Scale of a single lattice coordinate: its lowest set bit, or `size` for 0
pub fn coordinate_scale(n: u32, size: u32) -> u32 {
    if n == 0 {
        size
    } else {
        (n & n.wrapping_neg()).min(size)
    }
}

/// Scale of a lattice point, the coarsest quad size at which it is a corner
pub fn point_scale(x: u32, y: u32, size: u32) -> u32 {
    coordinate_scale(x, size).min(coordinate_scale(y, size))
}

/// Does the axis-aligned square `[min, max]` touch the circle?
pub fn square_intersects_circle(min: Vec2, max: Vec2, center: Vec2, radius: f32) -> bool {
    let closest = center.clamp(min, max);
    closest.distance_squared(center) <= radius * radius
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_scale() {
        assert_eq!(coordinate_scale(0, 8), 8);
        assert_eq!(coordinate_scale(8, 8), 8);
        assert_eq!(coordinate_scale(4, 8), 4);
        assert_eq!(coordinate_scale(6, 8), 2);
        assert_eq!(coordinate_scale(7, 8), 1);
        assert_eq!(point_scale(4, 0, 8), 4);
        assert_eq!(point_scale(4, 2, 8), 2);
    }

    #[test]
    fn test_square_circle_intersection() {
        let min = Vec2::new(0.0, 0.0);
        let max = Vec2::new(10.0, 10.0);
        assert!(square_intersects_circle(min, max, Vec2::new(5.0, 5.0), 1.0));
        assert!(square_intersects_circle(min, max, Vec2::new(12.0, 5.0), 2.5));
        assert!(!square_intersects_circle(min, max, Vec2::new(20.0, 20.0), 5.0));
    }

    #[test]
    fn test_frustum_containment() {
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y);
        let frustum = Frustum::from_view_projection(proj * view);

        let ahead = AABox::new(Vec3::new(-1.0, -1.0, -11.0), Vec3::new(1.0, 1.0, -9.0));
        assert_eq!(frustum.is_box_inside(&ahead), Containment::Inside);

        let behind = AABox::new(Vec3::new(-1.0, -1.0, 9.0), Vec3::new(1.0, 1.0, 11.0));
        assert_eq!(frustum.is_box_inside(&behind), Containment::Outside);

        let straddling = AABox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(frustum.is_box_inside(&straddling), Containment::Intersecting);
    }

    #[test]
    fn test_aabox_extend() {
        let mut b = AABox::empty();
        assert!(b.is_empty());
        b.extend(Vec3::new(1.0, 2.0, 3.0));
        b.extend(Vec3::new(-1.0, 0.0, 5.0));
        assert!(!b.is_empty());
        assert_eq!(b.min, Vec3::new(-1.0, 0.0, 3.0));
        assert_eq!(b.center(), Vec3::new(0.0, 1.0, 4.0));
    }
}
