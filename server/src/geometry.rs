use shared::{Direction, VIEWPORT_SIZE};

/// A tile coordinate on a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: u8,
    pub y: u8,
}

impl Point {
    pub fn new(x: u8, y: u8) -> Self {
        Point { x, y }
    }

    /// Returns the neighbouring tile in `direction`, or `None` when the step
    /// would leave the `u8` coordinate space.
    pub fn step(&self, direction: Direction) -> Option<Point> {
        let (dx, dy) = direction.offset();
        let x = i16::from(self.x) + dx;
        let y = i16::from(self.y) + dy;
        Some(Point {
            x: u8::try_from(x).ok()?,
            y: u8::try_from(y).ok()?,
        })
    }

    /// Returns the tile offset by (dx, dy) if it is still addressable.
    pub fn offset(&self, dx: i16, dy: i16) -> Option<Point> {
        let x = u8::try_from(i16::from(self.x) + dx).ok()?;
        let y = u8::try_from(i16::from(self.y) + dy).ok()?;
        Some(Point { x, y })
    }

    /// Manhattan distance between two tiles.
    pub fn distance(&self, other: &Point) -> u32 {
        self.x.abs_diff(other.x) as u32 + self.y.abs_diff(other.y) as u32
    }
}

/// An axis-aligned rectangle of tiles. The origin may lie outside the map,
/// viewports near an edge do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
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

    /// Half-open containment: the right and bottom edges are outside.
    pub fn contains(&self, point: Point) -> bool {
        let (px, py) = (i32::from(point.x), i32::from(point.y));
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    /// AABB overlap test; rectangles that only touch along an edge do not
    /// intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.right() <= other.x
            || other.right() <= self.x
            || self.bottom() <= other.y
            || other.bottom() <= self.y)
    }

    /// Splits the rectangle into four quadrants (NW, NE, SW, SE). Odd sizes
    /// give the extra row/column to the east and south halves.
    pub fn quadrants(&self) -> [Rect; 4] {
        let half_w = self.width / 2;
        let half_h = self.height / 2;
        let mid_x = self.x + half_w;
        let mid_y = self.y + half_h;
        [
            Rect::new(self.x, self.y, half_w, half_h),
            Rect::new(mid_x, self.y, self.width - half_w, half_h),
            Rect::new(self.x, mid_y, half_w, self.height - half_h),
            Rect::new(mid_x, mid_y, self.width - half_w, self.height - half_h),
        ]
    }
}

/// The square of tiles at most `reach` away from `centre` on either axis.
/// Odd-sided, so `a` lies in the window of `b` exactly when `b` lies in the
/// window of `a`.
fn window(centre: Point, reach: i32) -> Rect {
    Rect::new(
        i32::from(centre.x) - reach,
        i32::from(centre.y) - reach,
        2 * reach + 1,
        2 * reach + 1,
    )
}

/// The standard area of interest centred on `point`.
pub fn viewport(point: Point) -> Rect {
    window(point, VIEWPORT_SIZE / 2)
}

/// Twice the standard viewport, used for shouting.
pub fn shout_viewport(point: Point) -> Rect {
    window(point, VIEWPORT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_stays_in_coordinate_space() {
        let origin = Point::new(0, 0);
        assert_eq!(origin.step(Direction::Up), None);
        assert_eq!(origin.step(Direction::Left), None);
        assert_eq!(origin.step(Direction::Right), Some(Point::new(1, 0)));
        assert_eq!(origin.step(Direction::Down), Some(Point::new(0, 1)));
        assert_eq!(Point::new(255, 3).step(Direction::Right), None);
    }

    #[test]
    fn test_offset_and_distance() {
        let p = Point::new(5, 5);
        assert_eq!(p.offset(-1, 0), Some(Point::new(4, 5)));
        assert_eq!(p.offset(0, -6), None);
        assert_eq!(p.distance(&Point::new(2, 9)), 7);
    }

    #[test]
    fn test_rect_contains_is_half_open() {
        let rect = Rect::new(0, 0, 2, 2);
        assert!(rect.contains(Point::new(0, 0)));
        assert!(rect.contains(Point::new(1, 1)));
        assert!(!rect.contains(Point::new(2, 1)));
        assert!(!rect.contains(Point::new(1, 2)));
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 10, 10);
        assert!(a.intersects(&Rect::new(5, 5, 10, 10)));
        assert!(a.intersects(&Rect::new(-5, -5, 6, 6)));
        // Touching edges only
        assert!(!a.intersects(&Rect::new(10, 0, 5, 5)));
        assert!(!a.intersects(&Rect::new(0, 10, 5, 5)));
    }

    #[test]
    fn test_quadrants_cover_odd_rect() {
        let rect = Rect::new(0, 0, 5, 3);
        let quads = rect.quadrants();
        let area: i32 = quads.iter().map(|q| q.width * q.height).sum();
        assert_eq!(area, 15);
        assert_eq!(quads[0], Rect::new(0, 0, 2, 1));
        assert_eq!(quads[3], Rect::new(2, 1, 3, 2));
    }

    #[test]
    fn test_viewport_is_centred() {
        let vp = viewport(Point::new(30, 30));
        assert_eq!(vp, Rect::new(18, 18, VIEWPORT_SIZE + 1, VIEWPORT_SIZE + 1));
        assert!(vp.contains(Point::new(30, 30)));
        assert!(vp.contains(Point::new(18, 18)));
        assert!(vp.contains(Point::new(42, 42)));
        assert!(!vp.contains(Point::new(43, 30)));
        assert!(!vp.contains(Point::new(17, 30)));

        let shout = shout_viewport(Point::new(30, 30));
        assert_eq!(shout.width, VIEWPORT_SIZE * 2 + 1);
        assert!(shout.contains(Point::new(54, 6)));
        assert!(!shout.contains(Point::new(55, 30)));
    }

    #[test]
    fn test_viewport_visibility_is_symmetric() {
        let centre = Point::new(30, 30);
        for x in 0..=60u8 {
            for y in [10u8, 18, 30, 42, 50] {
                let other = Point::new(x, y);
                assert_eq!(
                    viewport(centre).contains(other),
                    viewport(other).contains(centre),
                    "asymmetric at {:?}",
                    other
                );
                assert_eq!(
                    shout_viewport(centre).contains(other),
                    shout_viewport(other).contains(centre)
                );
            }
        }
    }

    #[test]
    fn test_viewport_near_edge_has_negative_origin() {
        let vp = viewport(Point::new(0, 0));
        assert_eq!(vp.x, -VIEWPORT_SIZE / 2);
        assert!(vp.contains(Point::new(0, 0)));
    }
}
