use std::fmt;

/// An integer rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl TrackedRegion {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The geometric centre pixel, `(x + width / 2, y + height / 2)`.
    /// Widened so a region near the edge of the `i32` range cannot overflow.
    pub fn center(&self) -> (i64, i64) {
        (
            self.x as i64 + (self.width / 2) as i64,
            self.y as i64 + (self.height / 2) as i64,
        )
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..*self
        }
    }

    /// Whether the whole rectangle lies inside a `frame_width` x `frame_height` frame.
    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.x as i64 + self.width as i64 <= frame_width as i64
            && self.y as i64 + self.height as i64 <= frame_height as i64
    }

    /// Moves the rectangle the least distance needed to fit inside the frame.
    /// Returns `None` when the rectangle is larger than the frame.
    pub fn clamp_within(&self, frame_width: u32, frame_height: u32) -> Option<Self> {
        if self.width > frame_width || self.height > frame_height {
            return None;
        }
        let max_x = (frame_width - self.width) as i32;
        let max_y = (frame_height - self.height) as i32;
        Some(Self {
            x: self.x.clamp(0, max_x),
            y: self.y.clamp(0, max_y),
            ..*self
        })
    }
}

impl fmt::Display for TrackedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_uses_integer_halves() {
        let region = TrackedRegion::new(214, 367, 86, 58);
        assert_eq!(region.center(), (257, 396));
    }

    #[test]
    fn center_of_far_region_does_not_wrap() {
        let region = TrackedRegion::new(i32::MAX - 2, i32::MIN, 16, 16);
        assert_eq!(
            region.center(),
            (i32::MAX as i64 + 6, i32::MIN as i64 + 8)
        );
        assert_eq!(region.translate(5, -5), TrackedRegion::new(i32::MAX, i32::MIN, 16, 16));
    }

    #[test]
    fn clamp_pulls_region_back_inside() {
        let region = TrackedRegion::new(-3, 95, 16, 16);
        let clamped = region.clamp_within(100, 100).unwrap();
        assert_eq!(clamped, TrackedRegion::new(0, 84, 16, 16));
        assert!(clamped.fits_within(100, 100));
        assert!(!region.fits_within(100, 100));
    }

    #[test]
    fn oversized_region_cannot_be_clamped() {
        let region = TrackedRegion::new(0, 0, 120, 16);
        assert_eq!(region.clamp_within(100, 100), None);
    }
}
