/// Pixel-space box, `x2`/`y2` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Clip the box to an image of `width` x `height`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.min(width),
            y1: self.y1.min(height),
            x2: self.x2.min(width),
            y2: self.y2.min(height),
        }
    }
}

/// One labelled region reported by a detector backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Class name, used as the crop file prefix (e.g. "person", "pistol").
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}
