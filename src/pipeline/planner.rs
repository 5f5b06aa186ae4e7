use serde::{Deserialize, Serialize};

use crate::models::job::Role;

/// Horizontal tile limit for description images, in pixels.
pub const TILE_HEIGHT_LIMIT: u32 = 8192;

/// Tight/profile product crops scale the anchor region by this factor.
/// Upstream iterations drifted between 0.7 and 1.25; the most recent
/// value wins and this constant is the single knob.
pub const PROFILE_CROP_SCALE: f64 = 1.25;

/// Product regions smaller than this fraction of the image area (1/100)
/// are ignored when picking an anchor.
const MIN_REGION_AREA_DIVISOR: u64 = 100;

/// Axis-aligned region of interest in source pixel space, as reported
/// by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (u32, u32) {
        (self.left + self.width / 2, self.top + self.height / 2)
    }
}

/// A crop rectangle already clamped to image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// One distinct derived artifact from a single source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// 3:4 portrait crop anchored on the first detected region.
    Thumbnail,
    /// 1:1 crop sized to the shorter image dimension.
    Wide,
    /// 1:1 crop tightened around the anchor region.
    Tight,
    /// Full-width horizontal slice of a description image, 1-based.
    Tile { part: u32, total: u32 },
    /// Unmodified geometry, re-encoded only.
    Passthrough,
}

/// A planned crop. `rect: None` keeps the full image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub variant: Variant,
    pub rect: Option<CropRect>,
}

/// Compute the crop plans for one source image. A degenerate rectangle
/// (non-positive size, or fully outside the image) yields no plan for
/// that variant; the caller records a non-fatal skip.
pub fn plan_crops(width: u32, height: u32, role: Role, regions: &[Region]) -> Vec<CropPlan> {
    match role {
        Role::Thumbnail => thumbnail_plan(width, height, regions).into_iter().collect(),
        Role::Description => description_plans(width, height),
        Role::Product => product_plans(width, height, regions),
        Role::Watermark => vec![CropPlan {
            variant: Variant::Passthrough,
            rect: None,
        }],
    }
}

/// Clamp a requested rectangle into the image: truncate the size to the
/// image, then shift left/top backward until right ≤ width and
/// bottom ≤ height. The rectangle never grows. Rejected outright when
/// the request is degenerate or has no overlap with the image.
fn clamp(left: i64, top: i64, w: i64, h: i64, img_w: u32, img_h: u32) -> Option<CropRect> {
    if w <= 0 || h <= 0 || img_w == 0 || img_h == 0 {
        return None;
    }
    if left >= img_w as i64 || top >= img_h as i64 || left + w <= 0 || top + h <= 0 {
        return None;
    }

    let w = w.min(img_w as i64);
    let h = h.min(img_h as i64);
    let left = left.min(img_w as i64 - w).max(0);
    let top = top.min(img_h as i64 - h).max(0);

    Some(CropRect {
        left: left as u32,
        top: top as u32,
        width: w as u32,
        height: h as u32,
    })
}

/// Single 3:4 crop at full source height. With a region the crop is
/// centered horizontally on the first region's midpoint; without one it
/// sits at the horizontal center (truncating division).
fn thumbnail_plan(width: u32, height: u32, regions: &[Region]) -> Option<CropPlan> {
    let crop_width = (height as i64) * 3 / 4;
    let left = match regions.first() {
        Some(region) => region.center().0 as i64 - crop_width / 2,
        None => (width as i64 - crop_width) / 2,
    };

    clamp(left, 0, crop_width, height as i64, width, height).map(|rect| CropPlan {
        variant: Variant::Thumbnail,
        rect: Some(rect),
    })
}

/// No crop; tall images are split into sequential full-width tiles of
/// at most TILE_HEIGHT_LIMIT, the last sized to the remainder.
fn description_plans(width: u32, height: u32) -> Vec<CropPlan> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    if height <= TILE_HEIGHT_LIMIT {
        return vec![CropPlan {
            variant: Variant::Tile { part: 1, total: 1 },
            rect: None,
        }];
    }

    let total = height.div_ceil(TILE_HEIGHT_LIMIT);
    (0..total)
        .map(|i| {
            let top = i * TILE_HEIGHT_LIMIT;
            let tile_height = TILE_HEIGHT_LIMIT.min(height - top);
            CropPlan {
                variant: Variant::Tile {
                    part: i + 1,
                    total,
                },
                rect: Some(CropRect {
                    left: 0,
                    top,
                    width,
                    height: tile_height,
                }),
            }
        })
        .collect()
}

/// Two 1:1 variants sharing one anchor: the largest region of at least
/// 1% of the image area, else the horizontal midpoint at one-third
/// image height. The wide crop takes the shorter image dimension; the
/// tight crop scales the anchor region itself. Without a region the
/// tight crop falls back to the wide geometry.
fn product_plans(width: u32, height: u32, regions: &[Region]) -> Vec<CropPlan> {
    let min_area = (width as u64 * height as u64) / MIN_REGION_AREA_DIVISOR;
    let anchor_region = regions
        .iter()
        .filter(|r| r.area() >= min_area && r.area() > 0)
        .max_by_key(|r| r.area());

    let (cx, cy) = match anchor_region {
        Some(region) => region.center(),
        None => (width / 2, height / 3),
    };

    let side = width.min(height) as i64;
    let wide = clamp(
        cx as i64 - side / 2,
        cy as i64 - side / 2,
        side,
        side,
        width,
        height,
    );

    let tight = match anchor_region {
        Some(region) => {
            let tight_side =
                (region.width.max(region.height) as f64 * PROFILE_CROP_SCALE).round() as i64;
            clamp(
                cx as i64 - tight_side / 2,
                cy as i64 - tight_side / 2,
                tight_side,
                tight_side,
                width,
                height,
            )
        }
        None => wide,
    };

    let mut plans = Vec::new();
    if let Some(rect) = wide {
        plans.push(CropPlan {
            variant: Variant::Wide,
            rect: Some(rect),
        });
    }
    if let Some(rect) = tight {
        plans.push(CropPlan {
            variant: Variant::Tight,
            rect: Some(rect),
        });
    }
    plans
}
