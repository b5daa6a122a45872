//! Web Mercator tile coordinates and viewport coverage.

use crate::{BoundingBox, TileError, TileResult};
use serde::{Deserialize, Serialize};

/// Half the width of the Web Mercator square, in meters.
pub const MERCATOR_MAX_EXTENT: f64 = 20037508.342789244;

/// Latitude limit of the Web Mercator square.
pub const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

/// A tile coordinate (z/x/y).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zoom level
    pub z: u32,
    /// Column (x)
    pub x: u32,
    /// Row (y)
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles along one axis at this zoom.
    pub fn matrix_size(&self) -> u64 {
        1u64 << self.z.min(63)
    }

    /// True when 0 <= x,y < 2^z.
    pub fn is_valid(&self) -> bool {
        self.z < 32 && (self.x as u64) < self.matrix_size() && (self.y as u64) < self.matrix_size()
    }

    pub fn validate(&self) -> TileResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(TileError::InvalidTile {
                z: self.z,
                x: self.x,
                y: self.y,
            })
        }
    }

    /// EPSG:3857 bounds of this tile in meters.
    pub fn mercator_bounds(&self) -> BoundingBox {
        let n = self.matrix_size() as f64;
        let span = 2.0 * MERCATOR_MAX_EXTENT / n;

        let min_x = -MERCATOR_MAX_EXTENT + self.x as f64 * span;
        let max_y = MERCATOR_MAX_EXTENT - self.y as f64 * span;

        BoundingBox::new(min_x, max_y - span, min_x + span, max_y)
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Convert lat/lon to the Web Mercator tile containing it.
///
/// Inputs outside the projectable range are clamped onto the edge tiles.
pub fn latlon_to_tile(lat: f64, lon: f64, zoom: u32) -> TileCoord {
    let n = (1u64 << zoom) as f64;
    let max_index = (1u64 << zoom) - 1;

    let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
    let lon = lon.clamp(-180.0, 180.0);

    let x = ((lon + 180.0) / 360.0 * n).floor().max(0.0) as u64;
    let lat_rad = lat.to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / std::f64::consts::PI) / 2.0 * n)
        .floor()
        .max(0.0) as u64;

    TileCoord {
        z: zoom,
        x: x.min(max_index) as u32,
        y: y.min(max_index) as u32,
    }
}

/// The area of the map currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Geographic extent in lon/lat degrees
    pub bounds: BoundingBox,
    /// Requested zoom level
    pub zoom: u32,
}

impl Viewport {
    pub fn new(bounds: BoundingBox, zoom: u32) -> Self {
        Self { bounds, zoom }
    }

    /// Tiles covering this viewport, with the zoom clamped to `max_zoom`.
    ///
    /// Tiles are ordered row-major from the north-west corner.
    pub fn tiles(&self, max_zoom: u32) -> Vec<TileCoord> {
        let zoom = self.zoom.min(max_zoom).min(30);

        let top_left = latlon_to_tile(self.bounds.max_y, self.bounds.min_x, zoom);
        let bottom_right = latlon_to_tile(self.bounds.min_y, self.bounds.max_x, zoom);

        let mut tiles = Vec::new();
        for y in top_left.y..=bottom_right.y {
            for x in top_left.x..=bottom_right.x {
                tiles.push(TileCoord::new(zoom, x, y));
            }
        }
        tiles
    }
}
