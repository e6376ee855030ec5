//! Grid view of every camera's latest frame.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};

use crate::frame::Frame;
use crate::stream::{StreamHandle, StreamState};

pub const TILE_WIDTH: u32 = 320;
pub const TILE_HEIGHT: u32 = 240;

const FAILED_RGB: Rgb<u8> = Rgb([96, 0, 0]);
const WAITING_RGB: Rgb<u8> = Rgb([48, 48, 48]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_INK: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_SCALE: u32 = 2;
const LABEL_PAD: u32 = 2;

/// `(columns, rows)` for `n` tiles: `ceil(sqrt(n))` columns.
pub fn grid_dimensions(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let mut cols = (n as f64).sqrt().ceil() as usize;
    // Guard against float rounding around perfect squares.
    while cols * cols < n {
        cols += 1;
    }
    while cols > 1 && (cols - 1) * (cols - 1) >= n {
        cols -= 1;
    }
    (cols, n.div_ceil(cols))
}

/// Write `image` to `path` via a sibling temp file so readers never see a
/// partial image. The format follows the extension (`.png`, `.ppm`, `.jpg`).
pub fn save_mosaic(image: &RgbImage, path: &Path) -> Result<()> {
    ImageFormat::from_path(path)
        .with_context(|| format!("unsupported mosaic format for {}", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let tmp = path.with_extension(format!("tmp.{ext}"));
    image
        .save(&tmp)
        .with_context(|| format!("encode {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Nearest-neighbour scale of an RGB frame to a `width` x `height` tile.
/// `None` if the frame buffer does not hold packed RGB.
fn scaled_tile(frame: &Frame, width: u32, height: u32) -> Option<RgbImage> {
    let source = frame.to_rgb_image()?;
    Some(imageops::resize(&source, width, height, FilterType::Nearest))
}

/// 3x5 glyph rows, most significant of the low three bits on the left.
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [2, 5, 7, 5, 5],
        'B' => [6, 5, 6, 5, 6],
        'C' => [3, 4, 4, 4, 3],
        'D' => [6, 5, 5, 5, 6],
        'E' => [7, 4, 6, 4, 7],
        'F' => [7, 4, 6, 4, 4],
        'G' => [3, 4, 5, 5, 3],
        'H' => [5, 5, 7, 5, 5],
        'I' => [7, 2, 2, 2, 7],
        'J' => [1, 1, 1, 5, 2],
        'K' => [5, 5, 6, 5, 5],
        'L' => [4, 4, 4, 4, 7],
        'M' => [5, 7, 7, 5, 5],
        'N' => [6, 5, 5, 5, 5],
        'O' => [2, 5, 5, 5, 2],
        'P' => [6, 5, 6, 4, 4],
        'Q' => [2, 5, 5, 6, 3],
        'R' => [6, 5, 6, 5, 5],
        'S' => [3, 4, 2, 1, 6],
        'T' => [7, 2, 2, 2, 2],
        'U' => [5, 5, 5, 5, 7],
        'V' => [5, 5, 5, 5, 2],
        'W' => [5, 5, 7, 7, 5],
        'X' => [5, 5, 2, 5, 5],
        'Y' => [5, 5, 2, 2, 2],
        'Z' => [7, 1, 2, 4, 7],
        '0' => [7, 5, 5, 5, 7],
        '1' => [2, 6, 2, 2, 7],
        '2' => [6, 1, 2, 4, 7],
        '3' => [6, 1, 2, 1, 6],
        '4' => [5, 5, 7, 1, 1],
        '5' => [7, 4, 6, 1, 6],
        '6' => [3, 4, 7, 5, 7],
        '7' => [7, 1, 2, 2, 2],
        '8' => [7, 5, 7, 5, 7],
        '9' => [7, 5, 7, 1, 6],
        '-' => [0, 0, 7, 0, 0],
        '_' => [0, 0, 0, 0, 7],
        '.' => [0, 0, 0, 0, 2],
        ':' => [0, 2, 0, 2, 0],
        ' ' => [0; 5],
        _ => [6, 1, 2, 0, 2],
    }
}

fn fill_rect(tile: &mut RgbImage, x0: u32, y0: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x1 = x0.saturating_add(w).min(tile.width());
    let y1 = y0.saturating_add(h).min(tile.height());
    for y in y0..y1 {
        for x in x0..x1 {
            tile.put_pixel(x, y, color);
        }
    }
}

/// Camera name in the top-left corner, white on a black strip, clipped to the tile.
fn draw_label(tile: &mut RgbImage, text: &str) {
    let advance = 4 * LABEL_SCALE;
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return;
    }
    let strip_w = (2 * LABEL_PAD + chars.saturating_mul(advance)).saturating_sub(LABEL_SCALE);
    let strip_h = 2 * LABEL_PAD + 5 * LABEL_SCALE;
    fill_rect(tile, 0, 0, strip_w, strip_h, LABEL_BACKGROUND);

    for (i, c) in text.chars().enumerate() {
        let ox = LABEL_PAD + i as u32 * advance;
        if ox >= tile.width() {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3u32 {
                if bits & (4 >> col) != 0 {
                    let x = ox + col * LABEL_SCALE;
                    let y = LABEL_PAD + row as u32 * LABEL_SCALE;
                    fill_rect(tile, x, y, LABEL_SCALE, LABEL_SCALE, LABEL_INK);
                }
            }
        }
    }
}

/// Composes tiles from stream preview slots, remembering each camera's last frame.
pub struct Mosaic {
    tile_width: u32,
    tile_height: u32,
    latest: HashMap<String, Frame>,
}

impl Default for Mosaic {
    fn default() -> Self {
        Self::new(TILE_WIDTH, TILE_HEIGHT)
    }
}

impl Mosaic {
    pub fn new(tile_width: u32, tile_height: u32) -> Self {
        Self {
            tile_width: tile_width.max(1),
            tile_height: tile_height.max(1),
            latest: HashMap::new(),
        }
    }

    /// One labelled tile per handle, in handle order. Cameras without a usable
    /// frame get a placeholder: red when Failed, grey otherwise.
    pub fn compose(&mut self, handles: &[StreamHandle]) -> RgbImage {
        for handle in handles {
            if let Some(frame) = handle.take_preview() {
                self.latest.insert(handle.name().to_string(), frame);
            }
        }

        let (cols, rows) = grid_dimensions(handles.len());
        let (tw, th) = (self.tile_width, self.tile_height);
        let mut canvas = RgbImage::new(cols as u32 * tw, rows as u32 * th);
        for (i, handle) in handles.iter().enumerate() {
            let scaled = self
                .latest
                .get(handle.name())
                .and_then(|frame| scaled_tile(frame, tw, th));
            let mut tile = match (handle.state(), scaled) {
                (StreamState::Failed, _) => RgbImage::from_pixel(tw, th, FAILED_RGB),
                (_, Some(tile)) => tile,
                (_, None) => RgbImage::from_pixel(tw, th, WAITING_RGB),
            };
            draw_label(&mut tile, handle.name());
            let x = (i % cols) as i64 * i64::from(tw);
            let y = (i / cols) as i64 * i64::from(th);
            imageops::replace(&mut canvas, &tile, x, y);
        }
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CapturedImage;

    #[test]
    fn grid_uses_ceil_sqrt_columns() {
        assert_eq!(grid_dimensions(0), (0, 0));
        assert_eq!(grid_dimensions(1), (1, 1));
        assert_eq!(grid_dimensions(2), (2, 1));
        assert_eq!(grid_dimensions(3), (2, 2));
        assert_eq!(grid_dimensions(4), (2, 2));
        assert_eq!(grid_dimensions(5), (3, 2));
        assert_eq!(grid_dimensions(9), (3, 3));
        assert_eq!(grid_dimensions(10), (4, 3));
    }

    #[test]
    fn nearest_neighbour_scaling_fills_tile() {
        let frame = Frame::new(
            "Gate",
            1,
            CapturedImage::new(2, 1, vec![255, 0, 0, 0, 0, 255]),
        );
        let tile = scaled_tile(&frame, 4, 2).expect("rgb frame scales");
        assert_eq!(tile.dimensions(), (4, 2));
        assert_eq!(*tile.get_pixel(0, 1), Rgb([255, 0, 0]));
        assert_eq!(*tile.get_pixel(3, 1), Rgb([0, 0, 255]));
    }

    #[test]
    fn malformed_frame_has_no_tile() {
        let frame = Frame::new("Gate", 1, CapturedImage::new(4, 4, vec![0; 5]));
        assert!(scaled_tile(&frame, 8, 8).is_none());
    }

    #[test]
    fn label_draws_name_over_dark_strip() {
        let mut tile = RgbImage::from_pixel(64, 48, WAITING_RGB);
        draw_label(&mut tile, "A");
        // Top row of "A" is lit only in its middle column.
        assert_eq!(*tile.get_pixel(LABEL_PAD + LABEL_SCALE, LABEL_PAD), LABEL_INK);
        assert_eq!(*tile.get_pixel(LABEL_PAD, LABEL_PAD), LABEL_BACKGROUND);
        assert_eq!(*tile.get_pixel(40, 40), WAITING_RGB);
    }

    #[test]
    fn long_label_is_clipped_to_tile() {
        let mut tile = RgbImage::from_pixel(10, 6, WAITING_RGB);
        draw_label(&mut tile, "A VERY LONG CAMERA NAME");
        assert_eq!(tile.dimensions(), (10, 6));
    }

    #[test]
    fn saved_mosaic_reloads_with_same_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mosaic.png");
        let image = RgbImage::from_pixel(6, 4, FAILED_RGB);
        save_mosaic(&image, &path)?;
        let reloaded = image::open(&path)?.to_rgb8();
        assert_eq!(reloaded.dimensions(), (6, 4));
        assert_eq!(*reloaded.get_pixel(5, 3), FAILED_RGB);
        assert!(!path.with_extension("tmp.png").exists());
        Ok(())
    }

    #[test]
    fn unknown_extension_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = RgbImage::new(2, 2);
        assert!(save_mosaic(&image, &dir.path().join("mosaic.xyz")).is_err());
        Ok(())
    }
}
