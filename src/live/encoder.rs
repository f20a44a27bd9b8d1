use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detector::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;

/// Copy the frame and draw one hollow rectangle per detection.
pub fn render_overlay(frame: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = frame.clone();
    for detection in detections {
        let (x1, y1, x2, y2) = detection
            .bbox
            .to_pixel_corners(canvas.width(), canvas.height());
        for inset in 0..BOX_THICKNESS {
            let width = (x2 - x1 - 2 * inset).max(1) as u32;
            let height = (y2 - y1 - 2 * inset).max(1) as u32;
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(width, height);
            draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
        }
    }
    canvas
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality)
        .encode_image(image)
        .context("JPEG encoding failed")?;
    Ok(encoded)
}
