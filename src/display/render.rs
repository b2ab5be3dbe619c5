use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Pixel, Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::DisplayConfig;
use crate::payload;

const FIT_MARGIN: f32 = 0.95;
const OVERLAY_MARGIN: i32 = 20;
const OVERLAY_PADDING: i32 = 15;
const OVERLAY_BACKING: Rgba<u8> = Rgba([0, 0, 0, 180]);
const OVERLAY_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// One ready-to-present bitmap in 0RGB packing, sized to the viewport with
/// the photo centered on a black background.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

/// Decodes photos and composes the viewer bitmap: optional name overlay in
/// the bottom-right corner, aspect-preserving scale with a small margin,
/// letterboxed onto the viewport.
pub struct Renderer {
    font: Option<FontVec>,
    font_px: f32,
}

impl Renderer {
    pub fn new(cfg: &DisplayConfig) -> Self {
        let font = load_overlay_font(&cfg.font_paths);
        if font.is_none() {
            warn!("no overlay font found; photos will be shown without name overlay");
        }
        Self {
            font,
            font_px: cfg.overlay_font_px,
        }
    }

    pub fn compose(
        &self,
        data: &str,
        name: Option<&str>,
        viewport_w: u32,
        viewport_h: u32,
    ) -> Result<Frame> {
        let bytes = payload::decode_base64_image(data)?;
        let decoded = image::load_from_memory(&bytes).context("undecodable image data")?;
        let mut photo = decoded.to_rgba8();

        if let Some(name) = name.filter(|n| !n.is_empty()) {
            match &self.font {
                Some(font) => draw_overlay(&mut photo, name, font, self.font_px),
                None => debug!("overlay font unavailable, skipping name overlay"),
            }
        }

        let (scaled_w, scaled_h) = fit_within(photo.width(), photo.height(), viewport_w, viewport_h);
        let scaled = image::imageops::resize(
            &photo,
            scaled_w,
            scaled_h,
            image::imageops::FilterType::Lanczos3,
        );

        Ok(letterbox(&scaled, viewport_w, viewport_h))
    }
}

/// Scale `img` to fit the viewport, preserving aspect ratio and leaving a 5%
/// margin on the limiting axis.
pub(crate) fn fit_within(img_w: u32, img_h: u32, viewport_w: u32, viewport_h: u32) -> (u32, u32) {
    let scale_w = viewport_w as f32 / img_w.max(1) as f32;
    let scale_h = viewport_h as f32 / img_h.max(1) as f32;
    let factor = scale_w.min(scale_h) * FIT_MARGIN;
    let w = ((img_w as f32 * factor) as u32).max(1);
    let h = ((img_h as f32 * factor) as u32).max(1);
    (w, h)
}

fn letterbox(img: &RgbaImage, viewport_w: u32, viewport_h: u32) -> Frame {
    let mut pixels = vec![0u32; (viewport_w as usize) * (viewport_h as usize)];
    let x0 = viewport_w.saturating_sub(img.width()) / 2;
    let y0 = viewport_h.saturating_sub(img.height()) / 2;

    for (x, y, px) in img.enumerate_pixels() {
        let tx = x0 + x;
        let ty = y0 + y;
        if tx < viewport_w && ty < viewport_h {
            let [r, g, b, _] = px.0;
            pixels[(ty as usize) * (viewport_w as usize) + tx as usize] =
                ((r as u32) << 16) | ((g as u32) << 8) | (b as u32);
        }
    }

    Frame {
        width: viewport_w,
        height: viewport_h,
        pixels,
    }
}

/// Bottom-right name overlay: measured text bounds, padded semi-opaque
/// backing box, white text.
fn draw_overlay(img: &mut RgbaImage, text: &str, font: &FontVec, font_px: f32) {
    let scale = PxScale::from(font_px);
    let (text_w, text_h) = text_size(scale, font, text);

    let x = (img.width() as i32 - text_w as i32 - OVERLAY_MARGIN).max(OVERLAY_PADDING);
    let y = (img.height() as i32 - text_h as i32 - OVERLAY_MARGIN).max(OVERLAY_PADDING);

    shade_rect(
        img,
        x - OVERLAY_PADDING,
        y - OVERLAY_PADDING,
        text_w + 2 * OVERLAY_PADDING as u32,
        text_h + 2 * OVERLAY_PADDING as u32,
    );
    draw_text_mut(img, OVERLAY_TEXT, x, y, scale, font, text);
    debug!("overlay drawn: '{text}' at ({x}, {y})");
}

/// Alpha-blend a dark rectangle so the photo stays visible behind the text.
fn shade_rect(img: &mut RgbaImage, x0: i32, y0: i32, w: u32, h: u32) {
    for dy in 0..h as i32 {
        for dx in 0..w as i32 {
            let x = x0 + dx;
            let y = y0 + dy;
            if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
                img.get_pixel_mut(x as u32, y as u32).blend(&OVERLAY_BACKING);
            }
        }
    }
}

/// Candidate fonts: configured paths first, then common system locations.
fn load_overlay_font(configured: &[PathBuf]) -> Option<FontVec> {
    let system_candidates = [
        "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
        "/System/Library/Fonts/Supplemental/Arial.ttf",
        "C:\\Windows\\Fonts\\arial.ttf",
    ];

    let candidates = configured
        .iter()
        .cloned()
        .chain(system_candidates.iter().map(PathBuf::from));

    for path in candidates {
        if !path.is_file() {
            continue;
        }
        match fs::read(&path).ok().and_then(|bytes| FontVec::try_from_vec(bytes).ok()) {
            Some(font) => {
                debug!("overlay font loaded from {}", path.display());
                return Some(font);
            }
            None => warn!("failed to load font {}", path.display()),
        }
    }
    None
}

/// Encode a solid white test image as a PNG data URI.
#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> String {
    use base64::Engine as _;

    let img = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&bytes)
    )
}
