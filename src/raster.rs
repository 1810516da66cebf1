//! Rasterization pipeline.
//!
//! Order matters and is fixed: white fill, per-region draw in template
//! declaration order, global grayscale, optional binary threshold, then
//! the unconditional 90° rotation into portrait (the printer only
//! accepts portrait feed), and PNG encoding.

use std::io::Cursor;

use anyhow::Context as _;
use image::{Rgba, RgbaImage, imageops};

use crate::{
    error::{LabelkitError, LabelkitResult},
    model::BoxPx,
    region::{Composite, RegionPayload},
    text,
};

/// Canonical 8-byte PNG signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

pub const DEFAULT_THRESHOLD: f32 = 0.6;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const PLACEHOLDER: Rgba<u8> = Rgba([128, 128, 128, 255]);

#[derive(Clone, Debug)]
pub struct RenderOptions {
    /// Binary threshold cutoff as a fraction of max luminance; `None`
    /// keeps the grayscale surface untouched.
    pub threshold: Option<f32>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            threshold: Some(DEFAULT_THRESHOLD),
        }
    }
}

/// The most recent encoded output for a composite. Handed out only as
/// immutable snapshots; `version` increases by one per rasterization.
#[derive(Clone, Debug)]
pub struct RenderedArtifact {
    pub version: u64,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

impl RenderedArtifact {
    /// Non-empty and starts with the canonical PNG signature.
    pub fn is_well_formed(&self) -> bool {
        !self.png.is_empty() && self.png.starts_with(&PNG_SIGNATURE)
    }
}

/// One finished pass, before the session stamps a version on it.
#[derive(Clone, Debug)]
pub struct RenderedFrame {
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

/// Run the full pipeline for the composite's current state.
pub fn rasterize(composite: &Composite, opts: &RenderOptions) -> LabelkitResult<RenderedFrame> {
    let mut surface = compose_surface(composite)?;
    grayscale_in_place(&mut surface);
    if let Some(tau) = opts.threshold {
        threshold_in_place(&mut surface, tau);
    }

    let portrait = imageops::rotate90(&surface);
    let png = encode_png(&portrait)?;
    Ok(RenderedFrame {
        width: portrait.width(),
        height: portrait.height(),
        png,
    })
}

/// Draw every region into a white landscape surface of the composite's
/// declared size. A region that cannot be drawn is logged and skipped;
/// the pass always completes.
pub fn compose_surface(composite: &Composite) -> LabelkitResult<RgbaImage> {
    composite.ensure_surface()?;
    let mut surface = RgbaImage::from_pixel(composite.width(), composite.height(), WHITE);

    for region in composite.regions() {
        match &region.payload {
            RegionPayload::Text { font_size } => {
                if region.value().is_empty() {
                    continue;
                }
                let size = font_size.unwrap_or(region.bounds.height / 2.0);
                draw_text_region(&mut surface, &region.bounds, region.value(), size)
                    .unwrap_or_else(|e| {
                        tracing::warn!(region = region.id(), error = %e, "text draw skipped");
                    });
            }
            RegionPayload::Image(slot) | RegionPayload::QrCode(slot) => match slot.resolved() {
                Some(resolved) => draw_image_fill(&mut surface, &region.bounds, &resolved.image),
                None => fill_box(&mut surface, &region.bounds, PLACEHOLDER),
            },
            RegionPayload::Unknown => {
                tracing::warn!(region = region.id(), "unknown region kind skipped");
            }
        }
    }

    Ok(surface)
}

fn box_to_pixels(bounds: &BoxPx, surface: &RgbaImage) -> Option<(i64, i64, u32, u32)> {
    let w = bounds.width.round().max(0.0) as u32;
    let h = bounds.height.round().max(0.0) as u32;
    if w == 0 || h == 0 || surface.width() == 0 || surface.height() == 0 {
        return None;
    }
    Some((bounds.left.round() as i64, bounds.top.round() as i64, w, h))
}

fn draw_text_region(
    surface: &mut RgbaImage,
    bounds: &BoxPx,
    value: &str,
    font_size: f32,
) -> LabelkitResult<()> {
    let Some((x, y, w, h)) = box_to_pixels(bounds, surface) else {
        return Ok(());
    };
    let rendered = text::render_text(value, w, h, font_size)?;
    imageops::overlay(surface, &rendered, x, y);
    Ok(())
}

/// Scale the resolved bitmap to exactly fill the box.
fn draw_image_fill(surface: &mut RgbaImage, bounds: &BoxPx, img: &RgbaImage) {
    let Some((x, y, w, h)) = box_to_pixels(bounds, surface) else {
        return;
    };
    let scaled = if img.dimensions() == (w, h) {
        img.clone()
    } else {
        imageops::resize(img, w, h, imageops::FilterType::Triangle)
    };
    imageops::overlay(surface, &scaled, x, y);
}

/// Solid fill so an unset image region never leaves transparent or
/// undefined pixels.
fn fill_box(surface: &mut RgbaImage, bounds: &BoxPx, color: Rgba<u8>) {
    let Some((x, y, w, h)) = box_to_pixels(bounds, surface) else {
        return;
    };
    for dy in 0..h as i64 {
        for dx in 0..w as i64 {
            let (px, py) = (x + dx, y + dy);
            if px >= 0 && py >= 0 && (px as u32) < surface.width() && (py as u32) < surface.height()
            {
                surface.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

/// Map every pixel to its Rec.709 luminance; alpha untouched.
pub fn grayscale_in_place(surface: &mut RgbaImage) {
    for px in surface.pixels_mut() {
        let [r, g, b, _] = px.0;
        let y = luma709(r, g, b);
        px.0[0] = y;
        px.0[1] = y;
        px.0[2] = y;
    }
}

fn luma709(r: u8, g: u8, b: u8) -> u8 {
    ((2126 * u32::from(r) + 7152 * u32::from(g) + 722 * u32::from(b) + 5000) / 10_000) as u8
}

/// Force each pixel to pure white or pure black at cutoff fraction
/// `tau` of max luminance. Tie-break: average luminance strictly
/// greater than `tau * 255` goes white; exactly equal goes black.
/// Alpha is untouched.
pub fn threshold_in_place(surface: &mut RgbaImage, tau: f32) {
    let cutoff = tau * 255.0;
    for px in surface.pixels_mut() {
        let [r, g, b, _] = px.0;
        let avg = (u32::from(r) + u32::from(g) + u32::from(b)) / 3;
        let v = if (avg as f32) > cutoff { 255 } else { 0 };
        px.0[0] = v;
        px.0[1] = v;
        px.0[2] = v;
    }
}

fn encode_png(img: &RgbaImage) -> LabelkitResult<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .context("encode artifact PNG")?;
    if buf.is_empty() {
        return Err(LabelkitError::raster("PNG encoder produced no bytes"));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RegionDef, RegionKind, TemplateDef};

    fn text_only_template(width: u32, height: u32) -> TemplateDef {
        TemplateDef {
            id: "t".to_string(),
            label: None,
            width,
            height,
            regions: vec![RegionDef {
                id: "label-text".to_string(),
                kind: RegionKind::Text,
                label: None,
                value: String::new(),
                bounds: BoxPx {
                    left: 4.0,
                    top: 4.0,
                    width: 60.0,
                    height: 20.0,
                },
                placeholder: None,
                required: false,
                font_size: None,
            }],
        }
    }

    #[test]
    fn output_is_portrait_with_swapped_dimensions() {
        let comp = Composite::from_template(&text_only_template(90, 29)).unwrap();
        let frame = rasterize(&comp, &RenderOptions::default()).unwrap();
        assert_eq!((frame.width, frame.height), (29, 90));
    }

    #[test]
    fn output_starts_with_png_signature() {
        let comp = Composite::from_template(&text_only_template(32, 16)).unwrap();
        let frame = rasterize(&comp, &RenderOptions::default()).unwrap();
        assert!(frame.png.starts_with(&PNG_SIGNATURE));
        assert!(!frame.png.is_empty());
    }

    #[test]
    fn unresolved_image_region_gets_placeholder_fill() {
        let mut def = text_only_template(40, 40);
        def.regions = vec![RegionDef {
            id: "logo".to_string(),
            kind: RegionKind::Image,
            label: None,
            value: String::new(),
            bounds: BoxPx {
                left: 0.0,
                top: 0.0,
                width: 40.0,
                height: 40.0,
            },
            placeholder: None,
            required: false,
            font_size: None,
        }];
        let comp = Composite::from_template(&def).unwrap();

        let surface = compose_surface(&comp).unwrap();
        // No transparent or white-by-default pixels inside the box.
        assert!(surface.pixels().all(|p| *p == PLACEHOLDER));
    }

    #[test]
    fn threshold_tie_goes_black_strictly_greater_goes_white() {
        let mut img = RgbaImage::new(2, 1);
        // 0.6 * 255 = 153.0 exactly.
        img.put_pixel(0, 0, Rgba([153, 153, 153, 255]));
        img.put_pixel(1, 0, Rgba([154, 154, 154, 255]));
        threshold_in_place(&mut img, 0.6);
        assert_eq!(*img.get_pixel(0, 0), BLACK);
        assert_eq!(*img.get_pixel(1, 0), WHITE);
    }

    #[test]
    fn threshold_preserves_alpha() {
        let mut img = RgbaImage::new(1, 1);
        img.put_pixel(0, 0, Rgba([200, 200, 200, 77]));
        threshold_in_place(&mut img, 0.6);
        assert_eq!(*img.get_pixel(0, 0), Rgba([255, 255, 255, 77]));
    }

    #[test]
    fn grayscale_maps_channels_to_luminance() {
        let mut img = RgbaImage::new(1, 1);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        grayscale_in_place(&mut img);
        let px = img.get_pixel(0, 0);
        assert_eq!(px.0[0], px.0[1]);
        assert_eq!(px.0[1], px.0[2]);
        // Rec.709 red weight.
        assert_eq!(px.0[0], 54);
    }

    #[test]
    fn encoded_artifact_decodes_back_to_same_dimensions() {
        let comp = Composite::from_template(&text_only_template(64, 24)).unwrap();
        let frame = rasterize(&comp, &RenderOptions { threshold: None }).unwrap();
        let decoded = image::load_from_memory(&frame.png).unwrap();
        assert_eq!(decoded.width(), 24);
        assert_eq!(decoded.height(), 64);
    }
}
