//! Text-region rasterization.
//!
//! Text is laid out and rasterized by routing a minimal generated SVG
//! `<text>` element through usvg/resvg against the system font database.
//! Serif family, bold weight; the font size is the region-declared size
//! or half the box height.

use std::sync::{Arc, OnceLock};

use crate::error::{LabelkitError, LabelkitResult};

static FONTDB: OnceLock<Arc<usvg::fontdb::Database>> = OnceLock::new();

fn fontdb() -> Arc<usvg::fontdb::Database> {
    FONTDB
        .get_or_init(|| {
            let mut db = usvg::fontdb::Database::new();
            db.load_system_fonts();
            Arc::new(db)
        })
        .clone()
}

/// Render one line of text into a `width`×`height` RGBA bitmap with a
/// transparent background. The baseline sits one `font_size` below the
/// top-left origin so glyphs land inside the box.
pub fn render_text(
    text: &str,
    width: u32,
    height: u32,
    font_size: f32,
) -> LabelkitResult<image::RgbaImage> {
    if width == 0 || height == 0 {
        return Err(LabelkitError::raster("text box has a zero dimension"));
    }

    let svg = format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}">"#,
            r#"<text x="0" y="{baseline}" font-family="serif" font-weight="bold" "#,
            r#"font-size="{size}" fill="black">{text}</text></svg>"#
        ),
        w = width,
        h = height,
        baseline = font_size,
        size = font_size,
        text = xml_escape(text),
    );

    let opts = usvg::Options {
        fontdb: fontdb(),
        ..Default::default()
    };
    let tree = usvg::Tree::from_str(&svg, &opts)
        .map_err(|e| LabelkitError::raster(format!("parse generated text svg: {e}")))?;

    let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| LabelkitError::raster("failed to allocate text pixmap"))?;
    resvg::render(
        &tree,
        resvg::tiny_skia::Transform::identity(),
        &mut pixmap.as_mut(),
    );

    let mut out = image::RgbaImage::new(width, height);
    for (dst, px) in out.pixels_mut().zip(pixmap.pixels()) {
        let c = px.demultiply();
        *dst = image::Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
    }
    Ok(out)
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn renders_into_requested_dimensions() {
        let img = render_text("Item #001", 120, 40, 20.0).unwrap();
        assert_eq!(img.dimensions(), (120, 40));
    }

    #[test]
    fn empty_text_yields_fully_transparent_bitmap() {
        let img = render_text("", 16, 16, 8.0).unwrap();
        assert!(img.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn zero_sized_box_is_an_error() {
        assert!(render_text("x", 0, 10, 5.0).is_err());
    }
}
