use std::path::Path;
use usvg::TreeParsing;

use crate::error::RenderError;

/// Rasterizes an SVG document onto a white canvas and encodes it as PNG.
pub fn svg_to_png(svg: &str) -> Result<Vec<u8>, RenderError> {
    let tree = usvg::Tree::from_str(svg, &usvg::Options::default())
        .map_err(|e| RenderError::Svg(e.to_string()))?;

    let size = tree.size;
    let width = size.width().ceil() as u32;
    let height = size.height().ceil() as u32;
    let mut pixmap =
        tiny_skia::Pixmap::new(width, height).ok_or(RenderError::Canvas { width, height })?;
    pixmap.fill(tiny_skia::Color::WHITE);

    resvg::Tree::from_usvg(&tree).render(tiny_skia::Transform::identity(), &mut pixmap.as_mut());

    pixmap
        .encode_png()
        .map_err(|e| RenderError::Encode(e.to_string()))
}

pub fn write_png(svg: &str, out: &Path) -> Result<(), RenderError> {
    let png = svg_to_png(svg)?;
    std::fs::write(out, png).map_err(|source| RenderError::Io {
        path: out.to_path_buf(),
        source,
    })
}
