use crate::geometry::{LabelFont, Point, Rect, Size};
use crate::overlay::Surface;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

pub fn parse_color(raw: &str) -> Option<Rgba<u8>> {
    let s = raw.trim();
    let hex = s.strip_prefix('#')?;
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        6 => Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255])),
        8 => Some(Rgba([channel(0)?, channel(2)?, channel(4)?, channel(6)?])),
        _ => None,
    }
}

fn color_luma(color: Rgba<u8>) -> f64 {
    let [r, g, b, _] = color.0;
    (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)) / 255.0
}

/// Black or white, whichever reads better on `background`.
pub fn contrast_color(background: Rgba<u8>) -> Rgba<u8> {
    if color_luma(background) > 0.6 {
        Rgba([0, 0, 0, 255])
    } else {
        Rgba([255, 255, 255, 255])
    }
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| {
        (f64::from(d) * inv + f64::from(s) * a)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    let out_a = (f64::from(src[3]) + f64::from(dst[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

/// Raster drawing surface backed by an RGBA buffer the size of the display.
pub struct ImageSurface {
    img: RgbaImage,
}

impl ImageSurface {
    pub fn new(size: Size) -> Self {
        Self {
            img: RgbaImage::from_pixel(to_px(size.width), to_px(size.height), TRANSPARENT),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.img
    }

    fn blend_at(&mut self, x: i32, y: i32, color: Rgba<u8>) {
        if x < 0 || y < 0 || x >= self.img.width() as i32 || y >= self.img.height() as i32 {
            return;
        }
        let dst = *self.img.get_pixel(x as u32, y as u32);
        self.img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
    }

    /// Fills the half-open pixel span `[x0, x1) x [y0, y1)`, clipped.
    fn fill_span(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
        let max_x = (self.img.width() as i32).min(x1);
        let max_y = (self.img.height() as i32).min(y1);
        for y in y0.max(0)..max_y {
            for x in x0.max(0)..max_x {
                self.blend_at(x, y, color);
            }
        }
    }
}

fn to_px(v: f64) -> u32 {
    v.round().max(0.0) as u32
}

impl Surface for ImageSurface {
    fn size(&self) -> Size {
        Size::from_pixels(self.img.width(), self.img.height())
    }

    fn resize(&mut self, size: Size) {
        let (w, h) = (to_px(size.width), to_px(size.height));
        if (w, h) != self.img.dimensions() {
            self.img = RgbaImage::from_pixel(w, h, TRANSPARENT);
        }
    }

    fn clear(&mut self) {
        for px in self.img.pixels_mut() {
            *px = TRANSPARENT;
        }
    }

    fn stroke_rect(&mut self, rect: Rect, color: Rgba<u8>, line_width: f64) {
        if rect.width <= 0.0 || rect.height <= 0.0 {
            return;
        }
        // Stroke straddles the path, half inside and half outside.
        let half = line_width.max(1.0) / 2.0;
        let ox0 = (rect.x - half).round() as i32;
        let oy0 = (rect.y - half).round() as i32;
        let ox1 = (rect.right() + half).round() as i32;
        let oy1 = (rect.bottom() + half).round() as i32;
        let ix0 = (rect.x + half).round() as i32;
        let iy0 = (rect.y + half).round() as i32;
        let ix1 = (rect.right() - half).round() as i32;
        let iy1 = (rect.bottom() - half).round() as i32;

        self.fill_span(ox0, oy0, ox1, iy0, color);
        self.fill_span(ox0, iy1.max(iy0), ox1, oy1, color);
        self.fill_span(ox0, iy0, ix0, iy1, color);
        self.fill_span(ix1.max(ix0), iy0, ox1, iy1, color);
    }

    fn fill_rect(&mut self, rect: Rect, color: Rgba<u8>) {
        self.fill_span(
            rect.x.round() as i32,
            rect.y.round() as i32,
            rect.right().round() as i32,
            rect.bottom().round() as i32,
            color,
        );
    }

    fn fill_text(&mut self, text: &str, origin: Point, color: Rgba<u8>, font: &LabelFont) {
        let scale = font.glyph_scale.max(1) as i32;
        let top = (origin.y - font.glyph_px()).round() as i32;
        let mut cursor_x = origin.x.round() as i32;
        for ch in text.chars() {
            let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
                cursor_x += 8 * scale;
                continue;
            };
            for (row_idx, row) in glyph.iter().enumerate() {
                let row_bits = *row;
                for col_idx in 0..8 {
                    if (row_bits >> col_idx) & 1 == 0 {
                        continue;
                    }
                    let px = cursor_x + col_idx * scale;
                    let py = top + row_idx as i32 * scale;
                    self.fill_span(px, py, px + scale, py + scale, color);
                }
            }
            cursor_x += 8 * scale;
        }
    }
}

/// Scales the decoded image to the overlay's size and paints the overlay on
/// top of it.
pub fn compose(base: &DynamicImage, overlay: &RgbaImage) -> RgbaImage {
    let mut out = imageops::resize(
        &base.to_rgba8(),
        overlay.width(),
        overlay.height(),
        FilterType::Triangle,
    );
    imageops::overlay(&mut out, overlay, 0, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_colors() {
        assert_eq!(parse_color("#FF0000"), Some(Rgba([255, 0, 0, 255])));
        assert_eq!(parse_color(" #00ff0080 "), Some(Rgba([0, 255, 0, 128])));
        assert_eq!(parse_color("red"), None);
        assert_eq!(parse_color("#12345"), None);
    }

    #[test]
    fn contrast_on_red_is_white() {
        assert_eq!(contrast_color(Rgba([255, 0, 0, 255])), Rgba([255, 255, 255, 255]));
        assert_eq!(contrast_color(Rgba([255, 255, 200, 255])), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn stroke_leaves_interior_clear() {
        let red = Rgba([255, 0, 0, 255]);
        let mut surface = ImageSurface::new(Size::new(40.0, 40.0));
        surface.stroke_rect(
            Rect {
                x: 10.0,
                y: 10.0,
                width: 20.0,
                height: 20.0,
            },
            red,
            2.0,
        );
        let img = surface.image();
        assert_eq!(*img.get_pixel(10, 20), red);
        assert_eq!(*img.get_pixel(9, 20), red);
        assert_eq!(*img.get_pixel(20, 20), TRANSPARENT);
        assert_eq!(*img.get_pixel(2, 2), TRANSPARENT);
    }

    #[test]
    fn shapes_partly_off_surface_are_clipped() {
        let mut surface = ImageSurface::new(Size::new(10.0, 10.0));
        surface.fill_rect(
            Rect {
                x: -5.0,
                y: -5.0,
                width: 8.0,
                height: 8.0,
            },
            Rgba([0, 0, 255, 255]),
        );
        assert_eq!(surface.image().get_pixel(0, 0)[2], 255);
        assert_eq!(surface.image().get_pixel(5, 5)[3], 0);

        surface.fill_rect(
            Rect {
                x: 50.0,
                y: 50.0,
                width: 4.0,
                height: 4.0,
            },
            Rgba([0, 255, 0, 255]),
        );
        assert!(surface.image().pixels().all(|p| p[1] == 0));
    }

    #[test]
    fn text_draws_above_baseline() {
        let mut surface = ImageSurface::new(Size::new(40.0, 40.0));
        let white = Rgba([255, 255, 255, 255]);
        surface.fill_text("H", Point { x: 0.0, y: 20.0 }, white, &LabelFont::default());
        let img = surface.image();
        let lit_rows: Vec<u32> = (0..40)
            .filter(|y| (0..8).any(|x| img.get_pixel(x, *y)[3] > 0))
            .collect();
        assert!(!lit_rows.is_empty());
        assert!(lit_rows.iter().all(|y| (12..20).contains(y)));
    }

    #[test]
    fn clear_and_resize_reset_pixels() {
        let mut surface = ImageSurface::new(Size::new(4.0, 4.0));
        surface.fill_rect(
            Rect {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
            },
            Rgba([9, 9, 9, 255]),
        );
        surface.clear();
        assert!(surface.image().pixels().all(|p| *p == TRANSPARENT));

        surface.resize(Size::new(8.0, 6.0));
        assert_eq!(surface.image().dimensions(), (8, 6));
    }

    #[test]
    fn compose_matches_overlay_size() {
        let base = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([10, 10, 10, 255])));
        let mut overlay = RgbaImage::from_pixel(8, 8, TRANSPARENT);
        overlay.put_pixel(1, 1, Rgba([255, 0, 0, 255]));
        let out = compose(&base, &overlay);
        assert_eq!(out.dimensions(), (8, 8));
        let marked = out.get_pixel(1, 1);
        assert_eq!((marked[0], marked[1]), (255, 0));
        assert_eq!(out.get_pixel(5, 5)[0], 10);
    }
}
