//! Maps detection geometry from natural image space onto a display surface
//! and places each label so it stays on screen where it can.

use crate::model::Annotation;
use serde::Serialize;

/// Gap between a label and the box it belongs to, and inner text padding.
const LABEL_GAP: f64 = 4.0;
const LABEL_PAD: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn from_pixels(width: u32, height: u32) -> Self {
        Self::new(f64::from(width), f64::from(height))
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Metrics of the fixed-pitch label font.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelFont {
    /// Text height in display pixels.
    pub size: f64,
    pub glyph_scale: u32,
}

impl Default for LabelFont {
    fn default() -> Self {
        Self {
            size: 14.0,
            glyph_scale: 1,
        }
    }
}

impl LabelFont {
    pub fn glyph_px(&self) -> f64 {
        8.0 * f64::from(self.glyph_scale.max(1))
    }

    pub fn measure(&self, text: &str) -> f64 {
        text.chars().count() as f64 * self.glyph_px()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappedAnnotation {
    pub box_rect: Rect,
    pub label_rect: Rect,
    /// Left end of the text baseline.
    pub label_origin: Point,
    pub label_text: String,
    pub flipped: bool,
}

pub fn label_text(ann: &Annotation) -> String {
    let percent = (ann.confidence * 100.0).round() as i64;
    format!("{} ({percent}%)", ann.class_name)
}

/// Pure: identical inputs always give identical geometry. Returns `None`
/// while the natural size is unknown (image not loaded yet).
pub fn map_annotation(
    ann: &Annotation,
    natural: Size,
    display: Size,
    font: &LabelFont,
) -> Option<MappedAnnotation> {
    if natural.is_empty() {
        return None;
    }
    let scale_x = display.width / natural.width;
    let scale_y = display.height / natural.height;

    let box_rect = Rect {
        x: (ann.x - ann.width / 2.0) * scale_x,
        y: (ann.y - ann.height / 2.0) * scale_y,
        width: ann.width * scale_x,
        height: ann.height * scale_y,
    };

    let text = label_text(ann);
    let text_width = font.measure(&text);
    let text_height = font.size;

    let mut rect_x = box_rect.x;
    let mut rect_y = box_rect.y - text_height - LABEL_GAP;
    let mut text_x = box_rect.x + LABEL_PAD;
    let mut text_y = box_rect.y - LABEL_GAP;
    let mut flipped = false;

    if rect_y < 0.0 {
        rect_y = box_rect.y + LABEL_PAD;
        text_y = box_rect.y + text_height;
        flipped = true;
    }

    if rect_x + text_width + LABEL_GAP > display.width {
        rect_x = display.width - text_width - LABEL_GAP;
        text_x = rect_x + LABEL_PAD;
    }
    // A label wider than the surface pins to the left edge and runs off the
    // right one.
    if rect_x < 0.0 {
        rect_x = 0.0;
        text_x = rect_x + LABEL_PAD;
    }

    Some(MappedAnnotation {
        box_rect,
        label_rect: Rect {
            x: rect_x,
            y: rect_y,
            width: text_width + LABEL_GAP,
            height: text_height + LABEL_GAP,
        },
        label_origin: Point {
            x: text_x,
            y: text_y,
        },
        label_text: text,
        flipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(x: f64, y: f64, width: f64, height: f64) -> Annotation {
        Annotation {
            x,
            y,
            width,
            height,
            class_name: "caries".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn label_text_rounds_confidence() {
        let mut a = ann(0.0, 0.0, 1.0, 1.0);
        a.confidence = 0.876;
        assert_eq!(label_text(&a), "caries (88%)");
        a.confidence = 1.0;
        assert_eq!(label_text(&a), "caries (100%)");
    }

    #[test]
    fn unloaded_image_maps_nothing() {
        let font = LabelFont::default();
        let a = ann(10.0, 10.0, 4.0, 4.0);
        assert!(map_annotation(&a, Size::new(0.0, 100.0), Size::new(100.0, 100.0), &font).is_none());
        assert!(map_annotation(&a, Size::new(100.0, 0.0), Size::new(100.0, 100.0), &font).is_none());
    }

    #[test]
    fn center_box_converts_to_top_left() {
        let font = LabelFont::default();
        let m = map_annotation(
            &ann(50.0, 60.0, 20.0, 10.0),
            Size::new(100.0, 100.0),
            Size::new(100.0, 100.0),
            &font,
        )
        .unwrap();
        assert_eq!(
            m.box_rect,
            Rect {
                x: 40.0,
                y: 55.0,
                width: 20.0,
                height: 10.0
            }
        );
        assert!(!m.flipped);
        assert_eq!(m.label_rect.y, 55.0 - 14.0 - 4.0);
        assert_eq!(m.label_origin, Point { x: 42.0, y: 51.0 });
        assert_eq!(m.label_rect.height, 18.0);
    }

    #[test]
    fn doubling_display_doubles_box() {
        let font = LabelFont::default();
        let a = ann(50.0, 50.0, 20.0, 30.0);
        let one = map_annotation(&a, Size::new(100.0, 100.0), Size::new(100.0, 100.0), &font).unwrap();
        let two = map_annotation(&a, Size::new(100.0, 100.0), Size::new(200.0, 200.0), &font).unwrap();
        assert_eq!(two.box_rect.x, one.box_rect.x * 2.0);
        assert_eq!(two.box_rect.y, one.box_rect.y * 2.0);
        assert_eq!(two.box_rect.width, one.box_rect.width * 2.0);
        assert_eq!(two.box_rect.height, one.box_rect.height * 2.0);
    }

    #[test]
    fn non_uniform_scale_uses_each_axis() {
        let font = LabelFont::default();
        let m = map_annotation(
            &ann(100.0, 100.0, 40.0, 40.0),
            Size::new(200.0, 400.0),
            Size::new(100.0, 100.0),
            &font,
        )
        .unwrap();
        assert_eq!(m.box_rect.x, 40.0);
        assert_eq!(m.box_rect.y, 20.0);
        assert_eq!(m.box_rect.width, 20.0);
        assert_eq!(m.box_rect.height, 10.0);
    }

    #[test]
    fn identical_inputs_give_identical_geometry() {
        let font = LabelFont::default();
        let a = ann(123.4, 56.7, 8.9, 10.1);
        let natural = Size::new(640.0, 480.0);
        let display = Size::new(321.0, 240.5);
        let first = map_annotation(&a, natural, display, &font);
        for _ in 0..5 {
            assert_eq!(map_annotation(&a, natural, display, &font), first);
        }
    }

    #[test]
    fn label_flips_inside_box_near_top() {
        let font = LabelFont::default();
        let m = map_annotation(
            &ann(150.0, 5.0, 20.0, 10.0),
            Size::new(300.0, 300.0),
            Size::new(300.0, 300.0),
            &font,
        )
        .unwrap();
        assert!(m.flipped);
        assert!(m.label_rect.y >= 0.0);
        assert_eq!(m.label_rect.y, m.box_rect.y + 2.0);
        assert_eq!(m.label_origin.y, m.box_rect.y + 14.0);
    }

    #[test]
    fn label_shifts_left_at_right_edge() {
        let font = LabelFont::default();
        let m = map_annotation(
            &ann(290.0, 150.0, 10.0, 10.0),
            Size::new(300.0, 300.0),
            Size::new(300.0, 300.0),
            &font,
        )
        .unwrap();
        let text_width = font.measure(&m.label_text);
        assert!(m.label_rect.x + text_width + 4.0 <= 300.0);
        assert_eq!(m.label_rect.right(), 300.0);
        assert_eq!(m.label_origin.x, m.label_rect.x + 2.0);
    }

    #[test]
    fn label_wider_than_surface_pins_left() {
        let font = LabelFont::default();
        let m = map_annotation(
            &ann(20.0, 30.0, 10.0, 10.0),
            Size::new(40.0, 40.0),
            Size::new(40.0, 40.0),
            &font,
        )
        .unwrap();
        assert_eq!(m.label_rect.x, 0.0);
        assert_eq!(m.label_origin.x, 2.0);
        assert!(m.label_rect.right() > 40.0);
    }
}
