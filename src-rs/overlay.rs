use crate::draw::contrast_color;
use crate::geometry::{map_annotation, LabelFont, MappedAnnotation, Point, Rect, Size};
use crate::model::Annotation;
use image::Rgba;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Anything the overlay can be painted onto.
pub trait Surface {
    fn size(&self) -> Size;
    fn resize(&mut self, size: Size);
    fn clear(&mut self);
    fn stroke_rect(&mut self, rect: Rect, color: Rgba<u8>, line_width: f64);
    fn fill_rect(&mut self, rect: Rect, color: Rgba<u8>);
    fn fill_text(&mut self, text: &str, origin: Point, color: Rgba<u8>, font: &LabelFont);
}

#[derive(Debug, Clone, Copy)]
pub struct OverlayStyle {
    pub box_color: Rgba<u8>,
    pub label_background: Rgba<u8>,
    pub label_text: Rgba<u8>,
    pub line_width: f64,
    pub font: LabelFont,
}

impl OverlayStyle {
    pub fn with_color(color: Rgba<u8>) -> Self {
        Self {
            box_color: color,
            label_background: color,
            label_text: contrast_color(color),
            line_width: 2.0,
            font: LabelFont::default(),
        }
    }
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self::with_color(Rgba([255, 0, 0, 255]))
    }
}

/// The element containing the image. Layout changes are published to every
/// live subscription.
pub struct Viewport {
    size: watch::Sender<Size>,
}

impl Viewport {
    pub fn new(size: Size) -> Self {
        let (size, _) = watch::channel(size);
        Self { size }
    }

    pub fn size(&self) -> Size {
        *self.size.borrow()
    }

    pub fn resize(&self, size: Size) {
        self.size.send_if_modified(|current| {
            if *current == size {
                return false;
            }
            *current = size;
            true
        });
    }

    pub fn subscribe(&self) -> ResizeSubscription {
        ResizeSubscription {
            rx: self.size.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.size.receiver_count()
    }
}

/// Live interest in viewport size changes. Dropping it unsubscribes.
pub struct ResizeSubscription {
    rx: watch::Receiver<Size>,
}

impl ResizeSubscription {
    /// The latest size if it changed since the last call.
    pub fn take_change(&mut self) -> Option<Size> {
        if self.rx.has_changed().unwrap_or(false) {
            Some(*self.rx.borrow_and_update())
        } else {
            None
        }
    }
}

/// Paints the active result's annotations over its image. Keeps only the
/// last known natural and display sizes; everything else comes from the
/// caller.
pub struct OverlayRenderer<S: Surface> {
    surface: S,
    style: OverlayStyle,
    source: Option<String>,
    annotations: Arc<Vec<Annotation>>,
    natural: Option<Size>,
    display: Size,
    subscription: Option<ResizeSubscription>,
    redraws: usize,
}

impl<S: Surface> OverlayRenderer<S> {
    pub fn new(surface: S, style: OverlayStyle) -> Self {
        let display = surface.size();
        Self {
            surface,
            style,
            source: None,
            annotations: Arc::new(Vec::new()),
            natural: None,
            display,
            subscription: None,
            redraws: 0,
        }
    }

    /// Points the renderer at an image and its annotation list. A new image
    /// resets the natural size until `image_loaded` fires and moves the
    /// resize subscription over. Returns whether a redraw happened.
    pub fn show(
        &mut self,
        viewport: &Viewport,
        source_key: &str,
        annotations: Arc<Vec<Annotation>>,
    ) -> bool {
        let image_changed = self.source.as_deref() != Some(source_key);
        let annotations_changed = !Arc::ptr_eq(&self.annotations, &annotations);
        if !image_changed && !annotations_changed {
            return false;
        }

        if image_changed {
            self.subscription = None;
            self.natural = None;
            self.source = Some(source_key.to_string());
            self.subscription = Some(viewport.subscribe());
        }
        self.annotations = annotations;
        self.display = viewport.size();
        self.redraw();
        true
    }

    /// Load-completion notification carrying the image's intrinsic size.
    pub fn image_loaded(&mut self, natural: Size) {
        if self.source.is_none() || self.natural == Some(natural) {
            return;
        }
        self.natural = Some(natural);
        self.redraw();
    }

    /// Drains a pending viewport resize, redrawing when the size moved.
    pub fn poll_resize(&mut self) -> bool {
        let Some(size) = self.subscription.as_mut().and_then(|s| s.take_change()) else {
            return false;
        };
        if size == self.display {
            return false;
        }
        self.display = size;
        self.redraw();
        true
    }

    pub fn teardown(&mut self) {
        self.subscription = None;
        self.source = None;
        self.natural = None;
        self.annotations = Arc::new(Vec::new());
        self.surface.clear();
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn display_size(&self) -> Size {
        self.display
    }

    pub fn redraw_count(&self) -> usize {
        self.redraws
    }

    /// Geometry as currently painted. Empty until the image has loaded.
    pub fn mapped(&self) -> Vec<MappedAnnotation> {
        let Some(natural) = self.natural else {
            return Vec::new();
        };
        self.annotations
            .iter()
            .filter_map(|ann| map_annotation(ann, natural, self.display, &self.style.font))
            .collect()
    }

    fn redraw(&mut self) {
        self.surface.resize(self.display);
        self.surface.clear();
        self.redraws += 1;

        // Deferred until the load notification supplies a natural size.
        let Some(natural) = self.natural else {
            debug!(source = ?self.source, "image not loaded; overlay left blank");
            return;
        };
        debug!(
            annotations = self.annotations.len(),
            width = self.display.width,
            height = self.display.height,
            "redrawing overlay"
        );

        let style = self.style;
        for ann in self.annotations.iter() {
            let Some(mapped) = map_annotation(ann, natural, self.display, &style.font) else {
                continue;
            };
            self.surface
                .stroke_rect(mapped.box_rect, style.box_color, style.line_width);
            self.surface
                .fill_rect(mapped.label_rect, style.label_background);
            self.surface.fill_text(
                &mapped.label_text,
                mapped.label_origin,
                style.label_text,
                &style.font,
            );
        }
    }
}
