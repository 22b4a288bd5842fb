//! Detection overlay rendering.
//!
//! Each detection gets a 2 px outline in its class colour and a filled tag
//! along the top edge. With a [`LabelFont`] the tag carries the text
//! `"{label} {confidence:.2}"`; without one it degrades to a bar whose
//! length is `confidence * box width`.

use std::fmt;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::error::PipelineError;
use crate::frame::{AnnotatedFrame, Frame, PixelLayout};

const OUTLINE_PX: u32 = 2;
const MIN_TAG_PX: u32 = 4;
const MIN_TEXT_PX: f32 = 12.0;
const MAX_TEXT_PX: f32 = 32.0;
const TEXT_PAD_PX: u32 = 2;

/// RGB colour per class id; ids past the end wrap around.
const PALETTE: [[u8; 3]; 6] = [
    [255, 196, 0],  // longitudinal crack
    [0, 176, 255],  // transverse crack
    [255, 64, 129], // alligator crack
    [255, 32, 32],  // pothole
    [118, 255, 3],
    [213, 0, 249],
];

pub fn class_colour(class_id: u32) -> [u8; 3] {
    PALETTE[class_id as usize % PALETTE.len()]
}

/// TrueType/OpenType face used for label text.
pub struct LabelFont {
    font: FontVec,
}

impl LabelFont {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PipelineError> {
        FontVec::try_from_vec(bytes)
            .map(|font| Self { font })
            .map_err(|e| PipelineError::Config(format!("invalid label font: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::Config(format!("failed to read font {}: {}", path.display(), e))
        })?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelFont").finish_non_exhaustive()
    }
}

/// Render `detections` onto a copy of `frame`. The input frame is untouched.
pub fn annotate(
    frame: &Frame,
    detections: &[Detection],
    font: Option<&LabelFont>,
) -> Result<AnnotatedFrame, PipelineError> {
    let mut canvas = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| PipelineError::encoding("frame buffer does not match its dimensions"))?;

    let tag_height = (frame.height / 60).max(MIN_TAG_PX);
    let text_px = (frame.height as f32 / 30.0).clamp(MIN_TEXT_PX, MAX_TEXT_PX);
    for det in detections {
        let rgb = class_colour(det.class_id);
        let colour = Rgb(to_layout(rgb, frame.layout));
        let (x, y) = draw_outline(&mut canvas, det, colour);
        match font {
            Some(font) => {
                let ink = Rgb(to_layout(text_colour(rgb), frame.layout));
                draw_label(&mut canvas, det, (x, y), colour, ink, font, text_px);
            }
            None => draw_bar(&mut canvas, det, (x, y), colour, tag_height),
        }
    }

    let annotated = Frame::new(
        canvas.into_raw(),
        frame.width,
        frame.height,
        frame.layout,
        frame.sequence,
        frame.timestamp,
    )?;
    Ok(AnnotatedFrame {
        frame: annotated,
        boxes_drawn: detections.len(),
    })
}

fn to_layout([r, g, b]: [u8; 3], layout: PixelLayout) -> [u8; 3] {
    match layout {
        PixelLayout::Rgb24 => [r, g, b],
        PixelLayout::Bgr24 => [b, g, r],
    }
}

/// Black on light tags, white on dark ones.
fn text_colour([r, g, b]: [u8; 3]) -> [u8; 3] {
    let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    if luma > 140.0 {
        [0, 0, 0]
    } else {
        [255, 255, 255]
    }
}

fn box_width(det: &Detection) -> u32 {
    (det.bbox.width().round() as u32 + 1).max(1)
}

/// Returns the top-left corner the tag hangs from.
fn draw_outline(canvas: &mut RgbImage, det: &Detection, colour: Rgb<u8>) -> (i32, i32) {
    let bbox = det.bbox;
    let x = bbox.x_min.floor() as i32;
    let y = bbox.y_min.floor() as i32;
    let w = box_width(det);
    let h = (bbox.height().round() as u32 + 1).max(1);

    for inset in 0..OUTLINE_PX {
        if w <= 2 * inset || h <= 2 * inset {
            break;
        }
        let rect = Rect::at(x + inset as i32, y + inset as i32)
            .of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(canvas, rect, colour);
    }
    (x, y)
}

// Above the box when there is room, otherwise just inside its top edge.
fn tag_top(y: i32, tag_height: u32) -> i32 {
    if y >= tag_height as i32 {
        y - tag_height as i32
    } else {
        y
    }
}

fn draw_label(
    canvas: &mut RgbImage,
    det: &Detection,
    (x, y): (i32, i32),
    colour: Rgb<u8>,
    ink: Rgb<u8>,
    font: &LabelFont,
    text_px: f32,
) {
    let text = format!("{} {:.2}", det.label, det.confidence);
    let scale = PxScale::from(text_px);
    let (text_w, _) = text_size(scale, &font.font, &text);
    let tag_w = text_w + 2 * TEXT_PAD_PX;
    let tag_h = text_px.ceil() as u32 + 2 * TEXT_PAD_PX;
    let top = tag_top(y, tag_h);

    draw_filled_rect_mut(canvas, Rect::at(x, top).of_size(tag_w, tag_h), colour);
    draw_text_mut(
        canvas,
        ink,
        x + TEXT_PAD_PX as i32,
        top + TEXT_PAD_PX as i32,
        scale,
        &font.font,
        &text,
    );
}

fn draw_bar(
    canvas: &mut RgbImage,
    det: &Detection,
    (x, y): (i32, i32),
    colour: Rgb<u8>,
    tag_height: u32,
) {
    let tag_len = ((box_width(det) as f32) * det.confidence.clamp(0.0, 1.0)).round() as u32;
    if tag_len == 0 {
        return;
    }
    let tag = Rect::at(x, tag_top(y, tag_height)).of_size(tag_len, tag_height);
    draw_filled_rect_mut(canvas, tag, colour);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use std::time::Duration;

    fn grey_frame(layout: PixelLayout) -> Frame {
        Frame::new(vec![50; 64 * 48 * 3], 64, 48, layout, 5, Duration::ZERO).expect("frame")
    }

    fn pothole(confidence: f32) -> Detection {
        Detection {
            class_id: 3,
            label: "Potholes".into(),
            confidence,
            bbox: BoundingBox::new(10.0, 20.0, 40.0, 40.0),
        }
    }

    fn bundled_font() -> LabelFont {
        LabelFont::from_bytes(include_bytes!("../assets/fonts/DejaVuSansMono.ttf").to_vec())
            .expect("bundled font")
    }

    #[test]
    fn draws_outline_and_leaves_source_untouched() {
        let frame = grey_frame(PixelLayout::Rgb24);
        let annotated = annotate(&frame, &[pothole(0.9)], None).expect("annotate");

        assert!(frame.pixels().iter().all(|&p| p == 50));
        assert_eq!(annotated.sequence(), 5);
        assert_eq!(annotated.boxes_drawn, 1);
        assert_eq!(annotated.frame.rgb_at(10, 30), Some(class_colour(3)));
        assert_eq!(annotated.frame.rgb_at(11, 30), Some(class_colour(3)));
        assert_eq!(annotated.frame.rgb_at(25, 30), Some([50, 50, 50]));
    }

    #[test]
    fn tag_length_follows_confidence_without_a_font() {
        let frame = grey_frame(PixelLayout::Rgb24);
        let annotated = annotate(&frame, &[pothole(0.5)], None).expect("annotate");
        // Box is 31 px wide; half-confidence tag covers 16 px above it.
        assert_eq!(annotated.frame.rgb_at(12, 17), Some(class_colour(3)));
        assert_eq!(annotated.frame.rgb_at(35, 17), Some([50, 50, 50]));
    }

    #[test]
    fn font_writes_label_text_into_the_tag() {
        let frame = Frame::new(
            vec![50; 160 * 120 * 3],
            160,
            120,
            PixelLayout::Rgb24,
            0,
            Duration::ZERO,
        )
        .expect("frame");
        let det = Detection {
            bbox: BoundingBox::new(10.0, 40.0, 120.0, 100.0),
            ..pothole(0.87)
        };
        let font = bundled_font();
        let plain = annotate(&frame, std::slice::from_ref(&det), None).expect("bar");
        let labelled = annotate(&frame, std::slice::from_ref(&det), Some(&font)).expect("label");

        // 120 px frame: 12 px text plus padding, so the tag spans rows 24..40.
        let tag_rows = 24..40u32;
        let tag_cols = 10..60u32;
        let mut ink = 0;
        let mut fill = 0;
        for y in tag_rows.clone() {
            for x in tag_cols.clone() {
                match labelled.frame.rgb_at(x, y) {
                    Some(px) if px == class_colour(3) => fill += 1,
                    Some([50, 50, 50]) | None => {}
                    Some(_) => ink += 1,
                }
            }
        }
        assert!(fill > 0, "tag background missing");
        assert!(ink > 0, "no text pixels inside the tag");

        let changed = tag_rows
            .flat_map(|y| tag_cols.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| plain.frame.rgb_at(x, y) != labelled.frame.rgb_at(x, y))
            .count();
        assert!(changed > 0);
        // The outline is the same either way.
        assert_eq!(labelled.frame.rgb_at(10, 70), Some(class_colour(3)));
    }

    #[test]
    fn label_tag_moves_inside_boxes_at_the_top_edge() {
        let frame = Frame::new(vec![50; 160 * 120 * 3], 160, 120, PixelLayout::Rgb24, 0, Duration::ZERO)
            .expect("frame");
        let det = Detection {
            bbox: BoundingBox::new(0.0, 0.0, 100.0, 60.0),
            ..pothole(0.5)
        };
        let labelled = annotate(&frame, &[det], Some(&bundled_font())).expect("label");
        // Rows 2..14 sit inside both the box and the tag; some must be ink.
        let ink = (2..14u32)
            .flat_map(|y| (4..60u32).map(move |x| (x, y)))
            .filter_map(|(x, y)| labelled.frame.rgb_at(x, y))
            .filter(|px| *px != class_colour(3) && *px != [50, 50, 50])
            .count();
        assert!(ink > 0);
    }

    #[test]
    fn rejects_bytes_that_are_not_a_font() {
        assert!(matches!(
            LabelFont::from_bytes(b"not a font".to_vec()),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn bgr_frames_get_swapped_colours() {
        let frame = grey_frame(PixelLayout::Bgr24);
        let annotated = annotate(&frame, &[pothole(0.9)], None).expect("annotate");
        assert_eq!(annotated.frame.rgb_at(10, 30), Some(class_colour(3)));
    }

    #[test]
    fn no_detections_is_a_plain_copy() {
        let frame = grey_frame(PixelLayout::Rgb24);
        let annotated = annotate(&frame, &[], Some(&bundled_font())).expect("annotate");
        assert_eq!(annotated.frame.pixels(), frame.pixels());
        assert_eq!(annotated.boxes_drawn, 0);
    }
}
