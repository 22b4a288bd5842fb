//! BT.601 conversions between planar YUV and interleaved RGB24.

use crate::error::PipelineError;

/// Luma/chroma swing of a YUV stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ColorRange {
    /// 0..255 for all planes (JPEG).
    Full,
    /// 16..235 luma, 16..240 chroma (broadcast).
    Limited,
}

/// Chroma plane layout of a planar YUV frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChromaLayout {
    Yuv444,
    /// Chroma subsampled 2x in both directions; odd sizes round up.
    Yuv420,
}

impl ChromaLayout {
    pub(crate) fn chroma_size(self, width: usize, height: usize) -> (usize, usize) {
        match self {
            ChromaLayout::Yuv444 => (width, height),
            ChromaLayout::Yuv420 => (width.div_ceil(2), height.div_ceil(2)),
        }
    }

    /// Planar byte length of one frame; `None` if it does not fit in `usize`.
    pub(crate) fn frame_len(self, width: usize, height: usize) -> Option<usize> {
        let (cw, ch) = self.chroma_size(width, height);
        let chroma = cw.checked_mul(ch)?.checked_mul(2)?;
        width.checked_mul(height)?.checked_add(chroma)
    }
}

/// Planar Y, U, V to interleaved RGB24.
pub(crate) fn yuv_to_rgb(
    planes: &[u8],
    width: usize,
    height: usize,
    layout: ChromaLayout,
    range: ColorRange,
) -> Result<Vec<u8>, PipelineError> {
    let expected = layout
        .frame_len(width, height)
        .ok_or_else(|| PipelineError::Source("YUV frame size overflows".into()))?;
    let rgb_len = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| PipelineError::Source("RGB frame size overflows".into()))?;
    if planes.len() != expected {
        return Err(PipelineError::Source(format!(
            "YUV frame length mismatch: expected {}, got {}",
            expected,
            planes.len()
        )));
    }
    let (cw, ch) = layout.chroma_size(width, height);
    let (y_plane, rest) = planes.split_at(width * height);
    let (u_plane, v_plane) = rest.split_at(cw * ch);

    let mut rgb = vec![0u8; rgb_len];
    for j in 0..height {
        for i in 0..width {
            let c = match layout {
                ChromaLayout::Yuv444 => j * cw + i,
                ChromaLayout::Yuv420 => (j / 2) * cw + i / 2,
            };
            let (y, u, v) = expand(y_plane[j * width + i], u_plane[c], v_plane[c], range);

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * width + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }
    Ok(rgb)
}

/// Interleaved pixels to full-range planar YUV 4:4:4.
///
/// `rgb_offsets` gives the (r, g, b) channel positions within each pixel.
pub(crate) fn rgb_to_yuv444(pixels: &[u8], rgb_offsets: (usize, usize, usize), out: &mut Vec<u8>) {
    let (ro, go, bo) = rgb_offsets;
    let count = pixels.len() / 3;
    out.clear();
    out.resize(count * 3, 0);
    let (y_plane, rest) = out.split_at_mut(count);
    let (u_plane, v_plane) = rest.split_at_mut(count);
    for (idx, px) in pixels.chunks_exact(3).enumerate() {
        let r = px[ro] as f32;
        let g = px[go] as f32;
        let b = px[bo] as f32;
        y_plane[idx] = clamp_to_u8(0.299 * r + 0.587 * g + 0.114 * b);
        u_plane[idx] = clamp_to_u8(-0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0);
        v_plane[idx] = clamp_to_u8(0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0);
    }
}

fn expand(y: u8, u: u8, v: u8, range: ColorRange) -> (f32, f32, f32) {
    let (y, u, v) = (y as f32, u as f32 - 128.0, v as f32 - 128.0);
    match range {
        ColorRange::Full => (y, u, v),
        ColorRange::Limited => (
            (y - 16.0) * 255.0 / 219.0,
            u * 255.0 / 224.0,
            v * 255.0 / 224.0,
        ),
    }
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_produces_gray() {
        let planes = [vec![128u8; 4], vec![128u8; 2]].concat();
        assert!(yuv_to_rgb(&planes, 2, 2, ChromaLayout::Yuv420, ColorRange::Full).is_err());

        let planes = [vec![128u8; 4], vec![128u8; 1], vec![128u8; 1]].concat();
        let rgb = yuv_to_rgb(&planes, 2, 2, ChromaLayout::Yuv420, ColorRange::Full)
            .expect("convert");
        assert_eq!(rgb, vec![128u8; 12]);
    }

    #[test]
    fn limited_range_stretches_to_full() {
        // Y plane, then U, then V for a 2x1 frame: black and white.
        let planes = [16u8, 235, 128, 128, 128, 128];
        let rgb = yuv_to_rgb(&planes, 2, 1, ChromaLayout::Yuv444, ColorRange::Limited)
            .expect("convert");
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn oversized_dimensions_do_not_overflow() {
        let huge = u32::MAX as usize;
        assert_eq!(ChromaLayout::Yuv444.frame_len(huge, huge), None);
        assert_eq!(ChromaLayout::Yuv420.frame_len(usize::MAX, 2), None);
        assert_eq!(ChromaLayout::Yuv420.frame_len(3, 3), Some(9 + 2 * 4));
        assert!(matches!(
            yuv_to_rgb(&[], huge, huge, ChromaLayout::Yuv444, ColorRange::Full),
            Err(PipelineError::Source(_))
        ));
    }

    #[test]
    fn full_range_round_trip_is_close() {
        let pixels = vec![255u8, 0, 0, 0, 255, 0, 0, 0, 255, 90, 140, 200];
        let mut planes = Vec::new();
        rgb_to_yuv444(&pixels, (0, 1, 2), &mut planes);
        let back = yuv_to_rgb(&planes, 4, 1, ChromaLayout::Yuv444, ColorRange::Full)
            .expect("convert");
        for (a, b) in pixels.iter().zip(&back) {
            assert!((*a as i16 - *b as i16).abs() <= 2, "{:?} vs {:?}", pixels, back);
        }
    }
}
