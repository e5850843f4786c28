//! Frame placement math for composing a source clip onto the output canvas.
//!
//! All centers use integer halves (`dimension / 2`), so odd source dimensions can
//! shift the crop or offset by one pixel. That is accepted rather than corrected.

use crate::config::{FillAxis, LayoutStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Where the transformed clip lands on the canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    pub crop: CropRect,
    pub scale_factor: f64,
    pub scaled_width: u32,
    pub scaled_height: u32,
    /// Offsets of the scaled clip's top-left corner; negative when it overflows the canvas
    pub offset_x: i64,
    pub offset_y: i64,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

/// Centered square of side `min(width, height)`
pub fn center_square(width: u32, height: u32) -> CropRect {
    let side = width.min(height);
    let half = side / 2;
    let x = (width / 2).saturating_sub(half);
    let y = (height / 2).saturating_sub(half);
    CropRect { x, y, width: side, height: side }
}

/// Compute the placement of a `width x height` source on the canvas
pub fn compute_layout(
    strategy: LayoutStrategy,
    source: (u32, u32),
    canvas: (u32, u32),
    fill_axis: FillAxis,
    max_scale_factor: f64,
) -> Layout {
    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let (canvas_w, canvas_h) = canvas;

    let (crop, factor) = match strategy {
        LayoutStrategy::CropFill => {
            let crop = center_square(src_w, src_h);
            let target = match fill_axis {
                FillAxis::Height => canvas_h,
                FillAxis::Width => canvas_w,
            };
            (crop, target as f64 / crop.width as f64)
        }
        LayoutStrategy::PadFit => {
            let crop = CropRect { x: 0, y: 0, width: src_w, height: src_h };
            let factor = (canvas_w as f64 / src_w as f64).min(canvas_h as f64 / src_h as f64);
            (crop, factor)
        }
    };

    let factor = factor.min(max_scale_factor);
    let scaled_width = ((crop.width as f64 * factor).round() as u32).max(1);
    let scaled_height = ((crop.height as f64 * factor).round() as u32).max(1);

    Layout {
        crop,
        scale_factor: factor,
        scaled_width,
        scaled_height,
        offset_x: (canvas_w as i64 - scaled_width as i64) / 2,
        offset_y: (canvas_h as i64 - scaled_height as i64) / 2,
        canvas_width: canvas_w,
        canvas_height: canvas_h,
    }
}

impl Layout {
    /// Filter graph producing a `[v]` stream of exactly canvas size from input 0
    pub fn filter_complex(&self, background: &str, fps: u32) -> String {
        format!(
            "color=c={bg}:s={cw}x{ch}:r={fps}[bg];\
             [0:v]crop={w}:{h}:{x}:{y},scale={sw}:{sh},setsar=1[fg];\
             [bg][fg]overlay=x={ox}:y={oy}:shortest=1,format=yuv420p[v]",
            bg = background,
            cw = self.canvas_width,
            ch = self.canvas_height,
            fps = fps,
            w = self.crop.width,
            h = self.crop.height,
            x = self.crop.x,
            y = self.crop.y,
            sw = self.scaled_width,
            sh = self.scaled_height,
            ox = self.offset_x,
            oy = self.offset_y,
        )
    }

    /// Visible region of the scaled clip after clipping to the canvas
    pub fn visible_size(&self) -> (u32, u32) {
        let visible = |offset: i64, len: u32, canvas: u32| -> u32 {
            let start = offset.max(0);
            let end = (offset + len as i64).min(canvas as i64);
            (end - start).max(0) as u32
        };
        (
            visible(self.offset_x, self.scaled_width, self.canvas_width),
            visible(self.offset_y, self.scaled_height, self.canvas_height),
        )
    }
}

/// Simple scale-and-pad chain used by the fallback encode
pub fn pad_fit_filter(canvas: (u32, u32), background: &str) -> String {
    let (w, h) = canvas;
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2,\
         pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color={bg},setsar=1,format=yuv420p",
        w = w,
        h = h,
        bg = background
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CANVAS: (u32, u32) = (1080, 1920);

    #[test]
    fn test_square_source_fills_height() {
        let layout = compute_layout(LayoutStrategy::CropFill, (640, 640), CANVAS, FillAxis::Height, 3.0);
        assert_eq!(layout.crop, CropRect { x: 0, y: 0, width: 640, height: 640 });
        assert_eq!((layout.scaled_width, layout.scaled_height), (1920, 1920));
        assert_eq!(layout.offset_x, -420);
        assert_eq!(layout.offset_y, 0);
        assert_eq!(layout.visible_size(), (1080, 1920));
    }

    #[test]
    fn test_landscape_crop_is_centered() {
        let layout = compute_layout(LayoutStrategy::CropFill, (1280, 720), CANVAS, FillAxis::Height, 3.0);
        assert_eq!(layout.crop, CropRect { x: 280, y: 0, width: 720, height: 720 });
    }

    #[test]
    fn test_odd_dimensions_use_integer_centers() {
        let crop = center_square(641, 480);
        // 641/2 - 480/2 = 320 - 240
        assert_eq!(crop, CropRect { x: 80, y: 0, width: 480, height: 480 });
    }

    #[test]
    fn test_upscale_is_clamped() {
        let layout = compute_layout(LayoutStrategy::CropFill, (240, 240), CANVAS, FillAxis::Height, 3.0);
        assert_eq!(layout.scale_factor, 3.0);
        assert_eq!((layout.scaled_width, layout.scaled_height), (720, 720));
        assert_eq!((layout.offset_x, layout.offset_y), (180, 600));
    }

    #[test]
    fn test_fill_width_axis() {
        let layout = compute_layout(LayoutStrategy::CropFill, (640, 640), CANVAS, FillAxis::Width, 3.0);
        assert_eq!((layout.scaled_width, layout.scaled_height), (1080, 1080));
        assert_eq!((layout.offset_x, layout.offset_y), (0, 420));
    }

    #[test]
    fn test_pad_fit_keeps_whole_frame() {
        let layout = compute_layout(LayoutStrategy::PadFit, (1920, 1080), CANVAS, FillAxis::Height, 3.0);
        assert_eq!(layout.crop.width, 1920);
        assert_eq!((layout.scaled_width, layout.scaled_height), (1080, 608));
        assert_eq!(layout.offset_x, 0);
    }

    #[test]
    fn test_filter_graph_declares_canvas() {
        let layout = compute_layout(LayoutStrategy::CropFill, (640, 640), CANVAS, FillAxis::Height, 3.0);
        let graph = layout.filter_complex("black", 30);
        assert!(graph.starts_with("color=c=black:s=1080x1920:r=30[bg]"));
        assert!(graph.contains("crop=640:640:0:0,scale=1920:1920"));
        assert!(graph.contains("overlay=x=-420:y=0:shortest=1"));
        assert!(graph.ends_with("[v]"));
    }

    #[test]
    fn test_pad_filter_targets_canvas() {
        let filter = pad_fit_filter(CANVAS, "black");
        assert!(filter.contains("pad=1080:1920"));
    }

    proptest! {
        /// The composed frame is the canvas, whatever the input aspect ratio
        #[test]
        fn test_output_is_always_canvas_sized(
            width in 16u32..4096,
            height in 16u32..4096,
            pad_fit in prop::bool::ANY,
            fill_width in prop::bool::ANY,
        ) {
            let strategy = if pad_fit { LayoutStrategy::PadFit } else { LayoutStrategy::CropFill };
            let axis = if fill_width { FillAxis::Width } else { FillAxis::Height };
            let layout = compute_layout(strategy, (width, height), CANVAS, axis, 3.0);

            prop_assert_eq!((layout.canvas_width, layout.canvas_height), CANVAS);
            let (vis_w, vis_h) = layout.visible_size();
            prop_assert!(vis_w <= CANVAS.0 && vis_h <= CANVAS.1);
            prop_assert!(vis_w > 0 && vis_h > 0);
            prop_assert!(layout.scale_factor <= 3.0);
        }

        #[test]
        fn test_crop_stays_inside_source(width in 1u32..4096, height in 1u32..4096) {
            let crop = center_square(width, height);
            prop_assert_eq!(crop.width, width.min(height));
            prop_assert!(crop.x + crop.width <= width);
            prop_assert!(crop.y + crop.height <= height);
        }

        #[test]
        fn test_pad_fit_never_overflows(width in 16u32..4096, height in 16u32..4096) {
            let layout = compute_layout(LayoutStrategy::PadFit, (width, height), CANVAS, FillAxis::Height, 3.0);
            prop_assert!(layout.offset_x >= 0 && layout.offset_y >= 0);
            prop_assert!(layout.scaled_width <= CANVAS.0 && layout.scaled_height <= CANVAS.1);
        }
    }
}
