//! Gaze marker burned into scene frames
//!
//! A red ring at the gaze point, drawn into the BGR24 buffer before the
//! frame is encoded. Parts of the ring outside the frame are clipped.

use crate::capture::VideoSample;

/// Ring radius in pixels
pub const MARKER_RADIUS: f64 = 10.0;

/// Ring stroke width in pixels
pub const MARKER_THICKNESS: f64 = 2.0;

/// Marker colour in BGR order
pub const MARKER_BGR: [u8; 3] = [0, 0, 255];

/// Draw the gaze ring centred on (`x`, `y`) scene pixels
///
/// Coordinates are truncated to whole pixels. Non-finite coordinates and
/// malformed frames are left untouched.
pub fn draw_gaze_marker(frame: &mut VideoSample, x: f64, y: f64) {
    if !x.is_finite() || !y.is_finite() || !frame.is_well_formed() {
        return;
    }

    let width = frame.resolution.width as i64;
    let height = frame.resolution.height as i64;
    let cx = x as i64;
    let cy = y as i64;
    let reach = (MARKER_RADIUS + MARKER_THICKNESS).ceil() as i64;

    let x_range = (cx - reach).max(0)..=(cx + reach).min(width - 1);
    let y_range = (cy - reach).max(0)..=(cy + reach).min(height - 1);
    if x_range.is_empty() || y_range.is_empty() {
        return;
    }

    for py in y_range {
        for px in x_range.clone() {
            let dx = (px - cx) as f64;
            let dy = (py - cy) as f64;
            let distance = (dx * dx + dy * dy).sqrt();
            if (distance - MARKER_RADIUS).abs() <= MARKER_THICKNESS / 2.0 {
                let offset = ((py * width + px) * 3) as usize;
                frame.pixels[offset..offset + 3].copy_from_slice(&MARKER_BGR);
            }
        }
    }
}
