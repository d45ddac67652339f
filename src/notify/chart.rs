//! Result chart for notification mails: one bar per outcome, encoded as PNG.
//!
//! Mail clients render inline PNG but not SVG. The image carries no text;
//! the counters sit next to it in the mail body.

use anyhow::Result;

use crate::model::TestCounts;

pub const WIDTH: u32 = 420;
pub const HEIGHT: u32 = 240;
const BAR_WIDTH: u32 = 60;
const PLOT_TOP: u32 = 20;
const PLOT_BOTTOM: u32 = 220;

type Rgb = [u8; 3];

const BACKGROUND: Rgb = [0xff, 0xff, 0xff];
const AXIS: Rgb = [0x61, 0x61, 0x61];
pub const PASS: Rgb = [0x4c, 0xaf, 0x50];
pub const FAILURES: Rgb = [0xf4, 0x43, 0x36];
pub const ERRORS: Rgb = [0xff, 0x98, 0x00];
pub const SKIP: Rgb = [0x9e, 0x9e, 0x9e];

struct Canvas {
    pixels: Vec<u8>,
}

impl Canvas {
    fn new() -> Self {
        Canvas {
            pixels: BACKGROUND.repeat((WIDTH * HEIGHT) as usize),
        }
    }

    /// Fill `[x0, x1) x [y0, y1)`, clipped to the canvas.
    fn fill(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb) {
        for y in y0..y1.min(HEIGHT) {
            for x in x0..x1.min(WIDTH) {
                let i = ((y * WIDTH + x) * 3) as usize;
                self.pixels[i..i + 3].copy_from_slice(&color);
            }
        }
    }
}

/// Bars for passed, failures, errors and skip, scaled to the largest.
pub fn render_png(counts: &TestCounts) -> Result<Vec<u8>> {
    let bars = [
        (counts.passed(), PASS),
        (counts.failures, FAILURES),
        (counts.errors, ERRORS),
        (counts.skip, SKIP),
    ];
    let max = bars.iter().map(|b| b.0).max().unwrap_or(0).max(1);
    let plot_height = PLOT_BOTTOM - PLOT_TOP;
    let slot = WIDTH / bars.len() as u32;

    let mut canvas = Canvas::new();
    for (i, (value, color)) in bars.iter().enumerate() {
        let bar_height = (u64::from(*value) * u64::from(plot_height) / u64::from(max)) as u32;
        let x = i as u32 * slot + (slot - BAR_WIDTH) / 2;
        canvas.fill(x, PLOT_BOTTOM - bar_height, x + BAR_WIDTH, PLOT_BOTTOM, *color);
    }
    canvas.fill(0, PLOT_BOTTOM, WIDTH, PLOT_BOTTOM + 2, AXIS);

    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, WIDTH, HEIGHT);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&canvas.pixels)?;
    writer.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> (png::OutputInfo, Vec<u8>) {
        let mut reader = png::Decoder::new(bytes).read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        (info, buf)
    }

    fn pixel(buf: &[u8], x: u32, y: u32) -> Rgb {
        let i = ((y * WIDTH + x) * 3) as usize;
        [buf[i], buf[i + 1], buf[i + 2]]
    }

    fn bar_center(slot: u32) -> u32 {
        slot * (WIDTH / 4) + WIDTH / 8
    }

    #[test]
    fn encodes_an_rgb_png() {
        let bytes = render_png(&TestCounts::new(10, 1, 2, 0)).unwrap();
        assert!(bytes.starts_with(b"\x89PNG\r\n\x1a\n"));
        let (info, _) = decode(&bytes);
        assert_eq!((info.width, info.height), (WIDTH, HEIGHT));
        assert_eq!(info.color_type, png::ColorType::Rgb);
    }

    #[test]
    fn tallest_bar_fills_plot_and_empty_bar_is_absent() {
        let (_, buf) = decode(&render_png(&TestCounts::new(5, 0, 0, 0)).unwrap());
        assert_eq!(pixel(&buf, bar_center(0), PLOT_TOP), PASS);
        assert_eq!(pixel(&buf, bar_center(0), PLOT_TOP - 1), BACKGROUND);
        assert_eq!(pixel(&buf, bar_center(1), PLOT_BOTTOM - 1), BACKGROUND);
        assert_eq!(pixel(&buf, bar_center(1), PLOT_BOTTOM), AXIS);
    }

    #[test]
    fn bars_scale_to_the_largest_count() {
        // 7 passed, 2 failures, 1 error.
        let (_, buf) = decode(&render_png(&TestCounts::new(10, 1, 2, 0)).unwrap());
        let top = |slot: u32| {
            (PLOT_TOP..PLOT_BOTTOM)
                .find(|&y| pixel(&buf, bar_center(slot), y) != BACKGROUND)
                .unwrap_or(PLOT_BOTTOM)
        };
        assert_eq!(top(0), PLOT_TOP);
        assert_eq!(pixel(&buf, bar_center(1), PLOT_BOTTOM - 1), FAILURES);
        assert!(top(1) > top(0));
        assert!(top(2) > top(1));
        assert_eq!(top(3), PLOT_BOTTOM);
    }
}
