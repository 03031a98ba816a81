// THEORY:
// The `Sharpener` is the per-image preprocessing stage. It applies an unsharp mask to
// every photograph before stitching so that the engine's feature matching has crisp
// edges to work with, and it normalizes every frame to three channels so that no later
// stage needs a grayscale special case.
//
// Key architectural principles:
// 1.  **Pure Function**: `sharpen` reads nothing but its input and its own immutable
//     configuration. A single `Sharpener` is shared by every worker thread.
// 2.  **8-bit Intermediates**: The blur and the residual are each rounded and clamped
//     to 0..=255 before the final weighted sum, exactly as an 8-bit image pipeline
//     would store them. In particular the residual `original - blur` saturates at
//     zero, so only the bright side of each edge feeds the weighted sum.
// 3.  **Separable Blur**: The Gaussian is applied as a horizontal then a vertical 1D
//     pass with mirrored borders (`dcb|abcd|cba`), which is equivalent to the 2D
//     kernel and far cheaper.

use crate::config::SharpenConfig;
use crate::core_modules::frame::Frame;
use image::RgbImage;

/// Unsharp-mask filter with a precomputed Gaussian kernel.
#[derive(Debug, Clone)]
pub struct Sharpener {
    config: SharpenConfig,
    kernel: Vec<f32>,
}

impl Sharpener {
    pub fn new(config: SharpenConfig) -> Self {
        let kernel = gaussian_kernel(config.sigma);
        Self { config, kernel }
    }

    pub fn config(&self) -> &SharpenConfig {
        &self.config
    }

    /// Sharpens `frame` and returns it as a three-channel image of the same size.
    pub fn sharpen(&self, mut frame: Frame) -> RgbImage {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let channels = frame.channels() as usize;

        match &mut frame {
            Frame::Gray(image) => self.unsharp(image, width, height, channels),
            Frame::Rgb(image) => self.unsharp(image, width, height, channels),
        }

        frame.into_rgb()
    }

    /// Applies the mask to an interleaved buffer in place.
    fn unsharp(&self, pixels: &mut [u8], width: usize, height: usize, channels: usize) {
        if width == 0 || height == 0 {
            return;
        }

        let blurred = gaussian_blur(pixels, width, height, channels, &self.kernel);
        let SharpenConfig {
            original_weight,
            residual_weight,
            bias,
            ..
        } = self.config;

        for (value, &blur) in pixels.iter_mut().zip(blurred.iter()) {
            let residual = value.saturating_sub(blur) as f32;
            *value = saturate(original_weight * *value as f32 + residual_weight * residual + bias);
        }
    }
}

impl Default for Sharpener {
    fn default() -> Self {
        Self::new(SharpenConfig::default())
    }
}

/// Normalised 1D Gaussian kernel. An 8-bit image gets a radius of three sigmas,
/// giving `2 * round(3 * sigma) + 1` taps (7 taps for sigma = 1).
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let size = ((sigma * 6.0 + 1.0).round() as usize) | 1;
    let center = (size / 2) as f32;
    let scale = -0.5 / (sigma * sigma);

    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (scale * d * d).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for tap in &mut kernel {
        *tap /= sum;
    }
    kernel
}

/// Separable Gaussian blur over an interleaved 8-bit buffer.
fn gaussian_blur(
    src: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    kernel: &[f32],
) -> Vec<u8> {
    let radius = (kernel.len() / 2) as isize;
    let stride = width * channels;

    // Horizontal pass, kept in f32 so rounding happens once per pass.
    let mut horizontal = vec![0f32; src.len()];
    for y in 0..height {
        let row = &src[y * stride..(y + 1) * stride];
        let out = &mut horizontal[y * stride..(y + 1) * stride];
        for x in 0..width {
            for c in 0..channels {
                let mut acc = 0f32;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = reflect_101(x as isize + k as isize - radius, width);
                    acc += weight * row[sx * channels + c] as f32;
                }
                out[x * channels + c] = acc;
            }
        }
    }

    let horizontal: Vec<u8> = horizontal.into_iter().map(saturate).collect();

    let mut blurred = vec![0u8; src.len()];
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                let mut acc = 0f32;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = reflect_101(y as isize + k as isize - radius, height);
                    acc += weight * horizontal[sy * stride + x * channels + c] as f32;
                }
                blurred[y * stride + x * channels + c] = saturate(acc);
            }
        }
    }
    blurred
}

/// Mirrors an out-of-range index around the edge without repeating the edge pixel.
fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let period = 2 * last;
    let mut i = index.rem_euclid(period);
    if i > last {
        i = period - i;
    }
    i as usize
}

fn saturate(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
