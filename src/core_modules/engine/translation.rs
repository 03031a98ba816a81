// THEORY:
// The `TranslationEngine` is a pure-Rust stitcher for photographs related by a planar
// shift: a camera panned across a distant scene, or a flatbed of overlapping scans.
// It exists so the crate is useful without any native stitching library, and it
// speaks the same native status codes such a library would.
//
// Key architectural principles & algorithm steps:
// 1.  **Luminance Planes**: Matching runs on a single f32 luminance plane per image.
//     Colour only matters again at compositing time.
// 2.  **Coarse-to-Fine Registration**: Each consecutive pair is registered by
//     maximising zero-mean normalised cross-correlation (NCC) over integer offsets.
//     An exhaustive search runs on the top of a 2x box pyramid, the best few peaks
//     survive non-maximum suppression, and each peak is refined one pyramid level at
//     a time within a +/-2 px window until full resolution is reached.
// 3.  **Overlap Floor**: An offset only counts if the two images share at least
//     `min_overlap` of the smaller image's area. Thin slivers correlate by chance.
// 4.  **Consistency Check**: Chaining pairwise offsets accumulates error. Every image
//     is checked against the one two steps ahead at the chained offset; if they no
//     longer agree, the parameter chain has drifted and the stitch is rejected.
// 5.  **Mode-Specific Compositing**: Panorama mode evens out exposure differences
//     between shots and feathers the seams. Scans mode keeps document pixels exactly
//     as captured and cuts hard seams halfway between image centres.

use super::{EngineStatus, StitchEngine, StitchMode};
use crate::config::EngineConfig;
use image::{Rgb, RgbImage};
use log::debug;

const GAIN_LIMITS: (f64, f64) = (0.5, 2.0);
const REFINE_RADIUS: i32 = 2;
/// Coarse peaks closer than this (in top-level pixels) are the same peak.
const SUPPRESSION_RADIUS: i32 = 2;
/// Pyramid levels stop before either side drops below this.
const MIN_LEVEL_SIDE: u32 = 8;

/// A placement of one image relative to another, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub dx: i32,
    pub dy: i32,
}

/// The outcome of registering one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Registration {
    /// Where the second image's origin falls in the first image's coordinates.
    pub offset: Offset,
    /// NCC at that offset, in [-1, 1].
    pub score: f32,
}

/// A single-channel f32 image.
#[derive(Debug, Clone)]
struct Plane {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Plane {
    fn luminance(image: &RgbImage) -> Self {
        let data = image
            .pixels()
            .map(|Rgb([r, g, b])| 0.299 * *r as f32 + 0.587 * *g as f32 + 0.114 * *b as f32)
            .collect();
        Self {
            width: image.width(),
            height: image.height(),
            data,
        }
    }

    fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }

    /// 2x2 box average. Odd trailing rows and columns are dropped.
    fn half(&self) -> Self {
        let (width, height) = (self.width / 2, self.height / 2);
        let w = self.width as usize;
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height as usize {
            let top = 2 * y * w;
            let bottom = top + w;
            for x in 0..width as usize {
                let sum = self.data[top + 2 * x]
                    + self.data[top + 2 * x + 1]
                    + self.data[bottom + 2 * x]
                    + self.data[bottom + 2 * x + 1];
                data.push(sum * 0.25);
            }
        }
        Self {
            width,
            height,
            data,
        }
    }
}

/// Zero-mean NCC of `b` placed at `offset` over `a`, or `None` if the overlap is
/// smaller than `min_area` pixels.
fn correlate(a: &Plane, b: &Plane, offset: Offset, min_area: f64) -> Option<f32> {
    let Offset { dx, dy } = offset;
    let x0 = dx.max(0);
    let x1 = (a.width as i32).min(dx + b.width as i32);
    let y0 = dy.max(0);
    let y1 = (a.height as i32).min(dy + b.height as i32);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let n = ((x1 - x0) * (y1 - y0)) as f64;
    if n < min_area {
        return None;
    }

    let (mut sa, mut sb, mut saa, mut sbb, mut sab) = (0f64, 0f64, 0f64, 0f64, 0f64);
    for y in y0..y1 {
        let row_a = (y as usize) * a.width as usize;
        let row_b = ((y - dy) as usize) * b.width as usize;
        for x in x0..x1 {
            let va = a.data[row_a + x as usize] as f64;
            let vb = b.data[row_b + (x - dx) as usize] as f64;
            sa += va;
            sb += vb;
            saa += va * va;
            sbb += vb * vb;
            sab += va * vb;
        }
    }

    let var_a = saa - sa * sa / n;
    let var_b = sbb - sb * sb / n;
    if var_a <= 1e-6 * n || var_b <= 1e-6 * n {
        // Featureless overlap: no evidence either way.
        return Some(0.0);
    }
    Some(((sab - sa * sb / n) / (var_a * var_b).sqrt()) as f32)
}

/// Mean luminance of `a` and `b` over their overlap at `offset`.
fn overlap_means(a: &Plane, b: &Plane, offset: Offset) -> Option<(f64, f64)> {
    let Offset { dx, dy } = offset;
    let x0 = dx.max(0);
    let x1 = (a.width as i32).min(dx + b.width as i32);
    let y0 = dy.max(0);
    let y1 = (a.height as i32).min(dy + b.height as i32);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let (mut sa, mut sb) = (0f64, 0f64);
    for y in y0..y1 {
        for x in x0..x1 {
            sa += a.data[(y as usize) * a.width as usize + x as usize] as f64;
            sb += b.data[((y - dy) as usize) * b.width as usize + (x - dx) as usize] as f64;
        }
    }
    let n = ((x1 - x0) * (y1 - y0)) as f64;
    Some((sa / n, sb / n))
}

/// Planar-translation stitcher.
#[derive(Debug, Clone, Default)]
pub struct TranslationEngine {
    config: EngineConfig,
}

impl TranslationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn min_area(&self, a: &Plane, b: &Plane) -> f64 {
        self.config.min_overlap as f64 * a.area().min(b.area())
    }

    /// Number of halvings until both images fit within `search_side`.
    fn pyramid_depth(&self, a: &Plane, b: &Plane) -> usize {
        let mut depth = 0;
        let (mut longest, mut shortest) = (
            a.width.max(a.height).max(b.width).max(b.height),
            a.width.min(a.height).min(b.width).min(b.height),
        );
        while longest > self.config.search_side && shortest / 2 >= MIN_LEVEL_SIDE {
            longest /= 2;
            shortest /= 2;
            depth += 1;
        }
        depth
    }

    /// Finds where `b` sits relative to `a`.
    pub fn register(&self, a: &RgbImage, b: &RgbImage) -> Option<Registration> {
        self.register_planes(&Plane::luminance(a), &Plane::luminance(b))
    }

    fn register_planes(&self, a: &Plane, b: &Plane) -> Option<Registration> {
        let depth = self.pyramid_depth(a, b);
        let mut pyramid_a = vec![a.clone()];
        let mut pyramid_b = vec![b.clone()];
        for level in 0..depth {
            let (next_a, next_b) = (pyramid_a[level].half(), pyramid_b[level].half());
            pyramid_a.push(next_a);
            pyramid_b.push(next_b);
        }

        let full_min_area = self.min_area(a, b);
        let level_min_area = |level: usize| full_min_area / 4f64.powi(level as i32);

        // Exhaustive search at the top level.
        let (top_a, top_b) = (&pyramid_a[depth], &pyramid_b[depth]);
        let top_min_area = level_min_area(depth);
        let mut scored = Vec::new();
        for dy in -(top_b.height as i32 - 1)..top_a.height as i32 {
            for dx in -(top_b.width as i32 - 1)..top_a.width as i32 {
                let offset = Offset { dx, dy };
                if let Some(score) = correlate(top_a, top_b, offset, top_min_area) {
                    scored.push(Registration { offset, score });
                }
            }
        }
        scored.sort_by(|l, r| r.score.total_cmp(&l.score));

        let mut peaks: Vec<Registration> = Vec::with_capacity(self.config.coarse_candidates);
        for candidate in scored {
            if peaks.len() == self.config.coarse_candidates {
                break;
            }
            let suppressed = peaks.iter().any(|p| {
                (p.offset.dx - candidate.offset.dx).abs() <= SUPPRESSION_RADIUS
                    && (p.offset.dy - candidate.offset.dy).abs() <= SUPPRESSION_RADIUS
            });
            if !suppressed {
                peaks.push(candidate);
            }
        }

        // Walk every surviving peak down the pyramid.
        peaks
            .into_iter()
            .filter_map(|peak| {
                let mut current = peak;
                for level in (0..depth).rev() {
                    let center = Offset {
                        dx: current.offset.dx * 2,
                        dy: current.offset.dy * 2,
                    };
                    current = self.best_near(
                        &pyramid_a[level],
                        &pyramid_b[level],
                        center,
                        level_min_area(level),
                    )?;
                }
                Some(current)
            })
            .max_by(|l, r| l.score.total_cmp(&r.score))
    }

    fn best_near(
        &self,
        a: &Plane,
        b: &Plane,
        center: Offset,
        min_area: f64,
    ) -> Option<Registration> {
        let mut best: Option<Registration> = None;
        for dy in -REFINE_RADIUS..=REFINE_RADIUS {
            for dx in -REFINE_RADIUS..=REFINE_RADIUS {
                let offset = Offset {
                    dx: center.dx + dx,
                    dy: center.dy + dy,
                };
                if let Some(score) = correlate(a, b, offset, min_area) {
                    if best.is_none_or(|current| score > current.score) {
                        best = Some(Registration { offset, score });
                    }
                }
            }
        }
        best
    }

    /// Rejects a placement chain that drifted or grew beyond the canvas limit.
    fn verify(&self, planes: &[Plane], positions: &[Offset]) -> Result<(), EngineStatus> {
        let (_, width, height) = canvas_bounds(planes, positions);
        if width as u64 * height as u64 > self.config.max_canvas_pixels {
            debug!("Composite of {width}x{height} exceeds the canvas limit");
            return Err(EngineStatus::ERR_CAMERA_PARAMS_ADJUST_FAIL);
        }

        let floor = self.config.match_threshold * self.config.consistency_ratio;
        for i in 0..planes.len().saturating_sub(2) {
            let j = i + 2;
            let chained = Offset {
                dx: positions[j].dx - positions[i].dx,
                dy: positions[j].dy - positions[i].dy,
            };
            let min_area = self.min_area(&planes[i], &planes[j]);
            if let Some(score) = correlate(&planes[i], &planes[j], chained, min_area) {
                if score < floor {
                    debug!(
                        "Images {i} and {j} disagree at their chained offset (score {score:.3})"
                    );
                    return Err(EngineStatus::ERR_CAMERA_PARAMS_ADJUST_FAIL);
                }
            }
        }
        Ok(())
    }
}

/// Top-left corner, width and height of the box enclosing every placed image.
fn canvas_bounds(planes: &[Plane], positions: &[Offset]) -> (Offset, u32, u32) {
    let min_x = positions.iter().map(|p| p.dx).min().unwrap_or(0);
    let min_y = positions.iter().map(|p| p.dy).min().unwrap_or(0);
    let max_x = planes
        .iter()
        .zip(positions)
        .map(|(plane, p)| p.dx + plane.width as i32)
        .max()
        .unwrap_or(0);
    let max_y = planes
        .iter()
        .zip(positions)
        .map(|(plane, p)| p.dy + plane.height as i32)
        .max()
        .unwrap_or(0);
    (
        Offset { dx: min_x, dy: min_y },
        (max_x - min_x) as u32,
        (max_y - min_y) as u32,
    )
}

/// Per-image exposure gains relative to the first image.
fn exposure_gains(planes: &[Plane], offsets: &[Offset]) -> Vec<f64> {
    let mut gains = Vec::with_capacity(planes.len());
    gains.push(1.0);
    for (i, offset) in offsets.iter().enumerate() {
        let previous = gains[i];
        let ratio = match overlap_means(&planes[i], &planes[i + 1], *offset) {
            Some((mean_a, mean_b)) if mean_b > 1.0 => mean_a / mean_b,
            _ => 1.0,
        };
        gains.push((previous * ratio).clamp(GAIN_LIMITS.0, GAIN_LIMITS.1));
    }
    gains
}

fn feather_weight(x: u32, y: u32, width: u32, height: u32) -> f32 {
    let horizontal = x.min(width - 1 - x) + 1;
    let vertical = y.min(height - 1 - y) + 1;
    horizontal.min(vertical) as f32
}

fn composite_feathered(
    images: &[&RgbImage],
    placements: &[(u32, u32)],
    gains: &[f64],
    width: u32,
    height: u32,
) -> RgbImage {
    let pixels = (width * height) as usize;
    let mut accum = vec![0f32; pixels * 3];
    let mut weights = vec![0f32; pixels];

    for ((image, &(px, py)), &gain) in images.iter().zip(placements).zip(gains) {
        let (w, h) = image.dimensions();
        for (x, y, Rgb(values)) in image.enumerate_pixels() {
            let index = ((py + y) * width + px + x) as usize;
            let weight = feather_weight(x, y, w, h);
            for c in 0..3 {
                accum[index * 3 + c] += weight * values[c] as f32 * gain as f32;
            }
            weights[index] += weight;
        }
    }

    RgbImage::from_fn(width, height, |x, y| {
        let index = (y * width + x) as usize;
        let weight = weights[index];
        if weight == 0.0 {
            return Rgb([0, 0, 0]);
        }
        let channel = |c: usize| (accum[index * 3 + c] / weight).round().clamp(0.0, 255.0) as u8;
        Rgb([channel(0), channel(1), channel(2)])
    })
}

fn composite_nearest_centre(
    images: &[&RgbImage],
    placements: &[(u32, u32)],
    width: u32,
    height: u32,
) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    let mut nearest = vec![f32::INFINITY; (width * height) as usize];

    for (image, &(px, py)) in images.iter().zip(placements) {
        let (w, h) = image.dimensions();
        let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
        for (x, y, pixel) in image.enumerate_pixels() {
            let distance = (x as f32 + 0.5 - cx).powi(2) + (y as f32 + 0.5 - cy).powi(2);
            let index = ((py + y) * width + px + x) as usize;
            if distance < nearest[index] {
                nearest[index] = distance;
                canvas.put_pixel(px + x, py + y, *pixel);
            }
        }
    }
    canvas
}

impl StitchEngine for TranslationEngine {
    fn name(&self) -> &str {
        "translation"
    }

    fn stitch(&self, images: &[RgbImage], mode: StitchMode) -> Result<RgbImage, EngineStatus> {
        let min_side = self.config.min_image_side;
        let usable: Vec<&RgbImage> = images
            .iter()
            .filter(|image| image.width() >= min_side && image.height() >= min_side)
            .collect();
        if usable.len() < 2 {
            return Err(EngineStatus::ERR_NEED_MORE_IMGS);
        }

        let planes: Vec<Plane> = usable.iter().map(|image| Plane::luminance(image)).collect();

        let mut offsets = Vec::with_capacity(planes.len() - 1);
        for (index, pair) in planes.windows(2).enumerate() {
            match self.register_planes(&pair[0], &pair[1]) {
                Some(registration) if registration.score >= self.config.match_threshold => {
                    debug!(
                        "Registered image {} onto {} at {:?} (score {:.3})",
                        index + 1,
                        index,
                        registration.offset,
                        registration.score
                    );
                    offsets.push(registration.offset);
                }
                Some(registration) => {
                    debug!(
                        "Images {} and {} do not match (best score {:.3})",
                        index,
                        index + 1,
                        registration.score
                    );
                    return Err(EngineStatus::ERR_HOMOGRAPHY_EST_FAIL);
                }
                None => return Err(EngineStatus::ERR_HOMOGRAPHY_EST_FAIL),
            }
        }

        let mut positions = vec![Offset { dx: 0, dy: 0 }];
        for offset in &offsets {
            let last = positions[positions.len() - 1];
            positions.push(Offset {
                dx: last.dx + offset.dx,
                dy: last.dy + offset.dy,
            });
        }
        self.verify(&planes, &positions)?;

        let (origin, width, height) = canvas_bounds(&planes, &positions);
        let placements: Vec<(u32, u32)> = positions
            .iter()
            .map(|p| ((p.dx - origin.dx) as u32, (p.dy - origin.dy) as u32))
            .collect();

        Ok(match mode {
            StitchMode::Panorama => {
                let gains = exposure_gains(&planes, &offsets);
                composite_feathered(&usable, &placements, &gains, width, height)
            }
            StitchMode::Scans => composite_nearest_centre(&usable, &placements, width, height),
        })
    }
}
