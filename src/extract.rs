//! Star extraction from a single luminance plane.
//!
//! Pipeline:
//! 1. Estimate a smooth background on a mesh of boxes (sigma-clipped mode),
//!    median filter the mesh and interpolate it back to full resolution
//! 2. Median filter the image with a 2x2 footprint to kill hot pixels and
//!    cosmic-ray hits
//! 3. Subtract the background
//! 4. Detect with a matched 3x3 filter above `threshold * global_rms` and
//!    label 8-connected components of at least `min_area` pixels
//! 5. Measure barycentre, flux and moment ellipse of every component
//! 6. Drop flagged, over-elongated and undersized detections, brightest first

use crate::fits::FitsImage;
use crate::sources::{Source, SourceFlags, SourceList};
use std::collections::HashMap;

/// Smoothing kernel used for detection.
const DETECTION_KERNEL: [[f32; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];

/// Configuration for star extraction.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Width of a background mesh box, pixels.
    /// Default: 64
    pub mesh_width: usize,
    /// Height of a background mesh box, pixels.
    /// Default: 64
    pub mesh_height: usize,
    /// Median filter window applied to the background mesh, in boxes.
    /// Default: 3
    pub mesh_filter_width: usize,
    /// Default: 3
    pub mesh_filter_height: usize,
    /// Side of the median filter footprint applied to the image before
    /// detection. 1 disables it.
    /// Default: 2
    pub median_filter_size: usize,
    /// Detection threshold in units of the global background rms.
    /// Default: 4.0
    pub threshold: f32,
    /// Minimum number of pixels in a detection.
    /// Default: 10
    pub min_area: usize,
    /// Clipping factor for the background statistics.
    /// Default: 3.0
    pub clip_sigma: f32,
    /// Upper bound on clipping passes per mesh box.
    /// Default: 20
    pub clip_iterations: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mesh_width: 64,
            mesh_height: 64,
            mesh_filter_width: 3,
            mesh_filter_height: 3,
            median_filter_size: 2,
            threshold: 4.0,
            min_area: 10,
            clip_sigma: 3.0,
            clip_iterations: 20,
        }
    }
}

/// Extract probable stars from `image`, brightest first.
pub fn extract_stars(image: &FitsImage, config: &ExtractionConfig) -> SourceList {
    let (w, h) = (image.width, image.height);

    let background = Background::estimate(&image.data, w, h, config);
    let filtered = median_filter(&image.data, w, h, config.median_filter_size);
    let subtracted: Vec<f32> = filtered
        .iter()
        .zip(&background.level)
        .map(|(&v, &b)| v - b)
        .collect();

    let detections = detect_sources(
        &subtracted,
        w,
        h,
        config.threshold * background.global_rms,
        config.min_area,
    );
    let num_detections = detections.len();

    let mut sources = SourceList::new(detections);
    sources.reject_flagged();
    sources.reject_elongated();
    sources.reject_compact();
    sources.sort_by_flux();

    tracing::info!(
        "extracted {} stars from {} detections (background {:.1}, rms {:.2})",
        sources.len(),
        num_detections,
        background.global_level,
        background.global_rms
    );
    sources
}

// ---------------------------------------------------------------------------
// Background
// ---------------------------------------------------------------------------

/// Spatially varying background model.
#[derive(Debug, Clone)]
pub struct Background {
    /// Background level at every pixel, row-major.
    pub level: Vec<f32>,
    /// Mean of the mesh levels.
    pub global_level: f32,
    /// Mean of the mesh rms values.
    pub global_rms: f32,
}

impl Background {
    pub fn estimate(data: &[f32], width: usize, height: usize, config: &ExtractionConfig) -> Self {
        let bw = config.mesh_width.max(1);
        let bh = config.mesh_height.max(1);
        let nx = width.div_ceil(bw).max(1);
        let ny = height.div_ceil(bh).max(1);

        let mut levels = vec![f32::NAN; nx * ny];
        let mut rmss = vec![f32::NAN; nx * ny];
        let mut vals: Vec<f32> = Vec::with_capacity(bw * bh);
        for by in 0..ny {
            for bx in 0..nx {
                vals.clear();
                for y in by * bh..((by + 1) * bh).min(height) {
                    let row = &data[y * width..(y + 1) * width];
                    vals.extend(
                        row[bx * bw..((bx + 1) * bw).min(width)]
                            .iter()
                            .copied()
                            .filter(|v| v.is_finite()),
                    );
                }
                if let Some((level, rms)) =
                    clipped_mode(&mut vals, config.clip_sigma, config.clip_iterations)
                {
                    levels[by * nx + bx] = level;
                    rmss[by * nx + bx] = rms;
                }
            }
        }
        fill_missing(&mut levels);
        fill_missing(&mut rmss);

        let levels = filter_mesh(&levels, nx, ny, config.mesh_filter_width, config.mesh_filter_height);
        let rmss = filter_mesh(&rmss, nx, ny, config.mesh_filter_width, config.mesh_filter_height);

        let global_level = levels.iter().sum::<f32>() / levels.len() as f32;
        let global_rms = rmss.iter().sum::<f32>() / rmss.len() as f32;

        Background {
            level: interpolate_mesh(&levels, nx, ny, bw, bh, width, height),
            global_level,
            global_rms,
        }
    }
}

/// Iteratively clipped background estimate of one mesh box.
///
/// Returns `(level, rms)`. The level is the mode estimate
/// `2.5 * median - 1.5 * mean` unless the clipped distribution is skewed by
/// crowding, in which case the median is used.
fn clipped_mode(values: &mut Vec<f32>, k: f32, iterations: usize) -> Option<(f32, f32)> {
    if values.is_empty() {
        return None;
    }
    let (mut mean, mut sigma) = mean_sigma(values);
    for _ in 0..iterations {
        if sigma <= 0.0 {
            break;
        }
        let (lo, hi) = (mean - k * sigma, mean + k * sigma);
        let before = values.len();
        values.retain(|&v| v >= lo && v <= hi);
        if values.is_empty() {
            return None;
        }
        (mean, sigma) = mean_sigma(values);
        if values.len() == before {
            break;
        }
    }

    values.sort_unstable_by(f32::total_cmp);
    let n = values.len();
    let median = if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    };

    let level = if sigma <= 0.0 {
        mean
    } else if ((mean - median) / sigma).abs() < 0.3 {
        2.5 * median - 1.5 * mean
    } else {
        median
    };
    Some((level, sigma))
}

fn mean_sigma(values: &[f32]) -> (f32, f32) {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var.sqrt() as f32)
}

/// Replace NaN mesh entries (boxes without valid pixels) by the mean of the
/// valid ones, or 0 when there are none.
fn fill_missing(mesh: &mut [f32]) {
    let valid: Vec<f32> = mesh.iter().copied().filter(|v| v.is_finite()).collect();
    let fill = if valid.is_empty() {
        0.0
    } else {
        valid.iter().sum::<f32>() / valid.len() as f32
    };
    for v in mesh.iter_mut().filter(|v| !v.is_finite()) {
        *v = fill;
    }
}

/// Centred median filter over the mesh, window clamped at the edges.
fn filter_mesh(mesh: &[f32], nx: usize, ny: usize, fw: usize, fh: usize) -> Vec<f32> {
    if fw <= 1 && fh <= 1 {
        return mesh.to_vec();
    }
    let (hx, hy) = (fw / 2, fh / 2);
    let mut window = Vec::with_capacity(fw * fh);
    let mut out = vec![0.0f32; mesh.len()];
    for y in 0..ny {
        for x in 0..nx {
            window.clear();
            for yy in y.saturating_sub(hy)..(y + hy + 1).min(ny) {
                for xx in x.saturating_sub(hx)..(x + hx + 1).min(nx) {
                    window.push(mesh[yy * nx + xx]);
                }
            }
            window.sort_unstable_by(f32::total_cmp);
            let n = window.len();
            out[y * nx + x] = if n % 2 == 0 {
                (window[n / 2 - 1] + window[n / 2]) / 2.0
            } else {
                window[n / 2]
            };
        }
    }
    out
}

/// Bilinear interpolation between mesh box centres.
fn interpolate_mesh(
    mesh: &[f32],
    nx: usize,
    ny: usize,
    bw: usize,
    bh: usize,
    width: usize,
    height: usize,
) -> Vec<f32> {
    let mut background = vec![0.0f32; width * height];
    let (half_bw, half_bh) = (bw as f32 / 2.0, bh as f32 / 2.0);

    for y in 0..height {
        let by_f = (y as f32 + 0.5 - half_bh) / bh as f32;
        let by0 = (by_f.floor().max(0.0) as usize).min(ny - 1);
        let by1 = (by0 + 1).min(ny - 1);
        let fy = (by_f - by0 as f32).clamp(0.0, 1.0);

        for x in 0..width {
            let bx_f = (x as f32 + 0.5 - half_bw) / bw as f32;
            let bx0 = (bx_f.floor().max(0.0) as usize).min(nx - 1);
            let bx1 = (bx0 + 1).min(nx - 1);
            let fx = (bx_f - bx0 as f32).clamp(0.0, 1.0);

            let m00 = mesh[by0 * nx + bx0];
            let m10 = mesh[by0 * nx + bx1];
            let m01 = mesh[by1 * nx + bx0];
            let m11 = mesh[by1 * nx + bx1];

            background[y * width + x] = m00 * (1.0 - fx) * (1.0 - fy)
                + m10 * fx * (1.0 - fy)
                + m01 * (1.0 - fx) * fy
                + m11 * fx * fy;
        }
    }
    background
}

// ---------------------------------------------------------------------------
// Median filter
// ---------------------------------------------------------------------------

/// Median filter with a `size x size` footprint.
///
/// The footprint spans offsets `-(size / 2) ..= size - 1 - size / 2` on both
/// axes, borders are mirrored (`d c b a | a b c d`), and for an even number of
/// samples the upper of the two central values is taken.
pub fn median_filter(data: &[f32], width: usize, height: usize, size: usize) -> Vec<f32> {
    if size <= 1 || width == 0 || height == 0 {
        return data.to_vec();
    }
    let lo = (size / 2) as isize;
    let rank = size * size / 2;
    let mut window = Vec::with_capacity(size * size);
    let mut out = vec![0.0f32; data.len()];

    for y in 0..height {
        for x in 0..width {
            window.clear();
            for dy in 0..size as isize {
                let yy = reflect(y as isize + dy - lo, height);
                for dx in 0..size as isize {
                    let xx = reflect(x as isize + dx - lo, width);
                    window.push(data[yy * width + xx]);
                }
            }
            let (_, median, _) = window.select_nth_unstable_by(rank, f32::total_cmp);
            out[y * width + x] = *median;
        }
    }
    out
}

/// Mirror an out-of-range index back into `0..n`, edge sample repeated.
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i - 1;
    }
    i as usize
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Detect and measure every component of `image` (background already
/// subtracted) whose matched-filtered signal exceeds `threshold`.
///
/// `threshold` is in the units of the image noise; the filtered image is
/// compared against `threshold * sqrt(sum(k^2))`, the noise of the kernel
/// response. Measurements use the unfiltered pixels.
pub fn detect_sources(
    image: &[f32],
    width: usize,
    height: usize,
    threshold: f32,
    min_area: usize,
) -> Vec<Source> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let kernel_norm = DETECTION_KERNEL
        .iter()
        .flatten()
        .map(|k| k * k)
        .sum::<f32>()
        .sqrt();
    let filtered = convolve3(image, width, height);
    let limit = threshold * kernel_norm;
    let mask: Vec<bool> = filtered.iter().map(|&v| v > limit).collect();

    let labels = label_connected_components(&mask, width, height);
    let num_labels = labels.iter().copied().max().unwrap_or(0) as usize;
    measure_components(image, &labels, num_labels, width, height, min_area)
}

/// Correlate with the 3x3 detection kernel; pixels outside the image are 0.
fn convolve3(image: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; image.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f32;
            for (ky, krow) in DETECTION_KERNEL.iter().enumerate() {
                let yy = y as isize + ky as isize - 1;
                if yy < 0 || yy >= height as isize {
                    continue;
                }
                for (kx, &k) in krow.iter().enumerate() {
                    let xx = x as isize + kx as isize - 1;
                    if xx < 0 || xx >= width as isize {
                        continue;
                    }
                    let v = image[yy as usize * width + xx as usize];
                    if v.is_finite() {
                        acc += k * v;
                    }
                }
            }
            out[y * width + x] = acc;
        }
    }
    out
}

/// Label 8-connected components of a binary mask using two-pass union-find.
/// Background is 0; components are numbered from 1 in raster order.
fn label_connected_components(mask: &[bool], width: usize, height: usize) -> Vec<u32> {
    fn find(parent: &mut [u32], mut x: u32) -> u32 {
        while parent[x as usize] != x {
            parent[x as usize] = parent[parent[x as usize] as usize];
            x = parent[x as usize];
        }
        x
    }

    fn union(parent: &mut [u32], a: u32, b: u32) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra < rb {
            parent[rb as usize] = ra;
        } else if rb < ra {
            parent[ra as usize] = rb;
        }
    }

    let w = width;
    let mut labels = vec![0u32; width * height];
    // index 0 reserved for background
    let mut parent: Vec<u32> = vec![0];

    for row in 0..height {
        for col in 0..width {
            let idx = row * w + col;
            if !mask[idx] {
                continue;
            }
            let mut neighbours = [0u32; 4];
            let mut count = 0;
            let mut push = |l: u32| {
                if l > 0 {
                    neighbours[count] = l;
                    count += 1;
                }
            };
            if col > 0 {
                push(labels[idx - 1]);
            }
            if row > 0 {
                push(labels[idx - w]);
                if col > 0 {
                    push(labels[idx - w - 1]);
                }
                if col + 1 < w {
                    push(labels[idx - w + 1]);
                }
            }

            let neighbours = &neighbours[..count];
            match neighbours.iter().copied().min() {
                None => {
                    let label = parent.len() as u32;
                    parent.push(label);
                    labels[idx] = label;
                }
                Some(min_label) => {
                    labels[idx] = min_label;
                    for &l in neighbours {
                        union(&mut parent, min_label, l);
                    }
                }
            }
        }
    }

    // Flatten to sequential labels
    let mut root_map = HashMap::new();
    for label in labels.iter_mut().filter(|l| **l > 0) {
        let root = find(&mut parent, *label);
        let next = root_map.len() as u32 + 1;
        *label = *root_map.entry(root).or_insert(next);
    }
    labels
}

/// Per-component accumulators. Moments are taken relative to the first pixel
/// of the component to keep the sums small.
#[derive(Clone)]
struct Moments {
    npix: usize,
    ref_col: usize,
    ref_row: usize,
    sum: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    peak: f64,
    min_col: usize,
    max_col: usize,
    min_row: usize,
    max_row: usize,
}

impl Default for Moments {
    fn default() -> Self {
        Moments {
            npix: 0,
            ref_col: 0,
            ref_row: 0,
            sum: 0.0,
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_yy: 0.0,
            sum_xy: 0.0,
            peak: f64::NEG_INFINITY,
            min_col: usize::MAX,
            max_col: 0,
            min_row: usize::MAX,
            max_row: 0,
        }
    }
}

fn measure_components(
    image: &[f32],
    labels: &[u32],
    num_labels: usize,
    width: usize,
    height: usize,
    min_area: usize,
) -> Vec<Source> {
    let mut acc = vec![Moments::default(); num_labels + 1];

    for (idx, (&label, &value)) in labels.iter().zip(image).enumerate() {
        if label == 0 {
            continue;
        }
        let (col, row) = (idx % width, idx / width);
        let m = &mut acc[label as usize];
        if m.npix == 0 {
            m.ref_col = col;
            m.ref_row = row;
        }
        m.npix += 1;
        m.min_col = m.min_col.min(col);
        m.max_col = m.max_col.max(col);
        m.min_row = m.min_row.min(row);
        m.max_row = m.max_row.max(row);
        if !value.is_finite() {
            continue;
        }
        let v = value as f64;
        let dx = col as f64 - m.ref_col as f64;
        let dy = row as f64 - m.ref_row as f64;
        m.sum += v;
        m.sum_x += dx * v;
        m.sum_y += dy * v;
        m.sum_xx += dx * dx * v;
        m.sum_yy += dy * dy * v;
        m.sum_xy += dx * dy * v;
        m.peak = m.peak.max(v);
    }

    acc.into_iter()
        .skip(1)
        .filter(|m| m.npix >= min_area)
        .map(|m| moments_to_source(&m, width, height))
        .collect()
}

fn moments_to_source(m: &Moments, width: usize, height: usize) -> Source {
    let mut flag = SourceFlags::empty();
    if m.min_col == 0 || m.min_row == 0 || m.max_col + 1 >= width || m.max_row + 1 >= height {
        flag.insert(SourceFlags::TRUNCATED);
    }

    if m.sum <= 0.0 {
        flag.insert(SourceFlags::NEGATIVE_FLUX);
        return Source {
            x: (m.min_col + m.max_col) as f64 / 2.0,
            y: (m.min_row + m.max_row) as f64 / 2.0,
            flux: m.sum,
            peak: m.peak,
            npix: m.npix,
            a: 0.0,
            b: 0.0,
            theta: 0.0,
            flag,
        };
    }

    let dx_bar = m.sum_x / m.sum;
    let dy_bar = m.sum_y / m.sum;
    let mut x2 = m.sum_xx / m.sum - dx_bar * dx_bar;
    let mut y2 = m.sum_yy / m.sum - dy_bar * dy_bar;
    let xy = m.sum_xy / m.sum - dx_bar * dy_bar;

    // A single row or column of pixels has a zero-width ellipse; widen it to
    // the variance of a uniform pixel.
    if x2 * y2 - xy * xy < 1.0 / 144.0 {
        x2 += 1.0 / 12.0;
        y2 += 1.0 / 12.0;
        flag.insert(SourceFlags::SINGULAR);
    }

    let t1 = (x2 + y2) / 2.0;
    let t2 = (((x2 - y2) / 2.0).powi(2) + xy * xy).sqrt();

    Source {
        x: m.ref_col as f64 + dx_bar,
        y: m.ref_row as f64 + dy_bar,
        flux: m.sum,
        peak: m.peak,
        npix: m.npix,
        a: (t1 + t2).sqrt(),
        b: (t1 - t2).max(0.0).sqrt(),
        theta: 0.5 * (2.0 * xy).atan2(x2 - y2),
        flag,
    }
}
