//! Image information metrics.
//!
//! All metrics work on a grayscale image normalised to [0, 1]; see
//! [`to_gray01`]. Spectral metrics use a Hann windowed 2D power spectrum with
//! the DC term removed.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{Array2, Axis};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;

use super::error::MetricsError;
use super::frame::Frame;

const EPS: f64 = 1e-12;
/// Radial frequency of the corner of the spectrum, used to normalise the centroid
const NYQUIST_RADIUS: f64 = 0.707;
const HIGH_FREQUENCY_CUTOFF: f64 = 0.3;
pub const DEFAULT_BINS: usize = 256;
pub const DEFAULT_INTEREST_THRESHOLD: f64 = 0.6;
pub const DEFAULT_HISTORY: usize = 1000;

/// Normalise to [0, 1]: integer types are divided by their type maximum,
/// floats are clipped. Non-finite values map to 0 (NaN, -inf) or 1 (+inf).
pub fn to_gray01(frame: &Frame) -> Array2<f64> {
    let scale = frame
        .pixel_type
        .integer_range()
        .map(|(_, hi)| hi)
        .unwrap_or(1.0);
    frame.data.mapv(|v| {
        if v.is_nan() {
            0.0
        } else {
            (v / scale).clamp(0.0, 1.0)
        }
    })
}

/// Bin index in [0, bins) for a value in [0, 1], with 1.0 in the last bin
fn unit_bin(v: f64, bins: usize) -> usize {
    ((v * bins as f64) as usize).min(bins - 1)
}

fn unit_histogram(img: &Array2<f64>, bins: usize) -> Vec<u64> {
    let mut hist = vec![0u64; bins];
    for v in img.iter() {
        if (0.0..=1.0).contains(v) {
            hist[unit_bin(*v, bins)] += 1;
        }
    }
    hist
}

/// Entropy in bits of a histogram
fn entropy_of_counts(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

pub fn shannon_entropy(img: &Array2<f64>, bins: usize) -> f64 {
    if bins == 0 {
        return 0.0;
    }
    entropy_of_counts(&unit_histogram(img, bins))
}

pub fn normalized_entropy(img: &Array2<f64>, bins: usize) -> f64 {
    let max = (bins as f64).log2();
    if max > 0.0 {
        shannon_entropy(img, bins) / max
    } else {
        0.0
    }
}

/// Zlib (level 9) compressed size in bytes per pixel of the image quantised to `bins` levels
pub fn zlib_compressibility(img: &Array2<f64>, bins: usize) -> Result<f64, MetricsError> {
    if img.is_empty() {
        return Err(MetricsError::EmptyImage);
    }
    let top = bins.saturating_sub(1) as f64;
    let mut bytes = Vec::with_capacity(img.len() * 2);
    for v in img.iter() {
        let q = (v * top).round().clamp(0.0, top) as u16;
        bytes.extend_from_slice(&q.to_le_bytes());
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    encoder.write_all(&bytes)?;
    let compressed = encoder.finish()?;
    Ok(compressed.len() as f64 / img.len() as f64)
}

/// Variance of the 5-point Laplacian with edge replication at the borders
pub fn laplacian_variance(img: &Array2<f64>) -> f64 {
    let (h, w) = img.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    let at = |r: isize, c: isize| -> f64 {
        let r = r.clamp(0, h as isize - 1) as usize;
        let c = c.clamp(0, w as isize - 1) as usize;
        img[[r, c]]
    };
    let lap = Array2::from_shape_fn((h, w), |(r, c)| {
        let (r, c) = (r as isize, c as isize);
        at(r - 1, c) + at(r + 1, c) + at(r, c - 1) + at(r, c + 1) - 4.0 * at(r, c)
    });
    variance(lap.iter().copied())
}

fn variance<I: Iterator<Item = f64> + Clone>(values: I) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
}

/// Symmetric Hann window of length n
fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|k| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * k as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Sample frequencies in cycles per pixel, in FFT order
fn fft_freq(n: usize) -> Vec<f64> {
    (0..n)
        .map(|k| {
            let k = if k < n.div_ceil(2) {
                k as f64
            } else {
                k as f64 - n as f64
            };
            k / n as f64
        })
        .collect()
}

/// |FFT2(img * hann)|^2 with the DC bin zeroed
pub fn power_spectrum(img: &Array2<f64>) -> Array2<f64> {
    let (h, w) = img.dim();
    if h == 0 || w == 0 {
        return Array2::zeros((h, w));
    }
    let wy = hann(h);
    let wx = hann(w);
    let mut buf: Array2<Complex<f64>> =
        Array2::from_shape_fn((h, w), |(r, c)| Complex::new(img[[r, c]] * wy[r] * wx[c], 0.0));

    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft_forward(w);
    for mut row in buf.axis_iter_mut(Axis(0)) {
        let mut line: Vec<Complex<f64>> = row.to_vec();
        row_fft.process(&mut line);
        row.assign(&ndarray::ArrayView1::from(&line));
    }
    let col_fft = planner.plan_fft_forward(h);
    for mut col in buf.axis_iter_mut(Axis(1)) {
        let mut line: Vec<Complex<f64>> = col.to_vec();
        col_fft.process(&mut line);
        col.assign(&ndarray::ArrayView1::from(&line));
    }

    let mut power = buf.mapv(|c| c.norm_sqr());
    power[[0, 0]] = 0.0;
    power
}

/// Radial frequency of every spectrum bin
fn radial_frequency(shape: (usize, usize)) -> Array2<f64> {
    let fy = fft_freq(shape.0);
    let fx = fft_freq(shape.1);
    Array2::from_shape_fn(shape, |(r, c)| fy[r].hypot(fx[c]))
}

fn spectral_entropy_of(power: &Array2<f64>) -> f64 {
    let total = power.sum() + EPS;
    power
        .iter()
        .map(|p| p / total)
        .filter(|s| *s > 0.0)
        .map(|s| -s * (s + EPS).log2())
        .sum()
}

fn spectral_centroid_of(power: &Array2<f64>) -> f64 {
    let total = power.sum();
    if total <= 0.0 {
        return 0.0;
    }
    let radius = radial_frequency(power.dim());
    (&radius * power).sum() / total / NYQUIST_RADIUS
}

fn high_frequency_energy_of(power: &Array2<f64>, cutoff: f64) -> f64 {
    let total = power.sum();
    if total <= 0.0 {
        return 0.0;
    }
    let radius = radial_frequency(power.dim());
    let high: f64 = power
        .iter()
        .zip(radius.iter())
        .filter(|(_, r)| **r > cutoff)
        .map(|(p, _)| *p)
        .sum();
    high / total
}

fn spectral_flatness_of(power: &Array2<f64>) -> f64 {
    let kept: Vec<f64> = power.iter().copied().filter(|p| *p > EPS).collect();
    if kept.is_empty() {
        return 0.0;
    }
    let n = kept.len() as f64;
    let geometric = (kept.iter().map(|p| (p + EPS).ln()).sum::<f64>() / n).exp();
    let arithmetic = kept.iter().sum::<f64>() / n;
    geometric / (arithmetic + EPS)
}

pub fn spectral_entropy(img: &Array2<f64>) -> f64 {
    spectral_entropy_of(&power_spectrum(img))
}

/// Power weighted mean radial frequency, normalised so the spectrum corner is about 1
pub fn spectral_centroid(img: &Array2<f64>) -> f64 {
    spectral_centroid_of(&power_spectrum(img))
}

/// Fraction of spectral power above 0.3 cycles per pixel
pub fn high_frequency_energy(img: &Array2<f64>) -> f64 {
    high_frequency_energy_of(&power_spectrum(img), HIGH_FREQUENCY_CUTOFF)
}

/// Geometric over arithmetic mean of the power spectrum (1 = noise like)
pub fn spectral_flatness(img: &Array2<f64>) -> f64 {
    spectral_flatness_of(&power_spectrum(img))
}

/// Derivative along one axis: central differences inside, one sided at the ends
fn axis_gradient(img: &Array2<f64>, axis: Axis) -> Array2<f64> {
    let n = img.len_of(axis);
    let mut grad = Array2::zeros(img.dim());
    if n < 2 {
        return grad;
    }
    for (lane_in, mut lane_out) in img.lanes(axis).into_iter().zip(grad.lanes_mut(axis)) {
        lane_out[0] = lane_in[1] - lane_in[0];
        lane_out[n - 1] = lane_in[n - 1] - lane_in[n - 2];
        for i in 1..n - 1 {
            lane_out[i] = (lane_in[i + 1] - lane_in[i - 1]) / 2.0;
        }
    }
    grad
}

/// Mean gradient magnitude
pub fn gradient_magnitude(img: &Array2<f64>) -> f64 {
    if img.is_empty() {
        return 0.0;
    }
    let gy = axis_gradient(img, Axis(0));
    let gx = axis_gradient(img, Axis(1));
    let total: f64 = gy
        .iter()
        .zip(gx.iter())
        .map(|(y, x)| y.hypot(*x))
        .sum();
    total / img.len() as f64
}

/// Mutual information in bits between two normalised images of equal shape
pub fn mutual_information(
    a: &Array2<f64>,
    b: &Array2<f64>,
    bins: usize,
) -> Result<f64, MetricsError> {
    if a.dim() != b.dim() {
        return Err(MetricsError::ShapeMismatch(a.dim(), b.dim()));
    }
    if bins == 0 || a.is_empty() {
        return Ok(0.0);
    }
    let mut joint = vec![0u64; bins * bins];
    for (va, vb) in a.iter().zip(b.iter()) {
        if (0.0..=1.0).contains(va) && (0.0..=1.0).contains(vb) {
            joint[unit_bin(*va, bins) * bins + unit_bin(*vb, bins)] += 1;
        }
    }
    let ha = entropy_of_counts(&unit_histogram(a, bins));
    let hb = entropy_of_counts(&unit_histogram(b, bins));
    let hab = entropy_of_counts(&joint);
    Ok(ha + hb - hab)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageMetrics {
    pub shannon_entropy: f64,
    pub normalized_entropy: f64,
    pub zlib_compressibility: f64,
    pub laplacian_variance: f64,
    pub spectral_entropy: f64,
    pub spectral_centroid: f64,
    pub high_frequency_energy: f64,
    pub gradient_magnitude: f64,
    pub spectral_flatness: f64,
    pub mutual_information: Option<f64>,
    pub interest_score: f64,
}

impl ImageMetrics {
    /// (name, value) pairs in display order
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        let mut entries = vec![
            ("shannon_entropy", self.shannon_entropy),
            ("normalized_entropy", self.normalized_entropy),
            ("zlib_compressibility", self.zlib_compressibility),
            ("laplacian_variance", self.laplacian_variance),
            ("spectral_entropy", self.spectral_entropy),
            ("spectral_centroid", self.spectral_centroid),
            ("high_frequency_energy", self.high_frequency_energy),
            ("gradient_magnitude", self.gradient_magnitude),
            ("spectral_flatness", self.spectral_flatness),
        ];
        if let Some(mi) = self.mutual_information {
            entries.push(("mutual_information", mi));
        }
        entries.push(("interest_score", self.interest_score));
        entries
    }
}

/// Weighted combination of the metrics, clamped to [0, 1]
pub fn interest_score(
    normalized_entropy: f64,
    laplacian_variance: f64,
    spectral_entropy: f64,
    high_frequency_energy: f64,
    gradient_magnitude: f64,
) -> f64 {
    let score = normalized_entropy * 0.25
        + laplacian_variance / 500.0 * 0.25
        + spectral_entropy / 15.0 * 0.20
        + high_frequency_energy * 0.15
        + gradient_magnitude * 2.0 * 0.15;
    score.clamp(0.0, 1.0)
}

/// Compute every metric for a frame, with mutual information when a reference is given.
///
/// A reference of a different shape yields a mutual information of 0.
pub fn compute_all(
    frame: &Frame,
    bins: usize,
    reference: Option<&Frame>,
) -> Result<ImageMetrics, MetricsError> {
    if frame.data.is_empty() {
        return Err(MetricsError::EmptyImage);
    }
    let bins = bins.max(2);
    let gray = to_gray01(frame);
    let power = power_spectrum(&gray);

    let normalized = normalized_entropy(&gray, bins);
    let laplacian = laplacian_variance(&gray);
    let spec_entropy = spectral_entropy_of(&power);
    let hfe = high_frequency_energy_of(&power, HIGH_FREQUENCY_CUTOFF);
    let gradient = gradient_magnitude(&gray);

    let mutual = reference.map(|r| {
        let ref_gray = to_gray01(r);
        mutual_information(&gray, &ref_gray, (bins / 2).min(64)).unwrap_or(0.0)
    });

    Ok(ImageMetrics {
        shannon_entropy: shannon_entropy(&gray, bins),
        normalized_entropy: normalized,
        zlib_compressibility: zlib_compressibility(&gray, bins)?,
        laplacian_variance: laplacian,
        spectral_entropy: spec_entropy,
        spectral_centroid: spectral_centroid_of(&power),
        high_frequency_energy: hfe,
        gradient_magnitude: gradient,
        spectral_flatness: spectral_flatness_of(&power),
        mutual_information: mutual,
        interest_score: interest_score(normalized, laplacian, spec_entropy, hfe, gradient),
    })
}

#[derive(Debug, Clone)]
pub struct InterestingFrame {
    pub index: u64,
    pub elapsed: f64,
    pub metrics: ImageMetrics,
}

/// Rolling metric history with best frame and threshold tracking
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    pub threshold: f64,
    max_points: usize,
    history: VecDeque<(f64, ImageMetrics)>,
    frame_count: u64,
    best: Option<(u64, f64)>,
    interesting: Vec<InterestingFrame>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_INTEREST_THRESHOLD, DEFAULT_HISTORY)
    }
}

impl MetricsTracker {
    pub fn new(threshold: f64, max_points: usize) -> Self {
        Self {
            threshold,
            max_points: max_points.max(1),
            history: VecDeque::new(),
            frame_count: 0,
            best: None,
            interesting: Vec::new(),
        }
    }

    /// Record metrics measured `elapsed` seconds after the start. Returns true for an interesting frame.
    pub fn record(&mut self, elapsed: f64, metrics: ImageMetrics) -> bool {
        let index = self.frame_count;
        self.frame_count += 1;
        let score = metrics.interest_score;
        if self.best.map(|(_, s)| score > s).unwrap_or(score > 0.0) {
            self.best = Some((index, score));
            spdlog::info!("New best frame #{} (interest: {:.3})", index + 1, score);
        }
        let interesting = score >= self.threshold;
        if interesting {
            spdlog::info!("Interesting frame #{} (interest: {:.3})", index + 1, score);
            self.interesting.push(InterestingFrame {
                index,
                elapsed,
                metrics,
            });
        }
        self.history.push_back((elapsed, metrics));
        while self.history.len() > self.max_points {
            self.history.pop_front();
        }
        interesting
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// (frame index, score) of the highest interest so far
    pub fn best(&self) -> Option<(u64, f64)> {
        self.best
    }

    pub fn interesting(&self) -> &[InterestingFrame] {
        &self.interesting
    }

    pub fn history(&self) -> &VecDeque<(f64, ImageMetrics)> {
        &self.history
    }

    /// (elapsed, value) series of one named metric
    pub fn series(&self, name: &str) -> Vec<[f64; 2]> {
        self.history
            .iter()
            .filter_map(|(t, m)| {
                m.entries()
                    .into_iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| [*t, v])
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.frame_count = 0;
        self.best = None;
        self.interesting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(h: usize, w: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(11);
        Array2::from_shape_fn((h, w), |_| rng.gen::<f64>())
    }

    #[test]
    fn test_gray01() {
        let frame = Frame::new(0, 0.0, PixelType::U8, array![[0.0, 255.0, f64::NAN]]);
        assert_eq!(to_gray01(&frame), array![[0.0, 1.0, 0.0]]);
        let frame = Frame::new(0, 0.0, PixelType::F32, array![[-1.0, 0.5, f64::INFINITY]]);
        assert_eq!(to_gray01(&frame), array![[0.0, 0.5, 1.0]]);
    }

    #[test]
    fn test_entropy() {
        let flat = Array2::from_elem((4, 4), 0.5);
        assert_eq!(shannon_entropy(&flat, 256), 0.0);
        let half = array![[0.0, 1.0], [0.0, 1.0]];
        assert!((shannon_entropy(&half, 256) - 1.0).abs() < 1e-12);
        assert!((normalized_entropy(&half, 256) - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_compressibility_orders_noise_above_flat() {
        let flat = Array2::from_elem((32, 32), 0.2);
        let noisy = noise(32, 32);
        let c_flat = zlib_compressibility(&flat, 256).unwrap();
        let c_noise = zlib_compressibility(&noisy, 256).unwrap();
        assert!(c_flat < c_noise);
        assert!(zlib_compressibility(&Array2::zeros((0, 0)), 256).is_err());
    }

    #[test]
    fn test_laplacian_and_gradient() {
        let flat = Array2::from_elem((5, 5), 0.3);
        assert_eq!(laplacian_variance(&flat), 0.0);
        assert_eq!(gradient_magnitude(&flat), 0.0);
        let ramp = Array2::from_shape_fn((4, 4), |(_, c)| c as f64 * 0.1);
        assert!((gradient_magnitude(&ramp) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_spectrum_metrics() {
        let flat = Array2::from_elem((16, 16), 0.5);
        // only leakage from the window remains, all low frequency
        assert!(high_frequency_energy(&flat) < 0.05);
        let checker = Array2::from_shape_fn((16, 16), |(r, c)| ((r + c) % 2) as f64);
        assert!(high_frequency_energy(&checker) > 0.5);
        assert!(spectral_centroid(&checker) > spectral_centroid(&flat));
        let noisy = noise(16, 16);
        assert!(spectral_flatness(&noisy) > spectral_flatness(&checker));
        assert!(spectral_entropy(&noisy) > spectral_entropy(&checker));
        assert_eq!(fft_freq(4), vec![0.0, 0.25, -0.5, -0.25]);
        assert_eq!(fft_freq(5)[3], -0.4);
    }

    #[test]
    fn test_mutual_information() {
        let a = noise(16, 16);
        let self_mi = mutual_information(&a, &a, 8).unwrap();
        let h = shannon_entropy(&a, 8);
        assert!((self_mi - h).abs() < 1e-9);
        assert!(mutual_information(&a, &Array2::zeros((2, 2)), 8).is_err());
    }

    #[test]
    fn test_compute_all_and_interest() {
        let frame = Frame::new(0, 0.0, PixelType::F64, noise(32, 32));
        let reference = Frame::new(0, 0.0, PixelType::F64, noise(8, 8));
        let metrics = compute_all(&frame, 256, Some(&reference)).unwrap();
        assert_eq!(metrics.mutual_information, Some(0.0));
        assert!((0.0..=1.0).contains(&metrics.interest_score));
        assert_eq!(interest_score(1.0, 5000.0, 100.0, 1.0, 10.0), 1.0);
        assert_eq!(interest_score(0.0, 0.0, 0.0, 0.0, 0.0), 0.0);
        assert!((interest_score(1.0, 0.0, 0.0, 0.0, 0.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_tracker() {
        let frame = Frame::new(0, 0.0, PixelType::F64, noise(8, 8));
        let mut metrics = compute_all(&frame, 256, None).unwrap();
        let mut tracker = MetricsTracker::new(0.5, 2);
        metrics.interest_score = 0.4;
        assert!(!tracker.record(0.0, metrics));
        metrics.interest_score = 0.7;
        assert!(tracker.record(1.0, metrics));
        metrics.interest_score = 0.6;
        tracker.record(2.0, metrics);
        assert_eq!(tracker.best(), Some((1, 0.7)));
        assert_eq!(tracker.interesting().len(), 2);
        assert_eq!(tracker.history().len(), 2);
        assert_eq!(tracker.series("interest_score"), vec![[1.0, 0.7], [2.0, 0.6]]);
        tracker.clear();
        assert_eq!(tracker.frame_count(), 0);
    }
}
