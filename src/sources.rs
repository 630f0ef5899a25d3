//! Detected sources and the heuristics that turn a raw detection list into a
//! list of probable stars, brightest first.

use std::cmp::Ordering;

bitflags::bitflags! {
    /// Quality flags attached to a detection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFlags: u8 {
        /// Component touches the image border.
        const TRUNCATED = 0x02;
        /// Second-moment matrix was degenerate and had to be regularised.
        const SINGULAR = 0x08;
        /// Weighted pixel sum was not positive; moments are meaningless.
        const NEGATIVE_FLUX = 0x10;
    }
}

/// One detected source, measured on the background-subtracted image.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Barycentre column, 0-based, pixel centres on integers.
    pub x: f64,
    /// Barycentre row, 0-based.
    pub y: f64,
    /// Sum of background-subtracted pixel values.
    pub flux: f64,
    pub peak: f64,
    pub npix: usize,
    /// Semi-major axis of the moment ellipse, pixels.
    pub a: f64,
    /// Semi-minor axis of the moment ellipse, pixels.
    pub b: f64,
    /// Position angle of the major axis, radians from +x towards +y.
    pub theta: f64,
    pub flag: SourceFlags,
}

impl Source {
    pub fn elongation(&self) -> f64 {
        self.a / self.b
    }
}

/// Ordered list of sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceList {
    sources: Vec<Source>,
}

impl SourceList {
    pub fn new(sources: Vec<Source>) -> Self {
        SourceList { sources }
    }

    /// Drop every source carrying a flag.
    pub fn reject_flagged(&mut self) {
        self.sources.retain(|s| s.flag.is_empty());
    }

    /// Drop sources whose `a / b` is not below `median + std` of the list.
    pub fn reject_elongated(&mut self) {
        let elongations: Vec<f64> = self.sources.iter().map(Source::elongation).collect();
        let (Some(median), Some(std)) = (median(&elongations), std_dev(&elongations)) else {
            return;
        };
        let limit = median + std;
        self.sources.retain(|s| s.elongation() < limit);
    }

    /// Drop sources covering no more than half the median pixel count; these
    /// are mostly hot pixels and cosmic-ray hits.
    pub fn reject_compact(&mut self) {
        let npix: Vec<f64> = self.sources.iter().map(|s| s.npix as f64).collect();
        let Some(median) = median(&npix) else {
            return;
        };
        self.sources.retain(|s| s.npix as f64 > 0.5 * median);
    }

    /// Brightest first.
    pub fn sort_by_flux(&mut self) {
        self.sources
            .sort_by(|a, b| b.flux.partial_cmp(&a.flux).unwrap_or(Ordering::Equal));
    }

    /// The first `n` sources, or all of them for `None`.
    pub fn brightest(&self, n: Option<usize>) -> &[Source] {
        let n = n.unwrap_or(self.sources.len()).min(self.sources.len());
        &self.sources[..n]
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Source> {
        self.sources.iter()
    }

    pub fn as_slice(&self) -> &[Source] {
        &self.sources
    }
}

impl<'a> IntoIterator for &'a SourceList {
    type Item = &'a Source;
    type IntoIter = std::slice::Iter<'a, Source>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.iter()
    }
}

/// Median; the mean of the two central values for even lengths.
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    Some(if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    })
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt())
}
