//! Plate-solving backends.
//!
//! Both backends receive an already extracted and truncated source list and
//! return only the WCS cards of the solution.

pub mod local;
pub mod nova;

use crate::header::Header;
use crate::sources::Source;
use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use local::{LocalSolver, LocalSolverConfig};
pub use nova::{NovaConfig, NovaSolver};

/// Prior knowledge handed to a solver. Pointing in degrees, scale in
/// arcsec per pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolveHints {
    pub ra_approx: Option<f64>,
    pub dec_approx: Option<f64>,
    pub scale_min: Option<f64>,
    pub scale_max: Option<f64>,
}

impl SolveHints {
    /// `(ra, dec)` when both are known.
    pub fn pointing(&self) -> Option<(f64, f64)> {
        self.ra_approx.zip(self.dec_approx)
    }

    /// `(min, max)` when both bounds are known.
    pub fn scale_bounds(&self) -> Option<(f64, f64)> {
        self.scale_min.zip(self.scale_max)
    }

    pub fn is_empty(&self) -> bool {
        *self == SolveHints::default()
    }

    /// Take the pointing and the scale range from `other` wherever `self`
    /// does not have the complete pair. Halves are never mixed, so an
    /// explicit `scale_min` cannot end up beside a guessed `scale_max`.
    pub fn or(self, other: SolveHints) -> SolveHints {
        let (ra_approx, dec_approx) = match (self.pointing(), other.pointing()) {
            (None, Some((ra, dec))) => (Some(ra), Some(dec)),
            _ => (self.ra_approx, self.dec_approx),
        };
        let (scale_min, scale_max) = match (self.scale_bounds(), other.scale_bounds()) {
            (None, Some((low, high))) => (Some(low), Some(high)),
            _ => (self.scale_min, self.scale_max),
        };
        SolveHints {
            ra_approx,
            dec_approx,
            scale_min,
            scale_max,
        }
    }
}

/// Everything a backend needs to solve one image.
#[derive(Debug, Clone)]
pub struct SolveRequest<'a> {
    pub image_path: &'a Path,
    pub width: usize,
    pub height: usize,
    /// Brightest first, already truncated.
    pub sources: &'a [Source],
    pub hints: SolveHints,
}

impl SolveRequest<'_> {
    /// Source positions in the FITS convention (first pixel centred on 1.0).
    pub fn fits_positions(&self) -> (Vec<f64>, Vec<f64>) {
        self.sources.iter().map(|s| (s.x + 1.0, s.y + 1.0)).unzip()
    }
}

/// A plate-solving backend.
pub trait Solver {
    /// Solve the field; the returned header holds the WCS cards only.
    fn solve(&self, request: &SolveRequest<'_>) -> Result<Header>;
}

/// Failures a caller may want to tell apart; recover them from an
/// `anyhow::Error` with `downcast_ref`.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("could not solve field: {0}")]
    CouldNotSolve(String),
    #[error("no astrometry.net API key given (use --api-key or astrometry_net_api_key)")]
    ApiKeyNotFound,
    #[error("no usable sources were extracted")]
    NoSources,
    #[error("gave up waiting for a solution after {0:?}")]
    Timeout(Duration),
    #[error("astrometry.net API error: {0}")]
    Api(String),
}
