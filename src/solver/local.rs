//! Solving with a locally installed astrometry.net `solve-field`.
//!
//! The extracted sources are written as an xylist (a FITS binary table) into
//! a scratch directory and `solve-field` is run on it there; the resulting
//! `.wcs` file carries the solution.

use super::{SolveError, SolveRequest, Solver};
use crate::header::{read_header, Header};
use crate::wcs::wcs_cards;
use anyhow::{bail, Context, Result};
use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

const XYLIST_NAME: &str = "xylist.fits";

#[derive(Debug, Clone)]
pub struct LocalSolverConfig {
    /// `solve-field` executable.
    pub solve_field: PathBuf,
    /// Search radius around the pointing hint, degrees.
    pub radius_deg: f64,
}

impl Default for LocalSolverConfig {
    fn default() -> Self {
        Self {
            solve_field: PathBuf::from("/usr/bin/solve-field"),
            radius_deg: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalSolver {
    config: LocalSolverConfig,
}

impl LocalSolver {
    pub fn new(config: LocalSolverConfig) -> Self {
        Self { config }
    }
}

impl Solver for LocalSolver {
    fn solve(&self, request: &SolveRequest<'_>) -> Result<Header> {
        if request.sources.is_empty() {
            bail!(SolveError::NoSources);
        }

        let work_dir = tempfile::Builder::new()
            .prefix("plate-solve-")
            .tempdir()
            .context("Failed to create temp directory")?;
        write_xylist(&work_dir.path().join(XYLIST_NAME), request)?;

        let mut cmd = Command::new(&self.config.solve_field);
        cmd.arg(XYLIST_NAME)
            .args(solve_field_args(request, self.config.radius_deg))
            .current_dir(work_dir.path())
            .env("PATH", search_path());

        tracing::info!(
            "Running solve-field on {} sources from {}",
            request.sources.len(),
            request.image_path.display()
        );
        tracing::debug!("Command: {:?}", cmd);

        let output = cmd.output().with_context(|| {
            format!(
                "Failed to execute {}",
                self.config.solve_field.display()
            )
        })?;
        tracing::debug!(
            "solve-field stdout:\n{}",
            String::from_utf8_lossy(&output.stdout)
        );

        if !output.status.success() {
            tracing::error!(
                "solve-field exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            bail!(SolveError::CouldNotSolve("Error running solve-field.".into()));
        }

        let Some(wcs_path) = find_wcs_file(work_dir.path())? else {
            bail!(SolveError::CouldNotSolve("failed to solve astrometry".into()));
        };

        let cards = wcs_cards(&read_header(&wcs_path, 0)?);
        if cards.is_empty() {
            bail!(SolveError::CouldNotSolve(format!(
                "{} holds no WCS",
                wcs_path.display()
            )));
        }
        Ok(cards)
    }
}

/// Arguments after the xylist name.
pub fn solve_field_args(request: &SolveRequest<'_>, radius_deg: f64) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-plots",
        "--x-column",
        "X",
        "--y-column",
        "Y",
        "--sort-column",
        "FLUX",
        "--width",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(request.width.to_string());
    args.push("--height".into());
    args.push(request.height.to_string());

    if let Some((ra, dec)) = request.hints.pointing() {
        args.extend([
            "--ra".into(),
            ra.to_string(),
            "--dec".into(),
            dec.to_string(),
            "--radius".into(),
            radius_deg.to_string(),
        ]);
    }
    if let Some((low, high)) = request.hints.scale_bounds() {
        args.extend([
            "--scale-low".into(),
            low.to_string(),
            "--scale-high".into(),
            high.to_string(),
            "--scale-units".into(),
            "arcsecperpix".into(),
        ]);
    }
    args
}

/// `PATH` with `/usr/bin` first, so the astrometry.net helpers win over
/// anything a virtualenv or similar put in front.
fn search_path() -> OsString {
    let mut path = OsString::from("/usr/bin");
    if let Some(current) = std::env::var_os("PATH") {
        path.push(":");
        path.push(current);
    }
    path
}

/// Binary table with `X`, `Y` (1-based) and `FLUX` columns, in request order.
fn write_xylist(path: &Path, request: &SolveRequest<'_>) -> Result<()> {
    let (xs, ys) = request.fits_positions();
    let flux: Vec<f64> = request.sources.iter().map(|s| s.flux).collect();

    let mut fits = FitsFile::create(path)
        .open()
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let columns = [
        ColumnDescription::new("X")
            .with_type(ColumnDataType::Double)
            .create()?,
        ColumnDescription::new("Y")
            .with_type(ColumnDataType::Double)
            .create()?,
        ColumnDescription::new("FLUX")
            .with_type(ColumnDataType::Double)
            .create()?,
    ];
    let hdu = fits.create_table("SOURCES".to_string(), &columns)?;
    hdu.write_col(&mut fits, "X", &xs)?;
    hdu.write_col(&mut fits, "Y", &ys)?;
    hdu.write_col(&mut fits, "FLUX", &flux)?;
    Ok(())
}

fn find_wcs_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "wcs"))
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}
