//! Solving one FITS file end to end: skip if already solved, extract stars,
//! gather hints, dispatch to a backend and write the solution back.

use crate::extract::{extract_stars, ExtractionConfig};
use crate::fits::{find_image_hdu, image_dimensions, FitsImage};
use crate::header::{read_header, write_cards, Header};
use crate::solver::{
    LocalSolver, LocalSolverConfig, NovaConfig, NovaSolver, SolveError, SolveHints, SolveRequest,
    Solver,
};
use crate::sources::SourceList;
use crate::wcs::{guess_from_instrument, guess_from_wcs};
use anyhow::{bail, Context, Result};
use fitsio::FitsFile;
use std::path::Path;

/// Keyword marking a file as solved.
pub const SOLVED_KEY: &str = "PL-SLVED";
pub const SOLVED_VALUE: &str = "done";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// nova.astrometry.net
    #[default]
    Api,
    /// A local `solve-field`.
    Local,
}

#[derive(Debug, Clone)]
pub struct PlateSolveOptions {
    /// Pre-extracted sources, brightest first. Extracted from the image when
    /// absent.
    pub sources: Option<SourceList>,
    /// Derive pointing and scale from a WCS already in the header.
    pub use_existing_wcs_as_guess: bool,
    /// Send only this many of the brightest sources; `None` sends all.
    pub use_n_brightest_only: Option<usize>,
    pub redo_if_done: bool,
    pub backend: Backend,
    pub hints: SolveHints,
    pub extraction: ExtractionConfig,
}

impl Default for PlateSolveOptions {
    fn default() -> Self {
        Self {
            sources: None,
            use_existing_wcs_as_guess: true,
            use_n_brightest_only: None,
            redo_if_done: false,
            backend: Backend::default(),
            hints: SolveHints::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

/// Holds one solver per backend.
pub struct PlateSolver {
    local: Box<dyn Solver>,
    api: Box<dyn Solver>,
}

impl PlateSolver {
    pub fn new(local: LocalSolverConfig, nova: NovaConfig) -> Result<Self> {
        Ok(Self::with_solvers(
            LocalSolver::new(local),
            NovaSolver::new(nova)?,
        ))
    }

    pub fn with_solvers(local: impl Solver + 'static, api: impl Solver + 'static) -> Self {
        Self {
            local: Box::new(local),
            api: Box::new(api),
        }
    }

    fn backend(&self, backend: Backend) -> &dyn Solver {
        match backend {
            Backend::Api => self.api.as_ref(),
            Backend::Local => self.local.as_ref(),
        }
    }

    /// Solve `path` and store the WCS in its image HDU.
    ///
    /// Returns the written cards (WCS plus the `PL-SLVED` marker), or the
    /// untouched image header when the file was already solved and
    /// `redo_if_done` is off.
    pub fn solve_file(&self, path: &Path, options: &PlateSolveOptions) -> Result<Header> {
        let hdu_index = {
            let mut fits =
                FitsFile::open(path).with_context(|| format!("opening {}", path.display()))?;
            find_image_hdu(&mut fits)
                .with_context(|| format!("no image HDU found in {}", path.display()))?
        };
        let header = read_header(path, hdu_index)?;

        if header.contains(SOLVED_KEY) && !options.redo_if_done {
            tracing::info!("{} already solved, skipping", path.display());
            return Ok(header);
        }

        let (width, height) = image_dimensions(&header)?;
        let mut sources = match &options.sources {
            Some(sources) => sources.clone(),
            None => {
                let image = FitsImage::load(path)?;
                extract_stars(&image, &options.extraction)
            }
        };
        sources.sort_by_flux();
        if sources.is_empty() {
            bail!(SolveError::NoSources);
        }

        let hints = resolve_hints(&header, options);
        tracing::debug!("hints for {}: {:?}", path.display(), hints);

        let request = SolveRequest {
            image_path: path,
            width,
            height,
            sources: sources.brightest(options.use_n_brightest_only),
            hints,
        };
        let mut cards = self.backend(options.backend).solve(&request)?;

        tracing::info!("{} solved, writing the WCS", path.display());
        cards.set(SOLVED_KEY, SOLVED_VALUE);
        write_cards(path, hdu_index, &cards)?;
        Ok(cards)
    }
}

/// Solve `path` with default solver settings and the API key from the
/// environment.
pub fn plate_solve(path: &Path, options: &PlateSolveOptions) -> Result<Header> {
    PlateSolver::new(LocalSolverConfig::default(), NovaConfig::from_env())?
        .solve_file(path, options)
}

/// An existing WCS overrides the explicit hints; without one, acquisition
/// keywords only fill what is still missing.
fn resolve_hints(header: &Header, options: &PlateSolveOptions) -> SolveHints {
    if !options.use_existing_wcs_as_guess {
        return options.hints;
    }
    match guess_from_wcs(header) {
        Some(guess) => guess.or(options.hints),
        None => options.hints.or(guess_from_instrument(header)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Source, SourceFlags};
    use fitsio::images::{ImageDescription, ImageType};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone)]
    struct Seen {
        width: usize,
        height: usize,
        fluxes: Vec<f64>,
        hints: SolveHints,
    }

    /// Records every request and answers with a fixed WCS.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Rc<RefCell<Vec<Seen>>>,
        fail: bool,
    }

    impl Solver for Recorder {
        fn solve(&self, request: &SolveRequest<'_>) -> Result<Header> {
            self.calls.borrow_mut().push(Seen {
                width: request.width,
                height: request.height,
                fluxes: request.sources.iter().map(|s| s.flux).collect(),
                hints: request.hints,
            });
            if self.fail {
                bail!(SolveError::CouldNotSolve("nope".into()));
            }
            let mut wcs = Header::new();
            wcs.set("CTYPE1", "RA---TAN");
            wcs.set("CTYPE2", "DEC--TAN");
            wcs.set("CRVAL1", 12.5);
            wcs.set("CRVAL2", -30.0);
            wcs.set("CD1_1", 0.0005);
            wcs.set("CD2_2", 0.0005);
            Ok(wcs)
        }
    }

    fn sources(n: usize) -> SourceList {
        with_fluxes((0..n).map(|i| 1000.0 - i as f64))
    }

    fn with_fluxes(fluxes: impl IntoIterator<Item = f64>) -> SourceList {
        SourceList::new(
            fluxes
                .into_iter()
                .enumerate()
                .map(|(i, flux)| Source {
                    x: 10.0 + i as f64,
                    y: 20.0,
                    flux,
                    peak: 50.0,
                    npix: 20,
                    a: 1.5,
                    b: 1.4,
                    theta: 0.0,
                    flag: SourceFlags::empty(),
                })
                .collect(),
        )
    }

    fn blank_fits(dir: &Path, keys: &[(&str, f64)]) -> std::path::PathBuf {
        let path = dir.join("frame.fits");
        let desc = ImageDescription {
            data_type: ImageType::Float,
            dimensions: &[32, 32],
        };
        let mut fits = FitsFile::create(&path)
            .with_custom_primary(&desc)
            .open()
            .unwrap();
        let hdu = fits.primary_hdu().unwrap();
        hdu.write_image(&mut fits, &vec![100.0f32; 32 * 32]).unwrap();
        for (key, value) in keys {
            hdu.write_key(&mut fits, key, *value).unwrap();
        }
        path
    }

    fn options(n: usize) -> PlateSolveOptions {
        PlateSolveOptions {
            sources: Some(sources(n)),
            ..Default::default()
        }
    }

    #[test]
    fn writes_solution_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        let cards = solver.solve_file(&path, &options(5)).unwrap();
        assert_eq!(cards.get_str(SOLVED_KEY), Some(SOLVED_VALUE));

        let on_disk = read_header(&path, 0).unwrap();
        assert_eq!(on_disk.get_f64("CRVAL1"), Some(12.5));
        assert_eq!(on_disk.get_str("CTYPE2"), Some("DEC--TAN"));
        assert_eq!(on_disk.get_str(SOLVED_KEY), Some("done"));

        let calls = api.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].width, calls[0].height), (32, 32));
    }

    #[test]
    fn solved_files_are_skipped_unless_redo() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        solver.solve_file(&path, &options(5)).unwrap();
        let header = solver.solve_file(&path, &options(5)).unwrap();
        assert!(header.contains("NAXIS1"));
        assert_eq!(api.calls.borrow().len(), 1);

        let redo = PlateSolveOptions {
            redo_if_done: true,
            ..options(5)
        };
        solver.solve_file(&path, &redo).unwrap();
        assert_eq!(api.calls.borrow().len(), 2);
    }

    #[test]
    fn backend_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let (local, api) = (Recorder::default(), Recorder::default());
        let solver = PlateSolver::with_solvers(local.clone(), api.clone());

        let opts = PlateSolveOptions {
            backend: Backend::Local,
            ..options(3)
        };
        solver.solve_file(&path, &opts).unwrap();
        assert_eq!(local.calls.borrow().len(), 1);
        assert!(api.calls.borrow().is_empty());
    }

    #[test]
    fn only_the_brightest_are_sent() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        let opts = PlateSolveOptions {
            use_n_brightest_only: Some(3),
            ..options(10)
        };
        solver.solve_file(&path, &opts).unwrap();
        assert_eq!(api.calls.borrow()[0].fluxes, vec![1000.0, 999.0, 998.0]);
    }

    #[test]
    fn supplied_sources_are_ranked_before_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let local = Recorder::default();
        let solver = PlateSolver::with_solvers(local.clone(), Recorder::default());

        let opts = PlateSolveOptions {
            sources: Some(with_fluxes([1.0, 2.0, 900.0, 500.0])),
            backend: Backend::Local,
            use_n_brightest_only: Some(2),
            ..Default::default()
        };
        solver.solve_file(&path, &opts).unwrap();
        assert_eq!(local.calls.borrow()[0].fluxes, vec![900.0, 500.0]);
    }

    /// Empty primary HDU with the pixels in a `SCI` extension.
    fn extension_fits(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("ext.fits");
        let desc = ImageDescription {
            data_type: ImageType::Float,
            dimensions: &[32, 32],
        };
        let mut fits = FitsFile::create(&path).open().unwrap();
        let hdu = fits.create_image("SCI".to_string(), &desc).unwrap();
        hdu.write_image(&mut fits, &vec![100.0f32; 32 * 32]).unwrap();
        path
    }

    #[test]
    fn solution_goes_to_the_extension_holding_the_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = extension_fits(dir.path());
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        solver.solve_file(&path, &options(5)).unwrap();
        assert_eq!(api.calls.borrow().len(), 1);

        let primary = read_header(&path, 0).unwrap();
        assert!(!primary.contains("CRVAL1"));
        assert!(!primary.contains(SOLVED_KEY));
        let sci = read_header(&path, 1).unwrap();
        assert_eq!(sci.get_str("EXTNAME"), Some("SCI"));
        assert_eq!(sci.get_f64("CRVAL1"), Some(12.5));
        assert_eq!(sci.get_str(SOLVED_KEY), Some(SOLVED_VALUE));

        // The marker is found in the extension on the next run.
        solver.solve_file(&path, &options(5)).unwrap();
        assert_eq!(api.calls.borrow().len(), 1);
    }

    #[test]
    fn existing_wcs_overrides_explicit_hints() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(
            dir.path(),
            &[("CRVAL1", 80.0), ("CRVAL2", 10.0), ("CDELT1", -2.0 / 3600.0), ("CDELT2", 2.0 / 3600.0)],
        );
        {
            let mut fits = FitsFile::edit(&path).unwrap();
            let hdu = fits.primary_hdu().unwrap();
            hdu.write_key(&mut fits, "CTYPE1", "RA---TAN").unwrap();
            hdu.write_key(&mut fits, "CTYPE2", "DEC--TAN").unwrap();
        }
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        let explicit = SolveHints {
            ra_approx: Some(1.0),
            dec_approx: Some(1.0),
            ..Default::default()
        };
        let opts = PlateSolveOptions {
            hints: explicit,
            ..options(5)
        };
        solver.solve_file(&path, &opts).unwrap();
        let hints = api.calls.borrow()[0].hints;
        assert_eq!(hints.pointing(), Some((80.0, 10.0)));
        let (low, high) = hints.scale_bounds().unwrap();
        approx::assert_relative_eq!(low, 1.6, epsilon = 1e-9);
        approx::assert_relative_eq!(high, 2.4, epsilon = 1e-9);

        let opts = PlateSolveOptions {
            hints: explicit,
            use_existing_wcs_as_guess: false,
            redo_if_done: true,
            ..options(5)
        };
        solver.solve_file(&path, &opts).unwrap();
        assert_eq!(api.calls.borrow()[1].hints, explicit);
    }

    #[test]
    fn instrument_keywords_fill_missing_hints() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[("XPIXSZ", 3.8), ("FOCALLEN", 400.0)]);
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        let opts = PlateSolveOptions {
            hints: SolveHints {
                scale_min: Some(0.1),
                scale_max: Some(0.2),
                ..Default::default()
            },
            ..options(5)
        };
        solver.solve_file(&path, &opts).unwrap();
        let hints = api.calls.borrow()[0].hints;
        assert_eq!(hints.scale_bounds(), Some((0.1, 0.2)));
        assert_eq!(hints.pointing(), None);

        let opts = PlateSolveOptions {
            redo_if_done: true,
            ..options(5)
        };
        solver.solve_file(&path, &opts).unwrap();
        let (low, _) = api.calls.borrow()[1].hints.scale_bounds().unwrap();
        approx::assert_relative_eq!(low, 0.8 * 206.264806 * 3.8 / 400.0, epsilon = 1e-9);
    }

    #[test]
    fn half_given_scale_is_replaced_by_the_instrument_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[("XPIXSZ", 3.8), ("FOCALLEN", 400.0)]);
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        let opts = PlateSolveOptions {
            hints: SolveHints {
                scale_min: Some(50.0),
                ..Default::default()
            },
            ..options(5)
        };
        solver.solve_file(&path, &opts).unwrap();
        let (low, high) = api.calls.borrow()[0].hints.scale_bounds().unwrap();
        let scale = 206.264806 * 3.8 / 400.0;
        approx::assert_relative_eq!(low, 0.8 * scale, epsilon = 1e-9);
        approx::assert_relative_eq!(high, 1.2 * scale, epsilon = 1e-9);
        assert!(low < high);
    }

    #[test]
    fn blank_frame_has_no_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let api = Recorder::default();
        let solver = PlateSolver::with_solvers(Recorder::default(), api.clone());

        let err = solver
            .solve_file(&path, &PlateSolveOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SolveError>(),
            Some(SolveError::NoSources)
        ));
        assert!(api.calls.borrow().is_empty());
    }

    #[test]
    fn failures_leave_the_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = blank_fits(dir.path(), &[]);
        let api = Recorder {
            fail: true,
            ..Default::default()
        };
        let solver = PlateSolver::with_solvers(Recorder::default(), api);

        let err = solver.solve_file(&path, &options(5)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SolveError>(),
            Some(SolveError::CouldNotSolve(_))
        ));
        assert!(!read_header(&path, 0).unwrap().contains(SOLVED_KEY));
    }
}
