//! Plate solving for wide-field astronomical images.
//!
//! Stars are extracted locally from a FITS image, the brightest ones are sent
//! to astrometry.net (the nova web API or a local `solve-field`), and the
//! resulting WCS is written back into the image header together with a
//! `PL-SLVED = 'done'` marker.
//!
//! ```no_run
//! use widefield_solver::{plate_solve, Backend, PlateSolveOptions};
//!
//! let options = PlateSolveOptions {
//!     backend: Backend::Local,
//!     use_n_brightest_only: Some(15),
//!     ..Default::default()
//! };
//! let wcs = plate_solve(std::path::Path::new("m42.fits"), &options)?;
//! println!("{wcs}");
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod extract;
pub mod fits;
pub mod header;
pub mod plate_solve;
pub mod solver;
pub mod sources;
pub mod wcs;

pub use extract::{extract_stars, ExtractionConfig};
pub use fits::FitsImage;
pub use header::{Card, Header, HeaderValue};
pub use plate_solve::{plate_solve, Backend, PlateSolveOptions, PlateSolver};
pub use solver::{SolveError, SolveHints};
pub use sources::{Source, SourceList};
