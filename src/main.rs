use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use widefield_solver::solver::nova::{API_KEY_ENV, NOVA_BASE_URL};
use widefield_solver::solver::{LocalSolverConfig, NovaConfig};
use widefield_solver::{Backend, PlateSolveOptions, PlateSolver, SolveError, SolveHints};

#[derive(Parser)]
#[command(
    name = "widefield-plate-solve",
    about = "Plate solve wide-field FITS images with astrometry.net"
)]
struct Args {
    /// FITS file, or a directory whose FITS files are all solved
    path: PathBuf,

    /// Do not use an existing WCS or instrument keywords as hints
    #[arg(long)]
    do_not_guess_from_header: bool,

    /// Solve with nova.astrometry.net instead of a local solve-field
    #[arg(long)]
    use_api: bool,

    /// Solve again files already marked as solved
    #[arg(long)]
    redo: bool,

    /// Print the WCS of each solved file
    #[arg(long)]
    verbose: bool,

    /// Approximate right ascension of the field centre, degrees
    #[arg(long, allow_hyphen_values = true)]
    ra_approx: Option<f64>,

    /// Approximate declination of the field centre, degrees
    #[arg(long, allow_hyphen_values = true)]
    dec_approx: Option<f64>,

    /// Smallest pixel scale to consider, arcsec/pixel
    #[arg(long)]
    scale_min: Option<f64>,

    /// Largest pixel scale to consider, arcsec/pixel
    #[arg(long)]
    scale_max: Option<f64>,

    /// Number of brightest stars sent to the solver
    #[arg(long, default_value_t = 15)]
    use_n_brightest_only: usize,

    /// nova.astrometry.net API key
    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the astrometry.net API
    #[arg(long, default_value = NOVA_BASE_URL)]
    api_url: String,

    /// Local solve-field executable
    #[arg(long, default_value = "/usr/bin/solve-field")]
    solve_field: PathBuf,

    /// Give up on an API job after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

impl Args {
    fn hints(&self) -> SolveHints {
        SolveHints {
            ra_approx: self.ra_approx,
            dec_approx: self.dec_approx,
            scale_min: self.scale_min,
            scale_max: self.scale_max,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let files = if args.path.is_dir() {
        collect_fits_files(&args.path)
    } else {
        vec![args.path.clone()]
    };
    if files.is_empty() {
        anyhow::bail!("no FITS files found in {}", args.path.display());
    }

    let hints = args.hints();
    let options = PlateSolveOptions {
        // Explicit hints win over anything read from the header.
        use_existing_wcs_as_guess: !args.do_not_guess_from_header && hints.is_empty(),
        use_n_brightest_only: Some(args.use_n_brightest_only),
        redo_if_done: args.redo,
        backend: if args.use_api {
            Backend::Api
        } else {
            Backend::Local
        },
        hints,
        ..Default::default()
    };

    let solver = PlateSolver::new(
        LocalSolverConfig {
            solve_field: args.solve_field.clone(),
            ..Default::default()
        },
        NovaConfig {
            base_url: args.api_url.clone(),
            api_key: args.api_key.clone(),
            timeout: Duration::from_secs(args.timeout),
            ..Default::default()
        },
    )?;

    let mut failed = 0;
    for path in &files {
        match solver.solve_file(path, &options) {
            Ok(wcs) => {
                if args.verbose {
                    println!("{wcs}");
                }
            }
            Err(err) => {
                if let Some(SolveError::ApiKeyNotFound) = err.downcast_ref::<SolveError>() {
                    return Err(err);
                }
                tracing::warn!("{}: {err:#}", path.display());
                println!("Failed to solve field: {}", path.display());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        tracing::info!("{failed} of {} files could not be solved", files.len());
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// FITS files directly inside `dir`, sorted by name.
fn collect_fits_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e.to_ascii_lowercase())
                        .as_deref(),
                    Some("fits" | "fit" | "fts")
                )
        })
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hint_flags() {
        let args = Args::try_parse_from([
            "widefield-plate-solve",
            "frame.fits",
            "--use-api",
            "--dec-approx",
            "-12.5",
            "--ra-approx",
            "150",
            "--use-n-brightest-only",
            "30",
        ])
        .unwrap();
        assert!(args.use_api);
        assert_eq!(args.hints().pointing(), Some((150.0, -12.5)));
        assert_eq!(args.use_n_brightest_only, 30);
        assert!(!args.redo);
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["widefield-plate-solve", "dir"]).unwrap();
        assert_eq!(args.use_n_brightest_only, 15);
        assert_eq!(args.solve_field, PathBuf::from("/usr/bin/solve-field"));
        assert_eq!(args.api_url, NOVA_BASE_URL);
        assert!(args.hints().is_empty());
    }

    #[test]
    fn directory_listing_keeps_fits_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.fits", "a.FIT", "c.fts", "notes.txt", "d.fz"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.fits")).unwrap();
        let names: Vec<String> = collect_fits_files(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.FIT", "b.fits", "c.fts"]);
    }
}
