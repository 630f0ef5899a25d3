//! WCS keywords: picking them out of a solved header and turning an existing
//! (possibly stale) solution into hints for the next solve.

use crate::header::Header;
use crate::solver::SolveHints;

/// Scale bounds around a known pixel scale.
pub const SCALE_LOW_FACTOR: f64 = 0.8;
pub const SCALE_HIGH_FACTOR: f64 = 1.2;

const ARCSEC_PER_RADIAN: f64 = 206_264.806;

/// Whether `key` belongs to a celestial WCS description, SIP distortion
/// terms included.
pub fn is_wcs_key(key: &str) -> bool {
    const EXACT: &[&str] = &[
        "WCSAXES", "LONPOLE", "LATPOLE", "RADESYS", "RADECSYS", "EQUINOX", "MJDREF", "DATEREF",
        "A_ORDER", "B_ORDER", "AP_ORDER", "BP_ORDER",
    ];
    const INDEXED: &[&str] = &["CTYPE", "CUNIT", "CRVAL", "CRPIX", "CDELT", "CROTA"];
    const MATRIX: &[&str] = &["CD", "PC", "A_", "B_", "AP_", "BP_"];

    EXACT.contains(&key)
        || INDEXED
            .iter()
            .any(|p| key.strip_prefix(p).is_some_and(is_digits))
        || MATRIX
            .iter()
            .any(|p| key.strip_prefix(p).is_some_and(is_index_pair))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// `i_j` with both sides numeric.
fn is_index_pair(s: &str) -> bool {
    s.split_once('_')
        .is_some_and(|(i, j)| is_digits(i) && is_digits(j))
}

/// The WCS subset of `header`, in header order.
pub fn wcs_cards(header: &Header) -> Header {
    header
        .iter()
        .filter(|card| is_wcs_key(&card.key))
        .cloned()
        .collect()
}

/// Equatorial WCS read from an image header.
#[derive(Debug, Clone, PartialEq)]
pub struct CelestialWcs {
    /// Reference point `(ra, dec)` in degrees.
    pub crval: [f64; 2],
    /// Linear pixel-to-intermediate transform in degrees per pixel, when the
    /// header defines one.
    pub pixel_scale_matrix: Option<[[f64; 2]; 2]>,
}

impl CelestialWcs {
    /// Present only when the first two axes form an RA/Dec pair.
    pub fn from_header(header: &Header) -> Option<Self> {
        let ctype1 = header.get_str("CTYPE1")?;
        let ctype2 = header.get_str("CTYPE2")?;
        if !(ctype1.starts_with("RA--") && ctype2.starts_with("DEC-")) {
            return None;
        }
        let crval = [header.get_f64("CRVAL1")?, header.get_f64("CRVAL2")?];

        Some(CelestialWcs {
            crval,
            pixel_scale_matrix: pixel_scale_matrix(header),
        })
    }

    /// Size of one pixel along the first axis, arcsec.
    pub fn pixel_scale_arcsec(&self) -> Option<f64> {
        let m = self.pixel_scale_matrix?;
        let scale = 3600.0 * (m[0][0].powi(2) + m[0][1].powi(2)).sqrt();
        (scale.is_finite() && scale > 0.0).then_some(scale)
    }
}

/// `CDi_j` if any is present, else `CDELTi` combined with `PCi_j` or the
/// legacy `CROTA2` rotation.
fn pixel_scale_matrix(header: &Header) -> Option<[[f64; 2]; 2]> {
    let cd = |i: usize, j: usize| header.get_f64(&format!("CD{i}_{j}"));
    let has_cd = (1..=2).any(|i| (1..=2).any(|j| cd(i, j).is_some()));
    if has_cd {
        let v = |i, j| cd(i, j).unwrap_or(0.0);
        return Some([[v(1, 1), v(1, 2)], [v(2, 1), v(2, 2)]]);
    }

    let cdelt1 = header.get_f64("CDELT1")?;
    let cdelt2 = header.get_f64("CDELT2").unwrap_or(cdelt1);

    let pc = |i: usize, j: usize| header.get_f64(&format!("PC{i}_{j}"));
    let has_pc = (1..=2).any(|i| (1..=2).any(|j| pc(i, j).is_some()));
    if has_pc {
        let v = |i, j| pc(i, j).unwrap_or(if i == j { 1.0 } else { 0.0 });
        return Some([
            [cdelt1 * v(1, 1), cdelt1 * v(1, 2)],
            [cdelt2 * v(2, 1), cdelt2 * v(2, 2)],
        ]);
    }

    let rho = header.get_f64("CROTA2").unwrap_or(0.0).to_radians();
    Some([
        [cdelt1 * rho.cos(), -cdelt2 * rho.sin()],
        [cdelt1 * rho.sin(), cdelt2 * rho.cos()],
    ])
}

/// Hints from a WCS already present in the header: its reference point as
/// the pointing and +/-20 % around its pixel scale.
pub fn guess_from_wcs(header: &Header) -> Option<SolveHints> {
    let wcs = CelestialWcs::from_header(header)?;
    let scale = wcs.pixel_scale_arcsec();
    Some(SolveHints {
        ra_approx: Some(wcs.crval[0]),
        dec_approx: Some(wcs.crval[1]),
        scale_min: scale.map(|s| SCALE_LOW_FACTOR * s),
        scale_max: scale.map(|s| SCALE_HIGH_FACTOR * s),
    })
}

/// Hints from acquisition keywords: pixel scale from `XPIXSZ` (microns,
/// binning included) and `FOCALLEN` (mm), pointing from numeric `RA`/`DEC`
/// in degrees.
pub fn guess_from_instrument(header: &Header) -> SolveHints {
    let scale = match (header.get_f64("XPIXSZ"), header.get_f64("FOCALLEN")) {
        (Some(pixel_um), Some(focal_mm)) if pixel_um > 0.0 && focal_mm > 0.0 => {
            Some(ARCSEC_PER_RADIAN * pixel_um * 1e-3 / focal_mm)
        }
        _ => None,
    };
    let (ra, dec) = match (header.get_f64("RA"), header.get_f64("DEC")) {
        (Some(ra), Some(dec)) if (0.0..360.0).contains(&ra) && (-90.0..=90.0).contains(&dec) => {
            (Some(ra), Some(dec))
        }
        _ => (None, None),
    };
    SolveHints {
        ra_approx: ra,
        dec_approx: dec,
        scale_min: scale.map(|s| SCALE_LOW_FACTOR * s),
        scale_max: scale.map(|s| SCALE_HIGH_FACTOR * s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tan_header() -> Header {
        let mut h = Header::new();
        h.set("NAXIS1", 6000i64);
        h.set("CTYPE1", "RA---TAN-SIP");
        h.set("CTYPE2", "DEC--TAN-SIP");
        h.set("CRVAL1", 83.82);
        h.set("CRVAL2", -5.39);
        h.set("CRPIX1", 3000.5);
        h.set("CRPIX2", 2000.5);
        h.set("CD1_1", -0.0);
        h.set("CD1_2", 2.0 / 3600.0);
        h.set("CD2_1", -2.0 / 3600.0);
        h.set("CD2_2", 0.0);
        h.set("A_ORDER", 2i64);
        h.set("A_0_2", 1.2e-7);
        h.set("BP_1_1", -3.0e-8);
        h.set("IMAGEW", 6000i64);
        h.set("DATE-OBS", "2024-01-02T03:04:05");
        h
    }

    #[test]
    fn recognises_wcs_keys() {
        for key in ["CTYPE1", "CRVAL2", "CD1_2", "PC2_1", "CDELT1", "CROTA2", "A_ORDER", "AP_0_1", "B_2_0", "RADESYS"] {
            assert!(is_wcs_key(key), "{key}");
        }
        for key in ["NAXIS1", "CTYPE", "CD1", "A_X_1", "IMAGEW", "DATE-OBS", "EXPTIME", "PL-SLVED"] {
            assert!(!is_wcs_key(key), "{key}");
        }
    }

    #[test]
    fn wcs_subset_keeps_order() {
        let cards = wcs_cards(&tan_header());
        let keys: Vec<&str> = cards.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "CTYPE1", "CTYPE2", "CRVAL1", "CRVAL2", "CRPIX1", "CRPIX2", "CD1_1", "CD1_2",
                "CD2_1", "CD2_2", "A_ORDER", "A_0_2", "BP_1_1"
            ]
        );
    }

    #[test]
    fn rotated_cd_matrix_gives_scale() {
        let wcs = CelestialWcs::from_header(&tan_header()).unwrap();
        assert_eq!(wcs.crval, [83.82, -5.39]);
        assert_relative_eq!(wcs.pixel_scale_arcsec().unwrap(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn cdelt_with_pc_and_crota() {
        let mut h = Header::new();
        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        h.set("CRVAL1", 10.0);
        h.set("CRVAL2", 20.0);
        h.set("CDELT1", -1.5 / 3600.0);
        h.set("CDELT2", 1.5 / 3600.0);
        let wcs = CelestialWcs::from_header(&h).unwrap();
        assert_relative_eq!(wcs.pixel_scale_arcsec().unwrap(), 1.5, epsilon = 1e-9);

        h.set("CROTA2", 30.0);
        let wcs = CelestialWcs::from_header(&h).unwrap();
        assert_relative_eq!(wcs.pixel_scale_arcsec().unwrap(), 1.5, epsilon = 1e-9);

        h.set("PC1_1", 0.0);
        h.set("PC1_2", 1.0);
        let m = CelestialWcs::from_header(&h).unwrap().pixel_scale_matrix.unwrap();
        assert_relative_eq!(m[0][1], -1.5 / 3600.0, epsilon = 1e-12);
        assert_relative_eq!(m[1][1], 1.5 / 3600.0, epsilon = 1e-12);
    }

    #[test]
    fn non_equatorial_or_incomplete_headers_give_nothing() {
        let mut h = Header::new();
        assert!(CelestialWcs::from_header(&h).is_none());

        h.set("CTYPE1", "GLON-TAN");
        h.set("CTYPE2", "GLAT-TAN");
        h.set("CRVAL1", 10.0);
        h.set("CRVAL2", 20.0);
        assert!(CelestialWcs::from_header(&h).is_none());

        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        let wcs = CelestialWcs::from_header(&h).unwrap();
        assert!(wcs.pixel_scale_arcsec().is_none());
    }

    #[test]
    fn guess_uses_twenty_percent_bounds() {
        let hints = guess_from_wcs(&tan_header()).unwrap();
        assert_eq!(hints.ra_approx, Some(83.82));
        assert_eq!(hints.dec_approx, Some(-5.39));
        assert_relative_eq!(hints.scale_min.unwrap(), 1.6, epsilon = 1e-9);
        assert_relative_eq!(hints.scale_max.unwrap(), 2.4, epsilon = 1e-9);
    }

    #[test]
    fn instrument_keywords_give_scale_and_pointing() {
        let mut h = Header::new();
        h.set("XPIXSZ", 3.76);
        h.set("FOCALLEN", 135.0);
        h.set("RA", 201.3);
        h.set("DEC", -43.0);
        let hints = guess_from_instrument(&h);
        let scale = 206.264806 * 3.76 / 135.0;
        assert_relative_eq!(hints.scale_min.unwrap(), 0.8 * scale, epsilon = 1e-9);
        assert_relative_eq!(hints.scale_max.unwrap(), 1.2 * scale, epsilon = 1e-9);
        assert_eq!(hints.pointing(), Some((201.3, -43.0)));

        h.set("RA", "13:25:12");
        assert_eq!(guess_from_instrument(&h).pointing(), None);
    }
}
