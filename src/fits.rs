use crate::header::{read_header, Header};
use anyhow::{bail, Context, Result};
use fitsio::hdu::HduInfo;
#[allow(unused_imports)]
use fitsio::images::ReadImage; // trait needed for hdu.read_image()
use fitsio::FitsFile;
use std::io::Cursor;
use std::path::Path;

/// Luminance pixels loaded from one FITS image HDU, ready for star extraction.
///
/// Data layout: row-major `width * height` f32 values,
/// `data[row * width + col]`, row 0 being the first row stored in the file.
pub struct FitsImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
    /// Header of the HDU the pixels came from.
    pub header: Header,
    /// Index of that HDU; the solved WCS is written back here.
    pub hdu_index: usize,
}

impl FitsImage {
    /// Load the first image HDU that contains data from `path`.
    ///
    /// Three-plane images are averaged into one plane; single-plane colour
    /// sensor frames are demosaiced first.
    pub fn load(path: &Path) -> Result<Self> {
        let mut fits =
            FitsFile::open(path).with_context(|| format!("opening {}", path.display()))?;

        let hdu_index = find_image_hdu(&mut fits)
            .with_context(|| format!("no image HDU found in {}", path.display()))?;
        let header = read_header(path, hdu_index)?;
        let (width, height) = image_dimensions(&header)?;
        let planes = header.get_i64("NAXIS3").unwrap_or(1).max(1) as usize;
        let npix = width * height;

        let hdu = fits.hdu(hdu_index)?;
        let data = match (planes, detect_bayer_pattern(&header)) {
            (1, Some(cfa)) => {
                tracing::debug!("debayering colour sensor frame {}", path.display());
                let raw: Vec<u16> = hdu.read_image(&mut fits)?;
                debayer_to_luminance(&raw, width, height, cfa)?
            }
            (1, None) => hdu.read_image(&mut fits)?,
            (3, _) => {
                let raw: Vec<f32> = hdu.read_image(&mut fits)?;
                if raw.len() < 3 * npix {
                    bail!("short read: {} of {} pixels", raw.len(), 3 * npix);
                }
                (0..npix)
                    .map(|i| (raw[i] + raw[npix + i] + raw[2 * npix + i]) / 3.0)
                    .collect()
            }
            (n, _) => bail!("unsupported number of image planes: {n}"),
        };

        if data.len() != npix {
            bail!("expected {npix} pixels, read {}", data.len());
        }

        Ok(FitsImage {
            width,
            height,
            data,
            header,
            hdu_index,
        })
    }

    /// Wrap an in-memory plane (row-major, `width * height` values).
    pub fn from_raw(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            bail!(
                "plane of {} pixels does not match {width}x{height}",
                data.len()
            );
        }
        Ok(FitsImage {
            width,
            height,
            data,
            header: Header::new(),
            hdu_index: 0,
        })
    }
}

/// Index of the first HDU holding a non-empty image.
pub fn find_image_hdu(fits: &mut FitsFile) -> Option<usize> {
    let hdu_count = fits.iter().count();
    (0..hdu_count).find(|&i| {
        fits.hdu(i).ok().is_some_and(|hdu| {
            matches!(hdu.info, HduInfo::ImageInfo { ref shape, .. }
                if !shape.is_empty() && shape.iter().product::<usize>() > 0)
        })
    })
}

/// `(NAXIS1, NAXIS2)` of an image header.
pub fn image_dimensions(header: &Header) -> Result<(usize, usize)> {
    let axis = |key: &str| -> Result<usize> {
        let v = header
            .get_i64(key)
            .with_context(|| format!("missing {key} keyword"))?;
        if v <= 0 {
            bail!("{key} = {v} is not a valid image axis");
        }
        Ok(v as usize)
    };
    Ok((axis("NAXIS1")?, axis("NAXIS2")?))
}

// ---------------------------------------------------------------------------
// Bayer / debayering
// ---------------------------------------------------------------------------

/// Detect the Bayer CFA pattern from FITS headers.
/// Returns None if no Bayer pattern is detected (monochrome sensor).
fn detect_bayer_pattern(header: &Header) -> Option<bayer::CFA> {
    let cfa_from = |key: &str| match header.get_str(key)?.trim().to_uppercase().as_str() {
        "RGGB" => Some(bayer::CFA::RGGB),
        "BGGR" => Some(bayer::CFA::BGGR),
        "GRBG" => Some(bayer::CFA::GRBG),
        "GBRG" => Some(bayer::CFA::GBRG),
        _ => None,
    };

    if let Some(cfa) = cfa_from("BAYERPAT").or_else(|| cfa_from("COLORTYP")) {
        return Some(cfa);
    }

    // Only auto-assume Bayer for known colour sensors; never guess for
    // unknown instruments to avoid debayering monochrome images.
    let instrume = header.get_str("INSTRUME")?.to_uppercase();
    if instrume.contains("COLOR") || instrume.contains("COLOUR") || instrume.contains("OSC") {
        Some(bayer::CFA::RGGB)
    } else {
        None
    }
}

/// Debayer a u16 single-plane image and average R, G, B into one plane.
fn debayer_to_luminance(
    raw: &[u16],
    width: usize,
    height: usize,
    cfa: bayer::CFA,
) -> Result<Vec<f32>> {
    let mut bytes = Vec::with_capacity(raw.len() * 2);
    for &v in raw {
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    // 3 channels at 16-bit = 6 bytes/pixel
    let npix = width * height;
    let mut rgb_buf = vec![0u8; npix * 6];
    {
        let mut dst =
            bayer::RasterMut::new(width, height, bayer::RasterDepth::Depth16, &mut rgb_buf);
        bayer::run_demosaic(
            &mut Cursor::new(&bytes),
            bayer::BayerDepth::Depth16LE,
            cfa,
            bayer::Demosaic::Cubic,
            &mut dst,
        )
        .map_err(|e| anyhow::anyhow!("debayer error: {e:?}"))?;
    }

    // rgb_buf layout: [R0_lo, R0_hi, G0_lo, G0_hi, B0_lo, B0_hi, R1_lo, ...]
    Ok(rgb_buf
        .chunks_exact(6)
        .map(|px| {
            let r = u16::from_le_bytes([px[0], px[1]]) as f32;
            let g = u16::from_le_bytes([px[2], px[3]]) as f32;
            let b = u16::from_le_bytes([px[4], px[5]]) as f32;
            (r + g + b) / 3.0
        })
        .collect())
}
