use anyhow::{bail, Context, Result};
use fitsio::FitsFile;
use std::ffi::CString;
use std::fmt;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

const CARD_LEN: usize = 80;
const BLOCK_LEN: usize = 2880;

/// Value part of a FITS header card.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    /// `KEY     =` with nothing after the value indicator.
    Empty,
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Integer(v) => Some(*v as f64),
            HeaderValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(v) => Some(*v),
            HeaderValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse the raw value field of a card (comment already removed).
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return HeaderValue::Empty;
        }
        if raw.starts_with('\'') {
            let inner = if raw.len() >= 2 && raw.ends_with('\'') {
                &raw[1..raw.len() - 1]
            } else {
                &raw[1..]
            };
            // Trailing blanks inside FITS strings are not significant
            return HeaderValue::Text(inner.replace("''", "'").trim_end().to_string());
        }
        match raw {
            "T" => return HeaderValue::Logical(true),
            "F" => return HeaderValue::Logical(false),
            _ => {}
        }
        if let Ok(v) = raw.parse::<i64>() {
            return HeaderValue::Integer(v);
        }
        // Fortran-style double exponents: 1.5D+03
        if let Ok(v) = raw.replace(['D', 'd'], "E").parse::<f64>() {
            return HeaderValue::Real(v);
        }
        HeaderValue::Text(raw.to_string())
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Logical(true) => write!(f, "T"),
            HeaderValue::Logical(false) => write!(f, "F"),
            HeaderValue::Integer(v) => write!(f, "{v}"),
            HeaderValue::Real(v) => write!(f, "{v:E}"),
            HeaderValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            HeaderValue::Empty => Ok(()),
        }
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Real(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Integer(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Logical(v)
    }
}

/// One `KEY = value / comment` record.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub key: String,
    pub value: HeaderValue,
    pub comment: Option<String>,
}

/// Value-bearing cards of one HDU, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.iter().find(|c| c.key == key).map(|c| &c.value)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cards.iter().any(|c| c.key == key)
    }

    /// Replace the value of `key`, or append a new card if it is absent.
    pub fn set(&mut self, key: &str, value: impl Into<HeaderValue>) {
        let value = value.into();
        match self.cards.iter_mut().find(|c| c.key == key) {
            Some(card) => card.value = value,
            None => self.cards.push(Card {
                key: key.to_string(),
                value,
                comment: None,
            }),
        }
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Card> {
        self.cards.iter()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

impl FromIterator<Card> for Header {
    fn from_iter<I: IntoIterator<Item = Card>>(iter: I) -> Self {
        Header {
            cards: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = &'a Card;
    type IntoIter = std::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.cards.iter()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for card in &self.cards {
            write!(f, "{:<8}= {}", card.key, card.value)?;
            if let Some(comment) = &card.comment {
                write!(f, " / {comment}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read the header of HDU `hdu_index` by parsing the raw FITS file.
///
/// FITS headers consist of 80-byte ASCII records packed into 2880-byte blocks.
/// Commentary cards (COMMENT, HISTORY, blank, CONTINUE) are skipped; the rest
/// are returned in file order.
pub fn read_header(path: &Path, hdu_index: usize) -> Result<Header> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for header read", path.display()))?;
    read_header_from(BufReader::new(file), hdu_index)
        .with_context(|| format!("reading header of HDU {hdu_index} in {}", path.display()))
}

/// Parse the primary header of an in-memory FITS file.
pub fn parse_header_bytes(bytes: &[u8]) -> Result<Header> {
    read_header_from(Cursor::new(bytes), 0)
}

fn read_header_from<R: Read + Seek>(mut reader: R, hdu_index: usize) -> Result<Header> {
    let mut block = [0u8; BLOCK_LEN];
    let mut hdus_seen = 0usize;

    loop {
        let mut header = Header::new();
        let mut found_end = false;
        while !found_end {
            reader
                .read_exact(&mut block)
                .context("reading FITS header block")?;
            for rec in block.chunks_exact(CARD_LEN) {
                if is_end_card(rec) {
                    found_end = true;
                    break;
                }
                if let Some(card) = parse_card(rec) {
                    header.push(card);
                }
            }
        }

        if hdus_seen == hdu_index {
            return Ok(header);
        }
        hdus_seen += 1;

        let data_size = padded_data_size(&header);
        if data_size > 0 {
            reader
                .seek(SeekFrom::Current(data_size as i64))
                .context("seeking past FITS data block")?;
        }
    }
}

fn is_end_card(rec: &[u8]) -> bool {
    rec.starts_with(b"END") && rec[3..].iter().all(|&b| b == b' ')
}

/// Size in bytes of the data unit that follows `header`, rounded up to a
/// whole number of blocks.
fn padded_data_size(header: &Header) -> u64 {
    let naxis = header.get_i64("NAXIS").unwrap_or(0);
    if naxis == 0 {
        return 0;
    }
    let bytes_per_element = header.get_i64("BITPIX").unwrap_or(8).unsigned_abs() / 8;
    let mut npix: u64 = 1;
    for i in 1..=naxis {
        npix *= header.get_i64(&format!("NAXIS{i}")).unwrap_or(0).max(0) as u64;
    }
    let pcount = header.get_i64("PCOUNT").unwrap_or(0).max(0) as u64;
    let gcount = header.get_i64("GCOUNT").unwrap_or(1).max(1) as u64;
    let size = bytes_per_element * gcount * (pcount + npix);
    size.div_ceil(BLOCK_LEN as u64) * BLOCK_LEN as u64
}

fn parse_card(rec: &[u8]) -> Option<Card> {
    let card = std::str::from_utf8(rec).ok()?.trim_end();
    if card.len() < 8 || !card.is_ascii() {
        return None;
    }
    let key = card[..8].trim();
    if key.is_empty() || matches!(key, "COMMENT" | "HISTORY" | "END" | "CONTINUE") {
        return None;
    }
    // Value indicator "= " in columns 9-10
    if card.len() < 10 || &card[8..10] != "= " {
        return None;
    }
    let (value, comment) = split_comment(&card[10..]);
    Some(Card {
        key: key.to_string(),
        value: HeaderValue::parse(value),
        comment,
    })
}

/// Split a value field into the value and its ` / comment`, respecting quoted
/// strings.
fn split_comment(field: &str) -> (&str, Option<String>) {
    let s = field.trim();
    let value_end = if s.starts_with('\'') {
        // Quoted string: find closing quote (doubled quotes are escaped)
        let bytes = s.as_bytes();
        let mut i = 1;
        let mut end = s.len();
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                    continue;
                }
                end = i + 1;
                break;
            }
            i += 1;
        }
        end
    } else {
        s.find('/').unwrap_or(s.len())
    };

    let value = s[..value_end].trim_end();
    let comment = s[value_end..]
        .trim_start()
        .strip_prefix('/')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    (value, comment)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Digits after the decimal point for real values, enough to round-trip an
/// f64 through the header.
const REAL_DECIMALS: i32 = 15;

/// Write `cards` into HDU `hdu_index` of an existing file. Keywords already
/// present are updated in place; the rest are appended.
pub fn write_cards(path: &Path, hdu_index: usize, cards: &Header) -> Result<()> {
    let mut fits =
        FitsFile::edit(path).with_context(|| format!("opening {} for update", path.display()))?;
    // Moves to the HDU; the raw calls below act on the current one
    fits.hdu(hdu_index)?;

    for card in cards {
        update_key(&mut fits, card)
            .with_context(|| format!("writing {} to {}", card.key, path.display()))?;
    }
    Ok(())
}

fn update_key(fits: &mut FitsFile, card: &Card) -> Result<()> {
    let key = CString::new(card.key.as_str())?;
    let text = CString::new(card.value.as_str().unwrap_or_default())?;
    let comment = card.comment.as_deref().map(CString::new).transpose()?;
    let comment = comment.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());

    let mut status = 0;
    // SAFETY: the pointer comes from an open FitsFile that outlives this
    // call, and every string is a NUL-terminated CString still in scope.
    unsafe {
        let fptr = fits.as_raw();
        match &card.value {
            HeaderValue::Integer(v) => {
                fitsio::sys::ffukyj(fptr, key.as_ptr(), *v, comment, &mut status)
            }
            HeaderValue::Real(v) => fitsio::sys::ffukyd(
                fptr,
                key.as_ptr(),
                *v,
                REAL_DECIMALS,
                comment,
                &mut status,
            ),
            HeaderValue::Text(_) => {
                fitsio::sys::ffukys(fptr, key.as_ptr(), text.as_ptr(), comment, &mut status)
            }
            HeaderValue::Logical(v) => {
                fitsio::sys::ffukyl(fptr, key.as_ptr(), i32::from(*v), comment, &mut status)
            }
            HeaderValue::Empty => fitsio::sys::ffukyu(fptr, key.as_ptr(), comment, &mut status),
        };
    }
    if status != 0 {
        bail!("cfitsio error {status} updating keyword {}", card.key);
    }
    Ok(())
}
