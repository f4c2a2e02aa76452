//! Shared plumbing: possibly-zipped feed input, cell parsing, rounding.

use color_eyre::eyre::{eyre, Context, Result};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use SeekFrom::Start;

/// The fatal error taxonomy of the analysis core.
///
/// Everything else (missing columns, duplicate precinct ids, empty eligible
/// data, unknown party codes, a solver stopping at its iteration ceiling) is
/// recovered locally with a diagnostic and never raised.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A matched-pair list was empty, or a ballot table has zero rows.
    #[error("no usable input: {0}")]
    InputEmpty(String),
    /// An election id was requested that the configuration does not declare.
    #[error("unknown election id: {0}")]
    UnknownElection(String),
}

/// Opens a file, possibly zipped, for reading.
/// If the zipfile contains more than one file, the first will be returned.
/// Performance note: has to unzip and return the entire file.
pub fn open_csvz<T: 'static>(mut infile: T) -> Result<Box<dyn Read>>
where
    T: Read + Seek,
{
    if !is_zip(&mut infile)? {
        Ok(Box::new(infile))
    } else {
        let mut zippah = zip::ZipArchive::new(infile).context("error establishing the ZIP")?;
        let mut zippy = zippah.by_index(0).context("no file in ZIP")?;
        // We're going to need to just go ahead and read the entire thing into memory
        let zs = zippy.size() as usize;
        let mut bigbuf: Vec<u8> = Vec::with_capacity(zs);
        zippy.read_to_end(&mut bigbuf).context("error reading ZIP")?;
        Ok(Box::new(Cursor::new(bigbuf)))
    }
}

/// Opens blah.csv OR blah.zip
pub fn open_csvz_from_path(inpath: &Path) -> Result<Box<dyn Read>> {
    if inpath.exists() && inpath.is_file() {
        open_csvz(File::open(inpath)?)
    } else {
        let zipped = inpath.with_extension("zip");
        if zipped.exists() {
            open_csvz(File::open(zipped)?)
        } else {
            Err(eyre!(
                "could not find {} whether compressed or not",
                inpath.display()
            ))
        }
    }
}

/// Peeks at the contents to check the magic number.
/// Operates on a `Read+Seek` rather than a full `File`.
pub fn is_zip<T>(infile: &mut T) -> Result<bool>
where
    T: Read + Seek,
{
    const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
    let pos = infile.stream_position()?;
    let mut buffer: [u8; 4] = [0; 4];
    let bytes_read = infile.read(&mut buffer)?;
    infile
        .seek(Start(pos))
        .context("couldn't seek back to the start after testing whether a file was a ZIP")?;
    Ok(bytes_read == ZIP_SIGNATURE.len() && buffer == ZIP_SIGNATURE)
}

/// Parse a feed cell as a non-negative count.
///
/// Historical feeds carry counts as "123", "123.0" or an empty cell; all
/// three must land on the obvious integer. Anything unparseable is zero.
pub fn parse_count(cell: &str) -> u32 {
    let cell = cell.trim();
    if cell.is_empty() {
        return 0;
    }
    if let Ok(n) = cell.parse::<u32>() {
        return n;
    }
    cell.parse::<f64>()
        .map(|x| {
            if x.is_finite() && x > 0.0 {
                x.round() as u32
            } else {
                0
            }
        })
        .unwrap_or(0)
}

/// Round to one decimal place (percent reporting).
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Round to `d` decimal places.
pub fn roundn(x: f64, d: u32) -> f64 {
    let f = 10_f64.powi(d as i32);
    (x * f).round() / f
}
