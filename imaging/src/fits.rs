//! FITS file I/O
//!
//! Implements FITS reading and writing for single-plane unsigned images
//! according to the FITS standard.
//!
//! FITS format:
//! - 2880-byte blocks
//! - Header with 80-character keyword records
//! - Data in big-endian format; unsigned 16-bit data is stored as signed
//!   with BZERO = 32768

use crate::{SampleArray, Samples};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const BLOCK: usize = 2880;
const RECORD: usize = 80;

/// Keywords managed by the writer itself
const STRUCTURAL: [&str; 8] = ["SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "BZERO", "BSCALE"];

/// FITS header containing all keywords
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    /// Keyword-value pairs
    pub keywords: HashMap<String, FitsValue>,
    /// Keywords in order (for writing)
    keyword_order: Vec<String>,
    /// Optional record comments
    comments: HashMap<String, String>,
}

/// FITS value types
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    String(String),
    Integer(i64),
    Float(f64),
    /// Float written with a fixed number of decimals
    Fixed(f64, usize),
    Boolean(bool),
}

impl FitsValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            FitsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FitsValue::Integer(i) => Some(*i),
            FitsValue::Float(f) | FitsValue::Fixed(f, _) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FitsValue::Float(f) | FitsValue::Fixed(f, _) => Some(*f),
            FitsValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FitsValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Value field as written in a header record
    fn render(&self) -> String {
        match self {
            FitsValue::String(s) => format!("'{:<8}'", s.replace('\'', "''")),
            FitsValue::Integer(i) => i.to_string(),
            FitsValue::Float(f) => format!("{:.10E}", f),
            FitsValue::Fixed(f, decimals) => format!("{:.*}", decimals, f),
            FitsValue::Boolean(b) => if *b { "T".to_string() } else { "F".to_string() },
        }
    }
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: &str, value: FitsValue) {
        let key_upper = key.to_uppercase();
        if !self.keyword_order.contains(&key_upper) {
            self.keyword_order.push(key_upper.clone());
        }
        self.keywords.insert(key_upper, value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.insert(key, FitsValue::String(value.to_string()));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.insert(key, FitsValue::Integer(value));
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.insert(key, FitsValue::Float(value));
    }

    /// Set a float written with exactly `decimals` decimal places
    pub fn set_fixed(&mut self, key: &str, value: f64, decimals: usize) {
        self.insert(key, FitsValue::Fixed(value, decimals));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.insert(key, FitsValue::Boolean(value));
    }

    /// Attach a comment to an existing keyword
    pub fn set_comment(&mut self, key: &str, comment: &str) {
        self.comments.insert(key.to_uppercase(), comment.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&FitsValue> {
        self.keywords.get(&key.to_uppercase())
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_string())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Keywords in header order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keyword_order.iter().map(String::as_str)
    }
}

/// FITS reading and writing errors
#[derive(Debug, thiserror::Error)]
pub enum FitsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid FITS format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported BITPIX: {0}")]
    UnsupportedBitpix(i64),

    #[error("Missing required keyword: {0}")]
    MissingKeyword(String),
}

/// Read a FITS file from disk
pub fn read_fits(path: &Path) -> Result<(SampleArray, FitsHeader), FitsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    read_fits_from_reader(&mut reader)
}

/// Read FITS from memory buffer
pub fn read_fits_from_bytes(bytes: &[u8]) -> Result<(SampleArray, FitsHeader), FitsError> {
    let mut reader = std::io::Cursor::new(bytes);
    read_fits_from_reader(&mut reader)
}

fn read_fits_from_reader<R: Read>(reader: &mut R) -> Result<(SampleArray, FitsHeader), FitsError> {
    let header = read_header(reader)?;

    let bitpix = header
        .get_int("BITPIX")
        .ok_or_else(|| FitsError::MissingKeyword("BITPIX".to_string()))?;
    let naxis = header
        .get_int("NAXIS")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS".to_string()))?;
    if naxis != 2 {
        return Err(FitsError::InvalidFormat(format!("expected 2 axes, found {}", naxis)));
    }
    let width = header
        .get_int("NAXIS1")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS1".to_string()))? as u32;
    let height = header
        .get_int("NAXIS2")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS2".to_string()))? as u32;
    let count = width as usize * height as usize;
    let bit_depth = header.get_int("BITDEPTH").map(|b| b as u32);

    let invalid = |e: crate::ImagingError| FitsError::InvalidFormat(e.to_string());
    let image = match bitpix {
        8 => {
            let mut data = vec![0u8; count];
            reader.read_exact(&mut data)?;
            SampleArray::from_u8(width, height, data).map_err(invalid)?
        }
        16 => {
            let bzero = header.get_float("BZERO").unwrap_or(0.0);
            let mut buffer = vec![0u8; count * 2];
            reader.read_exact(&mut buffer)?;
            let data: Vec<u16> = buffer
                .chunks_exact(2)
                .map(|chunk| {
                    let stored = i16::from_be_bytes([chunk[0], chunk[1]]) as f64;
                    (stored + bzero).clamp(0.0, 65535.0) as u16
                })
                .collect();
            SampleArray::from_u16(width, height, bit_depth.unwrap_or(16), data).map_err(invalid)?
        }
        other => return Err(FitsError::UnsupportedBitpix(other)),
    };

    Ok((image, header))
}

/// Read the FITS header (80-character records until END)
pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<FitsHeader, FitsError> {
    let mut header = FitsHeader::new();
    let mut buffer = [0u8; RECORD];
    let mut records = 0usize;

    loop {
        reader.read_exact(&mut buffer)?;
        records += 1;

        let record = String::from_utf8_lossy(&buffer);
        let keyword = record.get(..8).unwrap_or("").trim();

        if keyword == "END" {
            break;
        }
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            continue;
        }

        if record.get(8..10) == Some("= ") {
            let (value, comment) = parse_fits_value(record.get(10..).unwrap_or(""));
            header.insert(keyword, value);
            if let Some(comment) = comment {
                header.set_comment(keyword, &comment);
            }
        }
    }

    // Skip to the next 2880-byte boundary
    let padding = (BLOCK - (records * RECORD) % BLOCK) % BLOCK;
    if padding > 0 {
        let mut skip = vec![0u8; padding];
        reader.read_exact(&mut skip)?;
    }

    Ok(header)
}

/// Parse a value field, returning the value and any trailing comment
fn parse_fits_value(field: &str) -> (FitsValue, Option<String>) {
    let s = field.trim();

    // Strings are quoted, with '' as an escaped quote
    if let Some(rest) = s.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = rest.char_indices().peekable();
        let mut end = rest.len();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    value.push('\'');
                    chars.next();
                    continue;
                }
                end = i + 1;
                break;
            }
            value.push(c);
        }
        let comment = rest[end..]
            .trim()
            .strip_prefix('/')
            .map(|c| c.trim().to_string());
        return (FitsValue::String(value.trim_end().to_string()), comment);
    }

    let (value_part, comment) = match s.find('/') {
        Some(idx) => (s[..idx].trim(), Some(s[idx + 1..].trim().to_string())),
        None => (s, None),
    };

    let value = if value_part == "T" {
        FitsValue::Boolean(true)
    } else if value_part == "F" {
        FitsValue::Boolean(false)
    } else if let Ok(i) = value_part.parse::<i64>() {
        FitsValue::Integer(i)
    } else if let Ok(f) = value_part.replace('D', "E").replace('d', "e").parse::<f64>() {
        FitsValue::Float(f)
    } else {
        FitsValue::String(value_part.to_string())
    };
    (value, comment)
}

/// Write a FITS file, replacing any existing file at `path`
pub fn write_fits(path: &Path, image: &SampleArray, header: &FitsHeader) -> Result<(), FitsError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_fits_to(&mut writer, image, header)?;
    writer.flush()?;
    Ok(())
}

/// Encode a FITS image into any writer
pub fn write_fits_to<W: Write>(writer: &mut W, image: &SampleArray, header: &FitsHeader) -> Result<(), FitsError> {
    let bitpix = match image.samples() {
        Samples::U8(_) => 8,
        Samples::U16(_) => 16,
    };
    let mut records = 0usize;

    // Mandatory keywords
    write_keyword(writer, "SIMPLE", "T", None)?;
    write_keyword(writer, "BITPIX", &bitpix.to_string(), None)?;
    write_keyword(writer, "NAXIS", "2", None)?;
    write_keyword(writer, "NAXIS1", &image.width().to_string(), None)?;
    write_keyword(writer, "NAXIS2", &image.height().to_string(), None)?;
    records += 5;

    if bitpix == 16 {
        write_keyword(writer, "BZERO", "32768", Some("offset data range to that of unsigned short"))?;
        write_keyword(writer, "BSCALE", "1", Some("default scaling factor"))?;
        records += 2;
    }

    for key in &header.keyword_order {
        if STRUCTURAL.contains(&key.as_str()) {
            continue;
        }
        if let Some(value) = header.keywords.get(key) {
            let comment = header.comments.get(key).map(String::as_str);
            write_keyword(writer, key, &value.render(), comment)?;
            records += 1;
        }
    }

    write_keyword(writer, "END", "", None)?;
    records += 1;

    // Pad header to 2880-byte boundary with spaces
    let padding = (BLOCK - (records * RECORD) % BLOCK) % BLOCK;
    writer.write_all(&vec![b' '; padding])?;

    let data_size = match image.samples() {
        Samples::U8(data) => {
            writer.write_all(data)?;
            data.len()
        }
        Samples::U16(data) => {
            let mut bytes = Vec::with_capacity(data.len() * 2);
            for &val in data {
                let signed = (val as i32 - 32768) as i16;
                bytes.extend_from_slice(&signed.to_be_bytes());
            }
            writer.write_all(&bytes)?;
            bytes.len()
        }
    };

    // Pad data to 2880-byte boundary with zeros
    let padding = (BLOCK - data_size % BLOCK) % BLOCK;
    writer.write_all(&vec![0u8; padding])?;
    Ok(())
}

/// Write a single keyword record
fn write_keyword<W: Write>(writer: &mut W, keyword: &str, value: &str, comment: Option<&str>) -> Result<(), FitsError> {
    let mut record = [b' '; RECORD];

    // Keyword, 8 chars, left-justified
    let keyword_bytes = keyword.as_bytes();
    let keyword_len = keyword_bytes.len().min(8);
    record[..keyword_len].copy_from_slice(&keyword_bytes[..keyword_len]);

    if keyword != "END" && !value.is_empty() {
        record[8] = b'=';
        record[9] = b' ';

        // Strings start at column 11, other values end at column 30
        let value_bytes = value.as_bytes();
        let start = if value.starts_with('\'') {
            10
        } else {
            30_usize.saturating_sub(value_bytes.len()).max(10)
        };
        let value_len = value_bytes.len().min(RECORD - start);
        record[start..start + value_len].copy_from_slice(&value_bytes[..value_len]);

        if let Some(comment) = comment {
            let at = (start + value_len + 1).max(31);
            if at + 2 < RECORD {
                record[at] = b'/';
                let text = comment.as_bytes();
                let text_len = text.len().min(RECORD - at - 2);
                record[at + 2..at + 2 + text_len].copy_from_slice(&text[..text_len]);
            }
        }
    }

    writer.write_all(&record)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_header_set_get() {
        let mut header = FitsHeader::new();
        header.set_string("camera", "GPCMOS");
        header.set_float("EXPTIME", 120.5);
        header.set_int("GAIN", 100);
        header.set_fixed("DATAMEAN", 12.34567, 3);

        assert_eq!(header.get_string("CAMERA"), Some("GPCMOS"));
        assert_eq!(header.get_float("EXPTIME"), Some(120.5));
        assert_eq!(header.get_int("GAIN"), Some(100));
        assert_eq!(header.get_float("datamean"), Some(12.34567));
        assert_eq!(header.keys().collect::<Vec<_>>(), vec!["CAMERA", "EXPTIME", "GAIN", "DATAMEAN"]);
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(FitsValue::Fixed(2.0 / 3.0, 3).render(), "0.667");
        assert_eq!(FitsValue::String("N/A".into()).render(), "'N/A     '");
        assert_eq!(FitsValue::String("it's".into()).render(), "'it''s   '");
        assert_eq!(FitsValue::Boolean(false).render(), "F");
    }

    #[test]
    fn test_keyword_record_layout() {
        let mut out = Vec::new();
        write_keyword(&mut out, "GAIN", "100", Some("gain in percent")).unwrap();
        let record = String::from_utf8(out).unwrap();
        assert_eq!(record.len(), 80);
        assert_eq!(&record[..10], "GAIN    = ");
        assert_eq!(&record[27..30], "100");
        assert_eq!(&record[31..48], "/ gain in percent");
    }

    #[test]
    fn test_parse_values_with_comments() {
        assert_eq!(
            parse_fits_value("'N/A     '           / sensor temperature"),
            (FitsValue::String("N/A".into()), Some("sensor temperature".into()))
        );
        assert_eq!(parse_fits_value("                 100"), (FitsValue::Integer(100), None));
        assert_eq!(parse_fits_value("  12.500 / mean").0, FitsValue::Float(12.5));
        assert_eq!(parse_fits_value("'it''s'").0, FitsValue::String("it's".into()));
    }

    #[test]
    fn test_u16_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let data: Vec<u16> = (0..100).map(|v| v * 40).collect();
        let image = SampleArray::from_u16(10, 10, 12, data).unwrap();

        let mut header = FitsHeader::new();
        header.set_string("CAMERA", "Test");
        header.set_comment("CAMERA", "camera display name");
        header.set_float("EXPTIME", 0.5);
        header.set_int("BITDEPTH", 12);
        write_fits(&path, &image, &header).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() % 2880, 0);

        let (read_back, read_header) = read_fits(&path).unwrap();
        assert_eq!(read_back, image);
        assert_eq!(read_header.get_int("BZERO"), Some(32768));
        assert_eq!(read_header.get_string("CAMERA"), Some("Test"));
        assert_eq!(read_header.get_float("EXPTIME"), Some(0.5));
    }

    #[test]
    fn test_u8_data_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();

        let image = SampleArray::from_u8(3, 2, vec![0, 1, 2, 253, 254, 255]).unwrap();
        write_fits(&path, &image, &FitsHeader::new()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 2 * 2880);
        let (read_back, header) = read_fits_from_bytes(&bytes).unwrap();
        assert_eq!(read_back, image);
        assert_eq!(header.get_int("BITPIX"), Some(8));
        assert!(header.get("BZERO").is_none());
    }

    #[test]
    fn test_unsupported_bitpix() {
        let mut bytes = Vec::new();
        write_keyword(&mut bytes, "SIMPLE", "T", None).unwrap();
        write_keyword(&mut bytes, "BITPIX", "-32", None).unwrap();
        write_keyword(&mut bytes, "NAXIS", "2", None).unwrap();
        write_keyword(&mut bytes, "NAXIS1", "1", None).unwrap();
        write_keyword(&mut bytes, "NAXIS2", "1", None).unwrap();
        write_keyword(&mut bytes, "END", "", None).unwrap();
        bytes.resize(2880 + 4, b' ');
        assert!(matches!(read_fits_from_bytes(&bytes), Err(FitsError::UnsupportedBitpix(-32))));
    }
}
