//! I/O helpers for reading uploaded CSV files: encoding resolution and
//! delimiter defaults. Fetched sources arrive as UTF-8 strings; only
//! file uploads need transcoding.

use std::{fs::File, io::Read, path::Path};

use anyhow::{Context, Result, anyhow};
use encoding_rs::{Encoding, UTF_8};
use encoding_rs_io::DecodeReaderBytesBuilder;

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

/// Read a whole file into a UTF-8 string, transcoding from `encoding`
/// (BOM-sniffing stays enabled, so a UTF-16 export with a BOM decodes
/// correctly even under the UTF-8 default).
pub fn read_file_to_string(path: &Path, encoding: &'static Encoding) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
    let mut reader = DecodeReaderBytesBuilder::new()
        .encoding(Some(encoding))
        .build(file);
    let mut contents = String::new();
    reader
        .read_to_string(&mut contents)
        .with_context(|| format!("Decoding {path:?}"))?;
    Ok(contents)
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}
