use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

pub fn compress_string(input: &str) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input.as_bytes())?;
    encoder.finish()
}

/// Inflate `input` and decode it as UTF-8
pub fn decompress_bytes_to_string(input: &[u8]) -> io::Result<String> {
    let mut decoder = GzDecoder::new(input);
    let mut output = String::new();
    decoder.read_to_string(&mut output)?;
    Ok(output)
}
