//! Small helpers shared across the fastore tools: logging setup, transparent
//! gzip input, and bit-width arithmetic.

use chrono::Local;
use flate2::read::MultiGzDecoder;
use log::LevelFilter;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::*;

/// Initialize the process-wide logger. Every binary calls this exactly once.
pub fn init_logging(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(buf,
                     "{} [{}] {}",
                     Local::now().format("%Y-%m-%d %H:%M:%S"),
                     record.level(),
                     record.args())
        })
        .filter_level(level)
        .try_init();
}

/// Open a file for reading, transparently decoding gzip based on the magic bytes.
pub fn open_maybe_gz(path: &str) -> FastoreResult<Box<dyn Read + Send>> {
    let mut file = File::open(Path::new(path))
        .map_err(|_| FastoreError::MissingFile(path.to_string()))?;
    let mut magic = [0u8; 2];
    let read_len = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read_len == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Number of bits needed to represent `value` (at least 1).
pub fn bit_length(value: u64) -> u32 {
    if value == 0 {
        1
    } else {
        64 - value.leading_zeros()
    }
}

/// Number of base-256 digits of `value` minus one (bytes above the lowest).
pub fn byte_log(value: u64) -> u32 {
    let mut v = value;
    let mut log = 0;
    while v >= 256 {
        v >>= 8;
        log += 1;
    }
    log
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn bit_lengths() {
        assert_eq!(1, bit_length(0));
        assert_eq!(1, bit_length(1));
        assert_eq!(2, bit_length(2));
        assert_eq!(2, bit_length(3));
        assert_eq!(8, bit_length(255));
        assert_eq!(9, bit_length(256));
    }

    #[test]
    fn byte_logs() {
        assert_eq!(0, byte_log(0));
        assert_eq!(0, byte_log(255));
        assert_eq!(1, byte_log(256));
        assert_eq!(3, byte_log(1 << 30));
    }

    #[test]
    fn open_maybe_gz_reads_plain_and_gz() {
        let content = b"@r1\nACGT\n+\n!!!!\n";

        let mut plain = NamedTempFile::new().unwrap();
        plain.write_all(content).unwrap();
        let plain_path = plain.path().to_str().unwrap();

        let mut plain_reader = open_maybe_gz(plain_path).unwrap();
        let mut plain_buf = Vec::new();
        plain_reader.read_to_end(&mut plain_buf).unwrap();
        assert_eq!(content.as_ref(), plain_buf.as_slice());

        let mut gz = NamedTempFile::new().unwrap();
        {
            let mut encoder = GzEncoder::new(gz.as_file_mut(), Compression::default());
            encoder.write_all(content).unwrap();
            encoder.finish().unwrap();
        }
        let gz_path = gz.path().to_str().unwrap();

        let mut gz_reader = open_maybe_gz(gz_path).unwrap();
        let mut gz_buf = Vec::new();
        gz_reader.read_to_end(&mut gz_buf).unwrap();
        assert_eq!(content.as_ref(), gz_buf.as_slice());
    }
}
