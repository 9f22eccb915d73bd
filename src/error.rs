//! Result and Error types for all fastore code.
use std::fmt;
use std::io;
use std::str;

#[allow(missing_docs)]
pub type FastoreResult<T> = Result<T, FastoreError>;

#[allow(missing_docs)]
#[derive(Debug)]
pub enum FastoreError {
    Io(io::Error),
    InvalidArgument(String),
    CorruptedFile(String),
    MissingFile(String),
    Serialize(bincode::Error),
    Utf8(str::Utf8Error),
    FastqParse(String),
    Other(String),
}

impl fmt::Display for FastoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            FastoreError::Io(ref e) => write!(f, "I/O problem: {}", e),
            FastoreError::InvalidArgument(ref s) => write!(f, "Invalid argument: {}", s),
            FastoreError::CorruptedFile(ref s) => write!(f, "Corrupted file: {}", s),
            FastoreError::MissingFile(ref p) => write!(f, "Unable to find file {}", p),
            FastoreError::Serialize(ref e) => {
                write!(f, "Unable to serialize/deserialize item: {}", e)
            },
            FastoreError::Utf8(ref e) => write!(f, "Found invalid UTF8 input ({})", e),
            FastoreError::FastqParse(ref s) => write!(f, "Error reading FASTQ input: {}", s),
            FastoreError::Other(ref s) => write!(f, "Error: {}", s),
        }
    }
}

impl std::error::Error for FastoreError {}

impl From<io::Error> for FastoreError {
    fn from(e: io::Error) -> Self {
        FastoreError::Io(e)
    }
}

impl From<bincode::Error> for FastoreError {
    fn from(e: bincode::Error) -> Self {
        FastoreError::Serialize(e)
    }
}

impl From<str::Utf8Error> for FastoreError {
    fn from(e: str::Utf8Error) -> Self {
        FastoreError::Utf8(e)
    }
}

impl From<anyhow::Error> for FastoreError {
    fn from(e: anyhow::Error) -> Self {
        FastoreError::Other(e.to_string())
    }
}

impl From<bio::io::fastq::Error> for FastoreError {
    fn from(e: bio::io::fastq::Error) -> Self {
        FastoreError::FastqParse(e.to_string())
    }
}
