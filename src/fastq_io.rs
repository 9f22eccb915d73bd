//! FASTQ text input and output.
//!
//! Input goes through `bio`'s FASTQ parser over plain or gzip-compressed
//! files; multiple input files are concatenated. Paired-end mode reads two
//! file sets in lock-step and stores both mates in one record. Output
//! mirrors the input format, synthesizing `@<signature>.<index>` identifiers
//! when the archive carries no headers.

use std::io::Write;

use bio::io::fastq;

use crate::error::*;
use crate::params::{BinModuleConfig, MAX_HEAD_LEN, MAX_SEQ_LEN};
use crate::records::FastqRecord;
use crate::util::open_maybe_gz;

type FastqRecords = fastq::Records<std::io::BufReader<Box<dyn std::io::Read + Send>>>;

fn open_records(path: &str) -> FastoreResult<FastqRecords> {
    Ok(fastq::Reader::new(open_maybe_gz(path)?).records())
}

fn build_head(record: &fastq::Record, preserve_comments: bool) -> Vec<u8> {
    let mut head = Vec::with_capacity(record.id().len() + 1);
    head.push(b'@');
    head.extend_from_slice(record.id().as_bytes());
    if preserve_comments {
        if let Some(desc) = record.desc() {
            head.push(b' ');
            head.extend_from_slice(desc.as_bytes());
        }
    }
    head.truncate(MAX_HEAD_LEN);
    head
}

fn normalize_base(b: u8) -> u8 {
    match b {
        b'A' | b'a' => b'A',
        b'C' | b'c' => b'C',
        b'G' | b'g' => b'G',
        b'T' | b't' => b'T',
        _ => b'N',
    }
}

/// Streams single-end FASTQ records from a list of files in batches.
pub struct FastqChunkReader {
    paths: Vec<String>,
    current: Option<FastqRecords>,
    config: BinModuleConfig,
    min_read_len: usize,
}

impl FastqChunkReader {
    pub fn new(paths: Vec<String>, config: BinModuleConfig) -> FastoreResult<Self> {
        debug_assert!(!paths.is_empty());
        let min_read_len =
            (config.minimizer.signature_len + config.minimizer.skip_zone_len) as usize;
        Ok(FastqChunkReader {
            paths,
            current: None,
            config,
            min_read_len,
        })
    }

    fn convert(&self, record: &fastq::Record) -> FastoreResult<FastqRecord> {
        let seq_len = record.seq().len();
        if seq_len < self.min_read_len || seq_len > MAX_SEQ_LEN {
            return Err(FastoreError::InvalidArgument(format!(
                "read length {} outside the supported range [{}, {}]",
                seq_len, self.min_read_len, MAX_SEQ_LEN
            )));
        }
        if record.qual().len() != seq_len {
            return Err(FastoreError::FastqParse(
                "quality length differs from sequence length".to_string(),
            ));
        }
        let seq: Vec<u8> = record.seq().iter().map(|&b| normalize_base(b)).collect();
        let head = if self.config.archive_type.has_headers {
            build_head(record, self.config.headers.preserve_comments)
        } else {
            Vec::new()
        };
        Ok(FastqRecord::new(seq, record.qual().to_vec(), head))
    }

    fn next_record(&mut self) -> FastoreResult<Option<fastq::Record>> {
        loop {
            if self.current.is_none() {
                if self.paths.is_empty() {
                    return Ok(None);
                }
                let path = self.paths.remove(0);
                debug!("reading FASTQ input {}", path);
                self.current = Some(open_records(&path)?);
            }
            match self.current.as_mut().unwrap().next() {
                Some(result) => return Ok(Some(result?)),
                None => self.current = None,
            }
        }
    }

    /// Read the next batch, bounded by the configured block size in raw
    /// FASTQ bytes. Returns `None` at end of input.
    pub fn read_chunk(&mut self) -> FastoreResult<Option<Vec<FastqRecord>>> {
        let budget = self.config.fastq_block_size as usize;
        let mut used = 0usize;
        let mut out = Vec::new();

        while used < budget {
            match self.next_record()? {
                Some(record) => {
                    let rec = self.convert(&record)?;
                    used += rec.full_len() * 2 + rec.head.len() + 6;
                    out.push(rec);
                },
                None => break,
            }
        }

        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

/// Streams paired-end records from two file sets read in lock-step.
pub struct FastqChunkReaderPE {
    reader_1: FastqChunkReader,
    paths_2: Vec<String>,
    current_2: Option<FastqRecords>,
}

impl FastqChunkReaderPE {
    pub fn new(paths_1: Vec<String>,
               paths_2: Vec<String>,
               config: BinModuleConfig)
               -> FastoreResult<Self> {
        Ok(FastqChunkReaderPE {
            reader_1: FastqChunkReader::new(paths_1, config)?,
            paths_2,
            current_2: None,
        })
    }

    fn next_record_2(&mut self) -> FastoreResult<Option<fastq::Record>> {
        loop {
            if self.current_2.is_none() {
                if self.paths_2.is_empty() {
                    return Ok(None);
                }
                let path = self.paths_2.remove(0);
                self.current_2 = Some(open_records(&path)?);
            }
            match self.current_2.as_mut().unwrap().next() {
                Some(result) => return Ok(Some(result?)),
                None => self.current_2 = None,
            }
        }
    }

    pub fn read_chunk(&mut self) -> FastoreResult<Option<Vec<FastqRecord>>> {
        let budget = self.reader_1.config.fastq_block_size as usize;
        let mut used = 0usize;
        let mut out = Vec::new();

        while used < budget {
            let r1 = match self.reader_1.next_record()? {
                Some(r) => r,
                None => break,
            };
            let r2 = self.next_record_2()?.ok_or_else(|| {
                FastoreError::FastqParse(
                    "paired-end inputs have different record counts".to_string(),
                )
            })?;

            let mut rec = self.reader_1.convert(&r1)?;
            let mate = self.reader_1.convert(&r2)?;
            if mate.seq_len() != rec.seq_len() {
                return Err(FastoreError::InvalidArgument(
                    "paired-end mates must have equal lengths".to_string(),
                ));
            }
            rec.aux_len = mate.seq_len() as u16;
            rec.seq.extend_from_slice(&mate.seq);
            rec.qua.extend_from_slice(&mate.qua);

            used += rec.full_len() * 2 + rec.head.len() + 12;
            out.push(rec);
        }

        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

/// Append one record (in canonical orientation) as FASTQ text.
pub fn write_fastq_record<W: Write>(writer: &mut W,
                                    head: &[u8],
                                    seq: &[u8],
                                    qua: &[u8])
                                    -> FastoreResult<()> {
    writer.write_all(head)?;
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(qua)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Restore the original orientation of a decoded record and emit it; PE
/// records are split into their two output streams.
pub fn emit_decoded_record<W: Write>(rec: &mut FastqRecord,
                                     synthetic_head: Option<&[u8]>,
                                     out_1: &mut W,
                                     out_2: Option<&mut W>)
                                     -> FastoreResult<()> {
    if rec.is_reverse() {
        rec.apply_rc();
    }
    if rec.is_pair_swapped() {
        rec.swap_mates();
    }

    let head: &[u8] = if rec.head.is_empty() {
        synthetic_head.unwrap_or(b"@0")
    } else {
        &rec.head
    };

    if rec.aux_len > 0 {
        let out_2 = out_2.ok_or_else(|| {
            FastoreError::InvalidArgument(
                "paired-end archive needs two output files".to_string(),
            )
        })?;
        write_fastq_record(out_1, head, rec.seq_1(), rec.qua_1())?;
        write_fastq_record(out_2, head, rec.seq_2(), rec.qua_2())?;
    } else {
        write_fastq_record(out_1, head, rec.seq_1(), rec.qua_1())?;
    }
    Ok(())
}
