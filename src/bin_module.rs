//! Orchestration of the binning tool: FASTQ to bin files and back.

use std::fs::File;
use std::io::{BufWriter, Write};

use itertools::Itertools;

use crate::bin_block::BinaryBinBlock;
use crate::bin_file::{BinFileReader, BinFileWriter};
use crate::categorizer::{Categorizer, SmallBinBuffer};
use crate::error::*;
use crate::fastq_io::{emit_decoded_record, FastqChunkReader, FastqChunkReaderPE};
use crate::packer::{GroupedRecord, RecordPacker};
use crate::params::BinModuleConfig;
use crate::pipeline::{self, Worker};
use crate::records::FastqRecord;

/// One worker of the binning pipeline: categorize, defer small bins, pack.
struct BinEncoder {
    categorizer: Categorizer,
    packer: RecordPacker,
    small_bins: SmallBinBuffer,
}

impl BinEncoder {
    fn new(config: &BinModuleConfig) -> Self {
        let categorizer = Categorizer::new(config.minimizer, config.categorizer);
        let small_bins =
            SmallBinBuffer::new(categorizer.min_bin_size(), categorizer.n_bin_id());
        BinEncoder {
            categorizer,
            packer: RecordPacker::new(config.clone()),
            small_bins,
        }
    }
}

impl Worker<Vec<FastqRecord>, BinaryBinBlock> for BinEncoder {
    fn process(&mut self,
               part_id: u64,
               records: Vec<FastqRecord>)
               -> FastoreResult<BinaryBinBlock> {
        let mut bins = self.categorizer.categorize(records);
        self.small_bins.filter(&mut bins);

        let mut block = BinaryBinBlock::default();
        self.packer.pack_bins(bins, &mut block)?;
        block.part_id = part_id;
        Ok(block)
    }

    fn finish(&mut self) -> FastoreResult<Option<BinaryBinBlock>> {
        // still-deferred bins are demoted to the N-bin
        let leftovers = match self.small_bins.flush() {
            Some(bin) => bin,
            None => return Ok(None),
        };
        let mut bins = std::collections::BTreeMap::new();
        bins.insert(self.categorizer.n_bin_id(), leftovers);
        let mut block = BinaryBinBlock::default();
        self.packer.pack_bins(bins, &mut block)?;
        Ok(Some(block))
    }
}

/// Encode FASTQ input into the four bin files.
pub fn fastq_to_bin(inputs_1: Vec<String>,
                    inputs_2: Vec<String>,
                    output_prefix: &str,
                    config: &BinModuleConfig,
                    threads: usize)
                    -> FastoreResult<()> {
    info!("binning {} into {}",
          inputs_1.iter().chain(inputs_2.iter()).join(" "),
          output_prefix);

    let mut writer = BinFileWriter::start(output_prefix, config)?;

    enum AnyReader {
        Se(FastqChunkReader),
        Pe(FastqChunkReaderPE),
    }
    let mut reader = if config.archive_type.paired_end {
        AnyReader::Pe(FastqChunkReaderPE::new(inputs_1, inputs_2, config.clone())?)
    } else {
        AnyReader::Se(FastqChunkReader::new(inputs_1, config.clone())?)
    };

    pipeline::run(
        threads,
        move || match &mut reader {
            AnyReader::Se(r) => r.read_chunk(),
            AnyReader::Pe(r) => r.read_chunk(),
        },
        || BinEncoder::new(config),
        |block| writer.write_block(&block),
    )?;

    writer.finish()?;
    Ok(())
}

/// Formatted FASTQ text of one decoded bin (both mate files in PE mode).
pub struct FastqTextPart {
    pub text_1: Vec<u8>,
    pub text_2: Vec<u8>,
}

/// Render decoded records into FASTQ text, synthesizing identifiers when
/// the archive stores none.
pub fn render_records(entries: Vec<GroupedRecord>,
                      signature_str: &[u8],
                      has_headers: bool,
                      paired: bool)
                      -> FastoreResult<FastqTextPart> {
    let mut part = FastqTextPart {
        text_1: Vec::new(),
        text_2: Vec::new(),
    };
    for (idx, entry) in entries.into_iter().enumerate() {
        let mut rec = entry.rec;
        let synthetic;
        let head = if has_headers {
            None
        } else {
            let mut h = Vec::with_capacity(signature_str.len() + 12);
            h.push(b'@');
            h.extend_from_slice(signature_str);
            h.push(b'.');
            h.extend_from_slice(idx.to_string().as_bytes());
            synthetic = h;
            Some(synthetic.as_slice())
        };
        if paired {
            emit_decoded_record(&mut rec, head, &mut part.text_1, Some(&mut part.text_2))?;
        } else {
            emit_decoded_record(&mut rec, head, &mut part.text_1, None)?;
        }
    }
    Ok(part)
}

struct BinDecoder {
    packer: RecordPacker,
    signature_strings: std::collections::HashMap<u32, Vec<u8>>,
    has_headers: bool,
    paired: bool,
}

impl BinDecoder {
    fn new(config: &BinModuleConfig) -> Self {
        BinDecoder {
            packer: RecordPacker::new(config.clone()),
            signature_strings: std::collections::HashMap::new(),
            has_headers: config.archive_type.has_headers,
            paired: config.archive_type.paired_end,
        }
    }
}

impl Worker<BinaryBinBlock, FastqTextPart> for BinDecoder {
    fn process(&mut self,
               _part_id: u64,
               block: BinaryBinBlock)
               -> FastoreResult<FastqTextPart> {
        let entries = self.packer.unpack_block(&block)?;
        let sig_str = self
            .signature_strings
            .entry(block.signature)
            .or_insert_with(|| {
                self.packer
                    .config()
                    .minimizer
                    .signature_string(block.signature)
            })
            .clone();
        render_records(entries, &sig_str, self.has_headers, self.paired)
    }
}

/// Decode the bin files back to FASTQ.
pub fn bin_to_fastq(input_prefix: &str,
                    outputs: &[String],
                    threads: usize)
                    -> FastoreResult<()> {
    let mut reader = BinFileReader::open(input_prefix)?;
    let config = reader.config().clone();

    if config.archive_type.paired_end && outputs.len() < 2 {
        return Err(FastoreError::InvalidArgument(
            "paired-end decoding needs two output files".to_string(),
        ));
    }

    let mut out_1 = BufWriter::new(File::create(&outputs[0])?);
    let mut out_2 = if config.archive_type.paired_end {
        Some(BufWriter::new(File::create(&outputs[1])?))
    } else {
        None
    };

    info!("decoding {} bins from {}",
          reader.header().block_count,
          input_prefix);

    pipeline::run(
        threads,
        move || {
            let mut block = BinaryBinBlock::default();
            if reader.read_next_block(&mut block)? {
                Ok(Some(block))
            } else {
                Ok(None)
            }
        },
        || BinDecoder::new(&config),
        |part: FastqTextPart| {
            out_1.write_all(&part.text_1)?;
            if let Some(out_2) = out_2.as_mut() {
                out_2.write_all(&part.text_2)?;
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn write_fastq(records: &[(&str, &str, &str)]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for (id, seq, qua) in records {
            writeln!(f, "@{}\n{}\n+\n{}", id, seq, qua).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn parse_fastq(text: &[u8]) -> Vec<(String, String)> {
        let content = String::from_utf8(text.to_vec()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        lines
            .chunks(4)
            .map(|c| (c[1].to_string(), c[3].to_string()))
            .collect()
    }

    #[test]
    fn fastq_roundtrip_through_bins() {
        let input = write_fastq(&[
            ("r1", "ACGTACGTACGTACGT", "IIIIIIIIIIIIIIII"),
            ("r2", "ACGTACGTACGTACGA", "JJJJJJJJJJJJJJJJ"),
            ("r3", "TTTTGGGGCCCCAAAA", "KKKKKKKKKKKKKKKK"),
            ("r4", "NNNNNNNNNNNNNNNN", "LLLLLLLLLLLLLLLL"),
        ]);
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("bins");
        let prefix = prefix.to_str().unwrap();

        let mut config = BinModuleConfig::default();
        config.categorizer.min_bin_size = 1;

        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     prefix,
                     &config,
                     2)
            .unwrap();

        let out = dir.path().join("out.fastq");
        let out_path = out.to_str().unwrap().to_string();
        bin_to_fastq(prefix, &[out_path.clone()], 2).unwrap();

        let text = std::fs::read(&out_path).unwrap();
        let mut decoded = parse_fastq(&text);
        decoded.sort();
        let mut expected = vec![
            ("ACGTACGTACGTACGT".to_string(), "IIIIIIIIIIIIIIII".to_string()),
            ("ACGTACGTACGTACGA".to_string(), "JJJJJJJJJJJJJJJJ".to_string()),
            ("TTTTGGGGCCCCAAAA".to_string(), "KKKKKKKKKKKKKKKK".to_string()),
            ("NNNNNNNNNNNNNNNN".to_string(), "LLLLLLLLLLLLLLLL".to_string()),
        ];
        expected.sort();
        assert_eq!(expected, decoded);
    }

    #[test]
    fn headers_survive_when_enabled() {
        let input = write_fastq(&[
            ("run.1", "ACGTACGTACGTACGT", "IIIIIIIIIIIIIIII"),
            ("run.2", "ACGTACGTACGTACGA", "JJJJJJJJJJJJJJJJ"),
        ]);
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("hbins");
        let prefix = prefix.to_str().unwrap();

        let mut config = BinModuleConfig::default();
        config.archive_type.has_headers = true;
        config.categorizer.min_bin_size = 1;

        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     prefix,
                     &config,
                     1)
            .unwrap();

        let out = dir.path().join("out.fastq");
        let out_path = out.to_str().unwrap().to_string();
        bin_to_fastq(prefix, &[out_path.clone()], 1).unwrap();

        let text = std::fs::read(&out_path).unwrap();
        let content = String::from_utf8(text).unwrap();
        assert!(content.contains("@run.1"));
        assert!(content.contains("@run.2"));
    }

    #[test]
    fn pe_roundtrip_through_bins() {
        let in_1 = write_fastq(&[("p.1", "ACGTACGTACGTACGT", "IIIIIIIIIIIIIIII")]);
        let in_2 = write_fastq(&[("p.1", "GGGGCCCCTTTTAAAA", "JJJJJJJJJJJJJJJJ")]);
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("pe");
        let prefix = prefix.to_str().unwrap();

        let mut config = BinModuleConfig::default();
        config.archive_type.paired_end = true;
        config.categorizer.min_bin_size = 1;

        fastq_to_bin(vec![in_1.path().to_str().unwrap().to_string()],
                     vec![in_2.path().to_str().unwrap().to_string()],
                     prefix,
                     &config,
                     1)
            .unwrap();

        let out_1 = dir.path().join("out_1.fastq");
        let out_2 = dir.path().join("out_2.fastq");
        let outs = vec![
            out_1.to_str().unwrap().to_string(),
            out_2.to_str().unwrap().to_string(),
        ];
        bin_to_fastq(prefix, &outs, 1).unwrap();

        let text_1 = std::fs::read(&outs[0]).unwrap();
        let text_2 = std::fs::read(&outs[1]).unwrap();
        assert_eq!(vec![("ACGTACGTACGTACGT".to_string(),
                         "IIIIIIIIIIIIIIII".to_string())],
                   parse_fastq(&text_1));
        assert_eq!(vec![("GGGGCCCCTTTTAAAA".to_string(),
                         "JJJJJJJJJJJJJJJJ".to_string())],
                   parse_fastq(&text_2));
    }
}
