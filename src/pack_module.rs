//! Orchestration of the packing tool: bin files to the final archive and
//! the archive back to FASTQ.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::archive::{ArchiveConfig, ArchiveFileReader, ArchiveFileWriter};
use crate::bin_block::BinaryBinBlock;
use crate::bin_file::BinFileReader;
use crate::bin_module::{render_records, FastqTextPart};
use crate::compressor::{CompressedBlock, Decompressor, LzCompressor, RawCompressor};
use crate::error::*;
use crate::packer::{GroupedRecord, RecordPacker};
use crate::params::{CompressorParams, QualityMethod};
use crate::pipeline::{self, Worker};
use crate::quality::QualityCompressionData;
use crate::rebin::build_graph;

struct PackWorker {
    packer: RecordPacker,
    lz: LzCompressor,
    raw: RawCompressor,
    params: CompressorParams,
}

impl Worker<BinaryBinBlock, CompressedBlock> for PackWorker {
    fn process(&mut self,
               part_id: u64,
               block: BinaryBinBlock)
               -> FastoreResult<CompressedBlock> {
        let entries = self.packer.unpack_block(&block)?;
        debug_assert!(!entries.is_empty());

        let n_bin = self.params.minimizer.n_bin_id();
        let (min_len, max_len) = entries.iter().fold((usize::MAX, 0), |acc, e| {
            (acc.0.min(e.rec.seq_len()), acc.1.max(e.rec.seq_len()))
        });

        let irregular_pairs = self.params.archive_type.paired_end
            && entries
                .iter()
                .any(|e| e.rec.aux_len as usize != e.rec.seq_len());
        let use_raw = block.signature == n_bin
            || (entries.len() as u64) < self.params.min_bin_size
            || min_len != max_len
            || irregular_pairs;

        if use_raw {
            // too small (or irregular) for LZ treatment: the raw store takes
            // the canonical form of every record
            let records: Vec<_> = entries
                .into_iter()
                .map(|e| {
                    let mut rec = e.rec;
                    rec.canonicalize();
                    rec
                })
                .collect();
            self.raw
                .compress_bin(&records, block.signature, block.raw_dna_size, part_id)
        } else {
            let (mut records, graph) = build_graph(entries);
            self.lz
                .compress_bin(&mut records, graph, block.signature,
                              block.raw_dna_size, part_id)
        }
    }
}

/// Compress a bin file into the final archive.
pub fn pack_bins(input_prefix: &str,
                 output_prefix: &str,
                 cli_params: &CompressorParams,
                 threads: usize)
                 -> FastoreResult<()> {
    let mut reader = BinFileReader::open(input_prefix)?;
    let bin_config = reader.config().clone();

    // the archive inherits the binning configuration; the CLI contributes
    // the matching and contig parameters
    let params = CompressorParams {
        archive_type: bin_config.archive_type,
        minimizer: bin_config.minimizer,
        quality: bin_config.quality,
        ..cli_params.clone()
    };

    let qua_data = reader.footer().qua_data.clone().unwrap_or_default();
    let head_stats = reader.footer().head_stats.clone();

    let archive_config = ArchiveConfig {
        archive_type: params.archive_type,
        minimizer: params.minimizer,
        quality: params.quality,
        contig: params.contig,
        classifier: params.classifier,
    };

    let mut writer = ArchiveFileWriter::start(
        output_prefix,
        archive_config,
        if params.quality.method == QualityMethod::Qvz {
            Some(qua_data.clone())
        } else {
            None
        },
        head_stats.clone(),
    )?;

    info!("packing {} bins from {}", reader.header().block_count, input_prefix);

    let mut block_sizes: Vec<(u32, usize)> = Vec::new();
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
        || PackWorker {
            packer: RecordPacker::new(bin_config.clone()),
            lz: LzCompressor::new(params.clone(), qua_data.clone(), head_stats.as_ref()),
            raw: RawCompressor::new(params.clone(), qua_data.clone(),
                                    head_stats.as_ref()),
            params: params.clone(),
        },
        |block| {
            block_sizes.push((block.signature, block.data.len()));
            writer.write_block(&block)
        },
    )?;

    if log_enabled!(log::Level::Debug) {
        debug!("compressed block sizes: {}",
               serde_json::to_string(&block_sizes).unwrap_or_default());
    }

    writer.finish()?;
    Ok(())
}

/// Dry run: compress every bin and immediately emit what a decode would
/// reproduce, without writing an archive. Useful to inspect the lossy
/// quality reconstruction; the `/1` and `/2` outputs stay in lock-step
/// because the single writer emits both.
pub fn pack_dry_run(input_prefix: &str,
                    outputs: &[String],
                    cli_params: &CompressorParams,
                    threads: usize)
                    -> FastoreResult<()> {
    let mut reader = BinFileReader::open(input_prefix)?;
    let bin_config = reader.config().clone();

    let params = CompressorParams {
        archive_type: bin_config.archive_type,
        minimizer: bin_config.minimizer,
        quality: bin_config.quality,
        ..cli_params.clone()
    };

    if params.archive_type.paired_end && outputs.len() < 2 {
        return Err(FastoreError::InvalidArgument(
            "paired-end dry run needs two output files".to_string(),
        ));
    }

    let qua_data = reader.footer().qua_data.clone().unwrap_or_default();
    let head_stats = reader.footer().head_stats.clone();

    let mut out_1 = BufWriter::new(File::create(&outputs[0])?);
    let mut out_2 = if params.archive_type.paired_end {
        Some(BufWriter::new(File::create(&outputs[1])?))
    } else {
        None
    };

    info!("dry run over {} bins from {}",
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
        || DryRunWorker {
            pack: PackWorker {
                packer: RecordPacker::new(bin_config.clone()),
                lz: LzCompressor::new(params.clone(), qua_data.clone(),
                                      head_stats.as_ref()),
                raw: RawCompressor::new(params.clone(), qua_data.clone(),
                                        head_stats.as_ref()),
                params: params.clone(),
            },
            decompressor: Decompressor::new(params.clone(), qua_data.clone(),
                                            head_stats.as_ref()),
            params: params.clone(),
        },
        |part: FastqTextPart| {
            out_1.write_all(&part.text_1)?;
            if let Some(out_2) = out_2.as_mut() {
                out_2.write_all(&part.text_2)?;
            }
            Ok(())
        },
    )
}

struct DryRunWorker {
    pack: PackWorker,
    decompressor: Decompressor,
    params: CompressorParams,
}

impl Worker<BinaryBinBlock, FastqTextPart> for DryRunWorker {
    fn process(&mut self,
               part_id: u64,
               block: BinaryBinBlock)
               -> FastoreResult<FastqTextPart> {
        let compressed = self.pack.process(part_id, block)?;
        let (signature, records) =
            self.decompressor.decompress_block(&compressed.data)?;
        let sig_str = self.params.minimizer.signature_string(signature);
        let entries: Vec<GroupedRecord> =
            records.into_iter().map(GroupedRecord::plain).collect();
        render_records(entries,
                       &sig_str,
                       self.params.archive_type.has_headers,
                       self.params.archive_type.paired_end)
    }
}

struct UnpackWorker {
    decompressor: Decompressor,
    params: CompressorParams,
}

impl Worker<CompressedBlock, FastqTextPart> for UnpackWorker {
    fn process(&mut self,
               _part_id: u64,
               block: CompressedBlock)
               -> FastoreResult<FastqTextPart> {
        let (signature, records) = self.decompressor.decompress_block(&block.data)?;
        let sig_str = self.params.minimizer.signature_string(signature);
        let entries: Vec<GroupedRecord> =
            records.into_iter().map(GroupedRecord::plain).collect();
        render_records(entries,
                       &sig_str,
                       self.params.archive_type.has_headers,
                       self.params.archive_type.paired_end)
    }
}

/// Decompress an archive back to FASTQ.
pub fn unpack_archive(input_prefix: &str,
                      outputs: &[String],
                      threads: usize)
                      -> FastoreResult<()> {
    let mut reader = ArchiveFileReader::open(input_prefix)?;
    let config = reader.config().clone();

    let params = CompressorParams {
        archive_type: config.archive_type,
        minimizer: config.minimizer,
        quality: config.quality,
        contig: config.contig,
        classifier: config.classifier,
        ..CompressorParams::default()
    };

    if params.archive_type.paired_end && outputs.len() < 2 {
        return Err(FastoreError::InvalidArgument(
            "paired-end decoding needs two output files".to_string(),
        ));
    }

    let qua_data = reader.footer().qua_data.clone().unwrap_or_default();
    let head_stats = reader.footer().head_stats.clone();

    let mut out_1 = BufWriter::new(File::create(&outputs[0])?);
    let mut out_2 = if params.archive_type.paired_end {
        Some(BufWriter::new(File::create(&outputs[1])?))
    } else {
        None
    };

    info!("unpacking {} blocks from {}", reader.block_count(), input_prefix);

    pipeline::run(
        threads,
        move || {
            let mut block = CompressedBlock::default();
            if reader.read_next_block(&mut block)? {
                Ok(Some(block))
            } else {
                Ok(None)
            }
        },
        || UnpackWorker {
            decompressor: Decompressor::new(params.clone(), qua_data.clone(),
                                            head_stats.as_ref()),
            params: params.clone(),
        },
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
    use crate::bin_module::fastq_to_bin;
    use crate::params::BinModuleConfig;
    use crate::rebin_module::rebin_bins;
    use crate::params::RebinParams;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn write_fastq(count: usize, with_n: bool) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        let mut genome = Vec::new();
        while genome.len() < 64 + count {
            genome.extend_from_slice(b"CGTTAGCATGCAGGTCAAGCTTGATTACAGGA");
        }
        for i in 0..count {
            let seq = String::from_utf8(genome[i..i + 32].to_vec()).unwrap();
            let qua: String = (0..32)
                .map(|j| (b'!' + ((i + j) % 40) as u8) as char)
                .collect();
            writeln!(f, "@r{}\n{}\n+\n{}", i, seq, qua).unwrap();
        }
        if with_n {
            writeln!(f, "@rn\n{}\n+\n{}", "N".repeat(32), "#".repeat(32)).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn parse_fastq(path: &str) -> Vec<(String, String)> {
        let content = String::from_utf8(std::fs::read(path).unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        lines
            .chunks(4)
            .map(|c| (c[1].to_string(), c[3].to_string()))
            .collect()
    }

    fn end_to_end(count: usize, rebin: bool) {
        let input = write_fastq(count, true);
        let dir = tempdir().unwrap();
        let bins = dir.path().join("bins");
        let bins = bins.to_str().unwrap().to_string();
        let archive = dir.path().join("arch");
        let archive = archive.to_str().unwrap().to_string();

        let mut config = BinModuleConfig::default();
        config.categorizer.min_bin_size = 1;
        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     &bins,
                     &config,
                     2)
            .unwrap();

        let pack_input = if rebin {
            let rebinned = dir.path().join("reb");
            let rebinned = rebinned.to_str().unwrap().to_string();
            rebin_bins(&bins, &rebinned, &RebinParams::default(), 2).unwrap();
            rebinned
        } else {
            bins
        };

        let mut params = CompressorParams::default();
        params.min_bin_size = 4;
        pack_bins(&pack_input, &archive, &params, 2).unwrap();

        let out = dir.path().join("out.fastq");
        let out_path = out.to_str().unwrap().to_string();
        unpack_archive(&archive, &[out_path.clone()], 2).unwrap();

        let mut decoded = parse_fastq(&out_path);
        decoded.sort();

        let mut expected = parse_fastq(input.path().to_str().unwrap());
        expected.sort();

        assert_eq!(expected, decoded);
    }

    #[test]
    fn end_to_end_roundtrip() {
        end_to_end(48, false);
    }

    #[test]
    fn end_to_end_roundtrip_with_rebinning() {
        end_to_end(48, true);
    }

    #[test]
    fn corrupt_archive_surfaces_format_error() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("nonexistent");
        let prefix = prefix.to_str().unwrap();
        assert!(unpack_archive(prefix, &["x".to_string()], 1).is_err());
    }

    #[test]
    fn paired_end_end_to_end() {
        let dir = tempdir().unwrap();
        let mut genome = Vec::new();
        while genome.len() < 96 {
            genome.extend_from_slice(b"CGTTAGCATGCAGGTCAAGCTTGATTACAGGA");
        }

        let mut f1 = NamedTempFile::new().unwrap();
        let mut f2 = NamedTempFile::new().unwrap();
        for i in 0..24 {
            let m1 = String::from_utf8(genome[i..i + 32].to_vec()).unwrap();
            let m2 = String::from_utf8(genome[i + 40..i + 72].to_vec()).unwrap();
            writeln!(f1, "@p{}\n{}\n+\n{}", i, m1, "I".repeat(32)).unwrap();
            writeln!(f2, "@p{}\n{}\n+\n{}", i, m2, "J".repeat(32)).unwrap();
        }
        f1.flush().unwrap();
        f2.flush().unwrap();

        let bins = dir.path().join("pebins");
        let bins = bins.to_str().unwrap().to_string();
        let archive = dir.path().join("pearch");
        let archive = archive.to_str().unwrap().to_string();

        let mut config = BinModuleConfig::default();
        config.archive_type.paired_end = true;
        config.categorizer.min_bin_size = 1;
        crate::bin_module::fastq_to_bin(
            vec![f1.path().to_str().unwrap().to_string()],
            vec![f2.path().to_str().unwrap().to_string()],
            &bins,
            &config,
            2,
        )
        .unwrap();

        let mut params = CompressorParams::default();
        params.archive_type.paired_end = true;
        params.min_bin_size = 4;
        pack_bins(&bins, &archive, &params, 2).unwrap();

        let out_1 = dir.path().join("pe_1.fastq");
        let out_2 = dir.path().join("pe_2.fastq");
        let outs = vec![
            out_1.to_str().unwrap().to_string(),
            out_2.to_str().unwrap().to_string(),
        ];
        unpack_archive(&archive, &outs, 2).unwrap();

        // pair order across the two output files stays in lock-step even
        // though record order may differ from the input
        let mut decoded: Vec<((String, String), (String, String))> =
            parse_fastq(&outs[0])
                .into_iter()
                .zip(parse_fastq(&outs[1]))
                .collect();
        decoded.sort();
        let mut expected: Vec<((String, String), (String, String))> =
            parse_fastq(f1.path().to_str().unwrap())
                .into_iter()
                .zip(parse_fastq(f2.path().to_str().unwrap()))
                .collect();
        expected.sort();
        assert_eq!(expected, decoded);
    }

    #[test]
    fn dry_run_matches_input_in_lossless_mode() {
        let input = write_fastq(24, false);
        let dir = tempdir().unwrap();
        let bins = dir.path().join("dry");
        let bins = bins.to_str().unwrap().to_string();

        let mut config = BinModuleConfig::default();
        config.categorizer.min_bin_size = 1;
        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     &bins,
                     &config,
                     1)
            .unwrap();

        let out = dir.path().join("dry.fastq");
        let out_path = out.to_str().unwrap().to_string();
        let params = CompressorParams::default();
        pack_dry_run(&bins, &[out_path.clone()], &params, 1).unwrap();

        let mut decoded = parse_fastq(&out_path);
        decoded.sort();
        let mut expected = parse_fastq(input.path().to_str().unwrap());
        expected.sort();
        assert_eq!(expected, decoded);
    }

    #[test]
    fn two_encodes_are_byte_identical() {
        let input = write_fastq(32, true);
        let dir = tempdir().unwrap();
        let bins = dir.path().join("det");
        let bins = bins.to_str().unwrap().to_string();

        let mut config = BinModuleConfig::default();
        config.categorizer.min_bin_size = 1;
        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     &bins,
                     &config,
                     1)
            .unwrap();

        let params = CompressorParams::default();
        let arch_a = dir.path().join("a");
        let arch_b = dir.path().join("b");
        pack_bins(&bins, arch_a.to_str().unwrap(), &params, 1).unwrap();
        pack_bins(&bins, arch_b.to_str().unwrap(), &params, 1).unwrap();

        let data_a =
            std::fs::read(format!("{}{}", arch_a.to_str().unwrap(), ".cdata")).unwrap();
        let data_b =
            std::fs::read(format!("{}{}", arch_b.to_str().unwrap(), ".cdata")).unwrap();
        assert_eq!(data_a, data_b);
    }
}
