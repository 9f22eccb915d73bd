//! Orchestration of the rebinning tool.
//!
//! Bins whose signature already matches the target parity (and the N-bin)
//! pass through byte-identical; every other bin is unpacked, re-matched and
//! redistributed, its trees travelling as transfer groups.

use crate::bin_block::BinaryBinBlock;
use crate::bin_file::{BinFileReader, BinFileWriter};
use crate::error::*;
use crate::packer::RecordPacker;
use crate::params::{BinModuleConfig, RebinParams};
use crate::pipeline::{self, Worker};
use crate::rebin::{build_graph, Rebinner};

struct RebinWorker {
    packer: RecordPacker,
    rebinner: Rebinner,
    parity: u32,
    n_bin: u32,
}

impl RebinWorker {
    fn new(config: &BinModuleConfig, params: &RebinParams) -> Self {
        let rebinner =
            Rebinner::new(config.minimizer, *params, config.archive_type.paired_end);
        RebinWorker {
            packer: RecordPacker::new(config.clone()),
            rebinner,
            parity: params.signature_parity,
            n_bin: config.minimizer.n_bin_id(),
        }
    }
}

impl Worker<BinaryBinBlock, BinaryBinBlock> for RebinWorker {
    fn process(&mut self,
               part_id: u64,
               block: BinaryBinBlock)
               -> FastoreResult<BinaryBinBlock> {
        let signature = block.signature;

        // parity-matched bins and the N-bin pass through unchanged
        if signature == self.n_bin || signature % self.parity == 0 {
            let mut out = block;
            out.part_id = part_id;
            return Ok(out);
        }

        let entries = self.packer.unpack_block(&block)?;
        let (mut records, graph) = build_graph(entries);
        let bins = self.rebinner.rebin(&mut records, graph, signature);

        let mut out = BinaryBinBlock::default();
        self.packer.pack_grouped_bins(bins, &mut out)?;
        out.part_id = part_id;
        Ok(out)
    }
}

/// Raise the bin grid parity of a bin file.
pub fn rebin_bins(input_prefix: &str,
                  output_prefix: &str,
                  params: &RebinParams,
                  threads: usize)
                  -> FastoreResult<()> {
    let mut reader = BinFileReader::open(input_prefix)?;
    let mut config = reader.config().clone();
    config.binning_level += 1;

    info!("rebinning {} bins to parity {}",
          reader.header().block_count,
          params.signature_parity);

    let mut writer = BinFileWriter::start(output_prefix, &config)?;
    // the global side data travels unchanged across rebinning levels
    let input_footer = reader.footer().clone();

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
        || RebinWorker::new(&config, params),
        |block| writer.write_block(&block),
    )?;

    writer.carry_side_data(input_footer.qua_data, input_footer.head_stats);
    writer.finish()?;
    Ok(())
}

/// Decode a (possibly rebinned) bin file back to FASTQ.
pub fn rebin_to_fastq(input_prefix: &str,
                      outputs: &[String],
                      threads: usize)
                      -> FastoreResult<()> {
    crate::bin_module::bin_to_fastq(input_prefix, outputs, threads)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin_module::fastq_to_bin;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn write_fastq(count: usize) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        let mut genome = Vec::new();
        while genome.len() < 64 + count {
            genome.extend_from_slice(b"CGTTAGCATGCAGGTCAAGCTTGATTACAGGA");
        }
        for i in 0..count {
            let seq = String::from_utf8(genome[i..i + 32].to_vec()).unwrap();
            writeln!(f, "@r{}\n{}\n+\n{}", i, seq, "I".repeat(32)).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn rebin_preserves_every_record() {
        let input = write_fastq(40);
        let dir = tempdir().unwrap();
        let bins = dir.path().join("lvl0");
        let bins = bins.to_str().unwrap();
        let rebinned = dir.path().join("lvl1");
        let rebinned = rebinned.to_str().unwrap();

        let mut config = BinModuleConfig::default();
        config.categorizer.min_bin_size = 1;
        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     bins,
                     &config,
                     2)
            .unwrap();

        let before = BinFileReader::open(bins).unwrap().header().records_count;

        rebin_bins(bins, rebinned, &RebinParams::default(), 2).unwrap();

        let reader = BinFileReader::open(rebinned).unwrap();
        assert_eq!(before, reader.header().records_count);
        assert_eq!(1, reader.config().binning_level);

        // decoding the rebinned file still yields every read
        let out = dir.path().join("back.fastq");
        let out_path = out.to_str().unwrap().to_string();
        rebin_to_fastq(rebinned, &[out_path.clone()], 2).unwrap();
        let text = std::fs::read(&out_path).unwrap();
        let lines = text.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(40 * 4, lines);
    }

    #[test]
    fn rebinned_bins_match_target_parity_or_fallback() {
        let input = write_fastq(30);
        let dir = tempdir().unwrap();
        let bins = dir.path().join("p0");
        let bins = bins.to_str().unwrap();
        let rebinned = dir.path().join("p1");
        let rebinned = rebinned.to_str().unwrap();

        let mut config = BinModuleConfig::default();
        config.categorizer.min_bin_size = 1;
        fastq_to_bin(vec![input.path().to_str().unwrap().to_string()],
                     Vec::new(),
                     bins,
                     &config,
                     1)
            .unwrap();

        let input_sigs: Vec<u32> = BinFileReader::open(bins)
            .unwrap()
            .footer()
            .bin_offsets
            .keys()
            .cloned()
            .collect();

        rebin_bins(bins, rebinned, &RebinParams::default(), 1).unwrap();

        let reader = BinFileReader::open(rebinned).unwrap();
        let n_bin = reader.config().minimizer.n_bin_id();
        for &sig in reader.footer().bin_offsets.keys() {
            // target parity, a surviving input signature, or the N-bin
            assert!(sig % 2 == 0 || input_sigs.contains(&sig) || sig == n_bin);
        }
    }
}
