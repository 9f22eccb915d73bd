//! The on-disk bin container: `<prefix>.bmeta` (header, per-block meta
//! bytes, footer), `.bdna`, `.bqua` and optionally `.bhead` as raw streams
//! indexed by offsets stored in the footer.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bin_block::{BinDescriptor, BinaryBinBlock, BlockStats, BlockType};
use crate::bitio::{BitReader, BitWriter};
use crate::error::*;
use crate::headers::HeaderStats;
use crate::params::{BinModuleConfig, QualityMethod};
use crate::quality::QualityCompressionData;

pub const BIN_META_EXT: &str = ".bmeta";
pub const BIN_DNA_EXT: &str = ".bdna";
pub const BIN_QUA_EXT: &str = ".bqua";
pub const BIN_HEAD_EXT: &str = ".bhead";

/// Fixed-size header at byte 0 of the meta stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinFileHeader {
    pub footer_offset: u64,
    pub records_count: u64,
    pub block_count: u64,
    pub footer_size: u64,
    pub uses_head_stream: bool,
}

impl BinFileHeader {
    pub const SIZE: usize = 48;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.footer_offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.records_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.block_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.footer_size.to_le_bytes());
        buf[32] = self.uses_head_stream as u8;
        buf
    }

    fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        BinFileHeader {
            footer_offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            records_count: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            block_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            footer_size: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            uses_head_stream: buf[32] != 0,
        }
    }
}

/// Per-sub-bin descriptor extended with the stream file offsets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockMetaData {
    pub desc: BinDescriptor,
    pub meta_file_offset: u64,
    pub dna_file_offset: u64,
    pub qua_file_offset: u64,
    pub head_file_offset: u64,
}

impl BlockMetaData {
    fn write(&self, w: &mut BitWriter) {
        w.put_u64(self.desc.meta_size);
        w.put_u64(self.desc.dna_size);
        w.put_u64(self.desc.qua_size);
        w.put_u64(self.desc.head_size);
        w.put_u64(self.desc.records_count);
        w.put_u64(self.desc.raw_dna_size);
        w.put_u64(self.desc.raw_head_size);
        w.put_u64(self.meta_file_offset);
        w.put_u64(self.dna_file_offset);
        w.put_u64(self.qua_file_offset);
        w.put_u64(self.head_file_offset);
    }

    fn read(r: &mut BitReader) -> Self {
        BlockMetaData {
            desc: BinDescriptor {
                meta_size: r.get_u64(),
                dna_size: r.get_u64(),
                qua_size: r.get_u64(),
                head_size: r.get_u64(),
                records_count: r.get_u64(),
                raw_dna_size: r.get_u64(),
                raw_head_size: r.get_u64(),
            },
            meta_file_offset: r.get_u64(),
            dna_file_offset: r.get_u64(),
            qua_file_offset: r.get_u64(),
            head_file_offset: r.get_u64(),
        }
    }
}

/// Everything the footer records about one signature bin.
#[derive(Clone, Debug, Default)]
pub struct BinInfo {
    pub total_meta_size: u64,
    pub total_dna_size: u64,
    pub total_qua_size: u64,
    pub total_head_size: u64,
    pub total_raw_dna_size: u64,
    pub total_raw_head_size: u64,
    pub total_records_count: u64,
    pub blocks: Vec<BlockMetaData>,
}

/// The parsed bin-file footer.
#[derive(Clone, Debug, Default)]
pub struct BinFileFooter {
    pub config: BinModuleConfig,
    pub bin_offsets: BTreeMap<u32, BinInfo>,
    pub qua_data: Option<QualityCompressionData>,
    pub head_stats: Option<HeaderStats>,
}

/// Streaming writer of the four bin files.
pub struct BinFileWriter {
    meta: BufWriter<File>,
    dna: BufWriter<File>,
    qua: BufWriter<File>,
    head: Option<BufWriter<File>>,
    meta_pos: u64,
    dna_pos: u64,
    qua_pos: u64,
    head_pos: u64,
    header: BinFileHeader,
    footer: BinFileFooter,
    stats: BlockStats,
}

fn create(path: String) -> FastoreResult<BufWriter<File>> {
    Ok(BufWriter::new(File::create(Path::new(&path))?))
}

impl BinFileWriter {
    pub fn start(prefix: &str, config: &BinModuleConfig) -> FastoreResult<Self> {
        let mut meta = create(format!("{}{}", prefix, BIN_META_EXT))?;
        let dna = create(format!("{}{}", prefix, BIN_DNA_EXT))?;
        let qua = create(format!("{}{}", prefix, BIN_QUA_EXT))?;
        let head = if config.archive_type.has_headers {
            Some(create(format!("{}{}", prefix, BIN_HEAD_EXT))?)
        } else {
            None
        };

        // reserve the header slot
        meta.write_all(&[0u8; BinFileHeader::SIZE])?;

        let mut footer = BinFileFooter::default();
        footer.config = config.clone();

        Ok(BinFileWriter {
            meta,
            dna,
            qua,
            head,
            meta_pos: BinFileHeader::SIZE as u64,
            dna_pos: 0,
            qua_pos: 0,
            head_pos: 0,
            header: BinFileHeader {
                uses_head_stream: config.archive_type.has_headers,
                ..BinFileHeader::default()
            },
            footer,
            stats: BlockStats::default(),
        })
    }

    pub fn write_block(&mut self, block: &BinaryBinBlock) -> FastoreResult<()> {
        debug_assert!(block.check_consistency());

        let mut offsets = (0usize, 0usize, 0usize, 0usize);
        let descriptors: Vec<(u32, BinDescriptor)> = match block.block_type {
            BlockType::MultiSignature => {
                block.descriptors.iter().map(|(&s, &d)| (s, d)).collect()
            },
            BlockType::SingleSignature => block
                .aux_descriptors
                .iter()
                .map(|&d| (block.signature, d))
                .collect(),
        };

        for (signature, desc) in descriptors {
            self.header.records_count += desc.records_count;

            let bmd = BlockMetaData {
                desc,
                meta_file_offset: self.meta_pos,
                dna_file_offset: self.dna_pos,
                qua_file_offset: self.qua_pos,
                head_file_offset: self.head_pos,
            };

            self.meta
                .write_all(&block.meta[offsets.0..offsets.0 + desc.meta_size as usize])?;
            self.dna
                .write_all(&block.dna[offsets.1..offsets.1 + desc.dna_size as usize])?;
            self.qua
                .write_all(&block.qua[offsets.2..offsets.2 + desc.qua_size as usize])?;
            if let Some(head) = self.head.as_mut() {
                head.write_all(
                    &block.head[offsets.3..offsets.3 + desc.head_size as usize])?;
            }

            offsets.0 += desc.meta_size as usize;
            offsets.1 += desc.dna_size as usize;
            offsets.2 += desc.qua_size as usize;
            offsets.3 += desc.head_size as usize;
            self.meta_pos += desc.meta_size;
            self.dna_pos += desc.dna_size;
            self.qua_pos += desc.qua_size;
            self.head_pos += desc.head_size;

            let info = self.footer.bin_offsets.entry(signature).or_default();
            info.total_meta_size += desc.meta_size;
            info.total_dna_size += desc.dna_size;
            info.total_qua_size += desc.qua_size;
            info.total_head_size += desc.head_size;
            info.total_raw_dna_size += desc.raw_dna_size;
            info.total_raw_head_size += desc.raw_head_size;
            info.total_records_count += desc.records_count;
            info.blocks.push(bmd);
        }

        self.stats.merge(&block.stats)?;
        Ok(())
    }

    /// Inject side data inherited from a previous binning level; overrides
    /// whatever `finish` would compute from the collected statistics.
    pub fn carry_side_data(&mut self,
                           qua_data: Option<QualityCompressionData>,
                           head_stats: Option<HeaderStats>) {
        self.footer.qua_data = qua_data;
        self.footer.head_stats = head_stats;
    }

    pub fn finish(mut self) -> FastoreResult<BinFileHeader> {
        self.header.block_count = self.footer.bin_offsets.len() as u64;
        self.header.footer_offset = self.meta_pos;

        // global quality side data is computed once, at the first binning level
        if self.footer.qua_data.is_none()
            && self.footer.config.quality.method == QualityMethod::Qvz
            && self.footer.config.binning_level == 0
        {
            self.footer.qua_data =
                Some(QualityCompressionData::from_stats(&self.stats.quality));
        }
        if self.footer.head_stats.is_none() && self.footer.config.archive_type.has_headers {
            let mut head_stats = self.stats.headers.clone();
            if self.footer.config.archive_type.paired_end {
                head_stats.detect_paired_end_field();
            }
            self.footer.head_stats = Some(head_stats);
        }

        let footer_bytes = write_footer(&self.footer)?;
        self.meta.write_all(&footer_bytes)?;
        self.header.footer_size = footer_bytes.len() as u64;

        self.meta.flush()?;
        let file = self.meta.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.to_bytes())?;
        file.flush()?;

        self.dna.flush()?;
        self.qua.flush()?;
        if let Some(head) = self.head.as_mut() {
            head.flush()?;
        }

        info!("bin file finished: {} records in {} bins",
              self.header.records_count,
              self.header.block_count);
        Ok(self.header)
    }
}

fn write_footer(footer: &BinFileFooter) -> FastoreResult<Vec<u8>> {
    let mut w = BitWriter::new();

    let config_blob = bincode::serialize(&footer.config)?;
    w.put_u64(config_blob.len() as u64);
    w.put_bytes(&config_blob);

    // occupancy bitmap over [0, 4^L]
    let total = footer.config.minimizer.total_signatures() + 1;
    for sig in 0..total {
        w.put_bit(footer.bin_offsets.contains_key(&sig));
    }
    w.flush();

    let uses_headers = footer.config.archive_type.has_headers;
    for info in footer.bin_offsets.values() {
        w.put_u64(info.total_meta_size);
        w.put_u64(info.total_dna_size);
        w.put_u64(info.total_qua_size);
        w.put_u64(info.total_raw_dna_size);
        w.put_u64(info.total_records_count);
        if uses_headers {
            w.put_u64(info.total_head_size);
            w.put_u64(info.total_raw_head_size);
        }
        w.put_u64(info.blocks.len() as u64);
        for block in &info.blocks {
            block.write(&mut w);
        }
    }

    if let Some(qua_data) = &footer.qua_data {
        qua_data.write(&mut w);
    }
    if let Some(head_stats) = &footer.head_stats {
        head_stats.write(&mut w, footer.config.archive_type.paired_end);
    }

    Ok(w.into_inner())
}

fn read_footer(bytes: &[u8], uses_head_stream: bool) -> FastoreResult<BinFileFooter> {
    let mut r = BitReader::new(bytes);

    let config_len = r.get_u64() as usize;
    if config_len > bytes.len() {
        return Err(FastoreError::CorruptedFile(
            "bin footer configuration overruns the footer".to_string(),
        ));
    }
    let config: BinModuleConfig = bincode::deserialize(r.get_bytes(config_len))?;

    let total = config.minimizer.total_signatures() + 1;
    let mut occupied = Vec::new();
    for sig in 0..total {
        if r.get_bit() {
            occupied.push(sig);
        }
    }
    r.align();

    let uses_headers = config.archive_type.has_headers;
    if uses_headers != uses_head_stream {
        return Err(FastoreError::CorruptedFile(
            "header-stream flag disagrees between header and footer".to_string(),
        ));
    }

    let mut bin_offsets = BTreeMap::new();
    for sig in occupied {
        let mut info = BinInfo {
            total_meta_size: r.get_u64(),
            total_dna_size: r.get_u64(),
            total_qua_size: r.get_u64(),
            total_raw_dna_size: r.get_u64(),
            total_records_count: r.get_u64(),
            ..BinInfo::default()
        };
        if uses_headers {
            info.total_head_size = r.get_u64();
            info.total_raw_head_size = r.get_u64();
        }
        let block_count = r.get_u64();
        if info.total_records_count == 0 || block_count == 0 {
            return Err(FastoreError::CorruptedFile(
                "empty bin recorded in the footer".to_string(),
            ));
        }
        for _ in 0..block_count {
            info.blocks.push(BlockMetaData::read(&mut r));
        }
        bin_offsets.insert(sig, info);
    }

    let qua_data = if config.quality.method == QualityMethod::Qvz {
        Some(QualityCompressionData::read(&mut r))
    } else {
        None
    };
    let head_stats = if uses_headers {
        Some(HeaderStats::read(&mut r, config.archive_type.paired_end)?)
    } else {
        None
    };

    Ok(BinFileFooter {
        config,
        bin_offsets,
        qua_data,
        head_stats,
    })
}

/// Reader of the bin files; streams bins back in ascending-signature order.
pub struct BinFileReader {
    meta: File,
    dna: File,
    qua: File,
    head: Option<File>,
    header: BinFileHeader,
    footer: BinFileFooter,
    order: Vec<u32>,
    next: usize,
}

impl BinFileReader {
    pub fn open(prefix: &str) -> FastoreResult<Self> {
        let mut meta = File::open(format!("{}{}", prefix, BIN_META_EXT))
            .map_err(|_| FastoreError::MissingFile(format!("{}{}", prefix, BIN_META_EXT)))?;
        let meta_size = meta.metadata()?.len();
        if meta_size == 0 {
            return Err(FastoreError::CorruptedFile("empty bin file".to_string()));
        }

        let mut header_bytes = [0u8; BinFileHeader::SIZE];
        if meta.read_exact(&mut header_bytes).is_err() {
            return Err(FastoreError::CorruptedFile(
                "bin file shorter than its header".to_string(),
            ));
        }
        let header = BinFileHeader::from_bytes(&header_bytes);

        let footer_end = header.footer_offset.checked_add(header.footer_size);
        if header.block_count == 0 || footer_end.map_or(true, |end| end > meta_size) {
            return Err(FastoreError::CorruptedFile(
                "corrupted bin file header".to_string(),
            ));
        }

        meta.seek(SeekFrom::Start(header.footer_offset))?;
        let mut footer_bytes = vec![0u8; header.footer_size as usize];
        meta.read_exact(&mut footer_bytes)?;
        let footer = read_footer(&footer_bytes, header.uses_head_stream)?;

        let dna = File::open(format!("{}{}", prefix, BIN_DNA_EXT))
            .map_err(|_| FastoreError::MissingFile(format!("{}{}", prefix, BIN_DNA_EXT)))?;
        let qua = File::open(format!("{}{}", prefix, BIN_QUA_EXT))
            .map_err(|_| FastoreError::MissingFile(format!("{}{}", prefix, BIN_QUA_EXT)))?;
        let head = if header.uses_head_stream {
            Some(File::open(format!("{}{}", prefix, BIN_HEAD_EXT)).map_err(|_| {
                FastoreError::MissingFile(format!("{}{}", prefix, BIN_HEAD_EXT))
            })?)
        } else {
            None
        };

        let order: Vec<u32> = footer.bin_offsets.keys().cloned().collect();
        Ok(BinFileReader {
            meta,
            dna,
            qua,
            head,
            header,
            footer,
            order,
            next: 0,
        })
    }

    pub fn header(&self) -> &BinFileHeader {
        &self.header
    }

    pub fn footer(&self) -> &BinFileFooter {
        &self.footer
    }

    pub fn config(&self) -> &BinModuleConfig {
        &self.footer.config
    }

    /// Read the next full signature bin, in ascending-signature order.
    pub fn read_next_block(&mut self, block: &mut BinaryBinBlock) -> FastoreResult<bool> {
        if self.next >= self.order.len() {
            return Ok(false);
        }
        let signature = self.order[self.next];
        self.next += 1;
        self.read_block(signature, block)?;
        Ok(true)
    }

    /// Read one signature's data, re-seeking every stream per sub-bin.
    pub fn read_block(&mut self,
                      signature: u32,
                      block: &mut BinaryBinBlock)
                      -> FastoreResult<()> {
        let info = self.footer.bin_offsets.get(&signature).cloned().ok_or_else(|| {
            FastoreError::CorruptedFile(format!("unknown signature bin {}", signature))
        })?;

        block.reset();
        block.block_type = BlockType::SingleSignature;
        block.signature = signature;

        for bmd in &info.blocks {
            read_at(&mut self.meta, bmd.meta_file_offset, bmd.desc.meta_size,
                    &mut block.meta)?;
            read_at(&mut self.dna, bmd.dna_file_offset, bmd.desc.dna_size,
                    &mut block.dna)?;
            read_at(&mut self.qua, bmd.qua_file_offset, bmd.desc.qua_size,
                    &mut block.qua)?;
            if let Some(head) = self.head.as_mut() {
                read_at(head, bmd.head_file_offset, bmd.desc.head_size, &mut block.head)?;
            }
            block.raw_dna_size += bmd.desc.raw_dna_size;
            block.raw_head_size += bmd.desc.raw_head_size;
            block.aux_descriptors.push(bmd.desc);
        }
        Ok(())
    }
}

fn read_at(file: &mut File, offset: u64, size: u64, out: &mut Vec<u8>) -> FastoreResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    let start = out.len();
    out.resize(start + size as usize, 0);
    file.read_exact(&mut out[start..]).map_err(|_| {
        FastoreError::CorruptedFile("bin stream truncated".to_string())
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::categorizer::Categorizer;
    use crate::packer::RecordPacker;
    use crate::params::CategorizerParams;
    use crate::records::FastqRecord;
    use tempfile::tempdir;

    fn rec(seq: &[u8]) -> FastqRecord {
        FastqRecord::new(seq.to_vec(), vec![b'I'; seq.len()], Vec::new())
    }

    fn write_sample(prefix: &str, config: &BinModuleConfig) -> u64 {
        let categorizer =
            Categorizer::new(config.minimizer, CategorizerParams::default());
        let packer = RecordPacker::new(config.clone());

        let mut writer = BinFileWriter::start(prefix, config).unwrap();
        for batch in 0..3u8 {
            let reads: Vec<FastqRecord> = (0..8)
                .map(|i| {
                    let mut seq = b"ACGTACGTACGTACGTACGT".to_vec();
                    seq[0] = b"ACGT"[(batch as usize + i) % 4];
                    rec(&seq)
                })
                .collect();
            let bins = categorizer.categorize(reads);
            let mut block = crate::bin_block::BinaryBinBlock::default();
            packer.pack_bins(bins, &mut block).unwrap();
            writer.write_block(&block).unwrap();
        }
        writer.finish().unwrap().records_count
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("sample");
        let prefix = prefix.to_str().unwrap();
        let config = BinModuleConfig::default();

        let written = write_sample(prefix, &config);
        assert_eq!(24, written);

        let mut reader = BinFileReader::open(prefix).unwrap();
        assert_eq!(config, *reader.config());

        let packer = RecordPacker::new(reader.config().clone());
        let mut block = crate::bin_block::BinaryBinBlock::default();
        let mut total = 0;
        while reader.read_next_block(&mut block).unwrap() {
            let records = packer.unpack_block(&block).unwrap();
            assert!(!records.is_empty());
            total += records.len() as u64;
        }
        assert_eq!(written, total);
    }

    #[test]
    fn multiple_batches_merge_per_bin() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("merged");
        let prefix = prefix.to_str().unwrap();
        let config = BinModuleConfig::default();
        write_sample(prefix, &config);

        let reader = BinFileReader::open(prefix).unwrap();
        // at least one bin must have accumulated several sub-bins
        assert!(reader
            .footer()
            .bin_offsets
            .values()
            .any(|info| info.blocks.len() > 1));
    }

    #[test]
    fn corrupted_footer_offset_is_detected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("bad");
        let prefix = prefix.to_str().unwrap();
        let config = BinModuleConfig::default();
        write_sample(prefix, &config);

        // overwrite the footer offset with a value beyond EOF
        let meta_path = format!("{}{}", prefix, BIN_META_EXT);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&meta_path)
            .unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.flush().unwrap();

        match BinFileReader::open(prefix) {
            Err(FastoreError::CorruptedFile(_)) => {},
            other => panic!("expected a corrupted-file error, got {:?}",
                            other.map(|_| ())),
        }
    }

    #[test]
    fn empty_file_is_detected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("empty");
        let prefix = prefix.to_str().unwrap();
        std::fs::File::create(format!("{}{}", prefix, BIN_META_EXT)).unwrap();
        assert!(matches!(BinFileReader::open(prefix),
                         Err(FastoreError::CorruptedFile(_))));
    }

    #[test]
    fn footer_roundtrip_with_grouped_bins() {
        let config = BinModuleConfig::default();
        let mut footer = BinFileFooter {
            config: config.clone(),
            ..BinFileFooter::default()
        };
        let mut info = BinInfo::default();
        info.total_meta_size = 10;
        info.total_dna_size = 20;
        info.total_qua_size = 30;
        info.total_raw_dna_size = 40;
        info.total_records_count = 2;
        info.blocks.push(BlockMetaData {
            desc: BinDescriptor {
                meta_size: 10,
                dna_size: 20,
                qua_size: 30,
                records_count: 2,
                raw_dna_size: 40,
                ..BinDescriptor::default()
            },
            meta_file_offset: 48,
            dna_file_offset: 0,
            qua_file_offset: 0,
            head_file_offset: 0,
        });
        footer.bin_offsets.insert(17, info);

        let bytes = write_footer(&footer).unwrap();
        let back = read_footer(&bytes, false).unwrap();
        assert_eq!(1, back.bin_offsets.len());
        let info = &back.bin_offsets[&17];
        assert_eq!(2, info.total_records_count);
        assert_eq!(1, info.blocks.len());
        assert_eq!(48, info.blocks[0].meta_file_offset);
    }
}
