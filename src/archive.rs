//! The final archive container: `<prefix>.cmeta` (header + footer) and
//! `<prefix>.cdata` (concatenated compressed blocks).

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::bitio::{BitReader, BitWriter};
use crate::compressor::CompressedBlock;
use crate::error::*;
use crate::headers::HeaderStats;
use crate::params::{ArchiveType, ClassifierParams, ContigParams, MinimizerParams,
                    QualityMethod, QualityParams};
use crate::quality::QualityCompressionData;

pub const ARCHIVE_META_EXT: &str = ".cmeta";
pub const ARCHIVE_DATA_EXT: &str = ".cdata";

/// Fixed-size archive meta-file header.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchiveFileHeader {
    pub footer_offset: u64,
    pub footer_size: u64,
}

impl ArchiveFileHeader {
    pub const SIZE: usize = 24;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.footer_offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.footer_size.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        ArchiveFileHeader {
            footer_offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            footer_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// Global archive configuration, embedded verbatim in the footer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    pub archive_type: ArchiveType,
    pub minimizer: MinimizerParams,
    pub quality: QualityParams,
    pub contig: ContigParams,
    pub classifier: ClassifierParams,
}

/// The parsed archive footer.
#[derive(Clone, Debug, Default)]
pub struct ArchiveFooter {
    pub block_sizes: Vec<u64>,
    pub signatures: Vec<u32>,
    pub config: ArchiveConfig,
    pub qua_data: Option<QualityCompressionData>,
    pub head_stats: Option<HeaderStats>,
}

/// Writer of the two archive files.
pub struct ArchiveFileWriter {
    meta: BufWriter<File>,
    data: BufWriter<File>,
    footer: ArchiveFooter,
}

impl ArchiveFileWriter {
    pub fn start(prefix: &str,
                 config: ArchiveConfig,
                 qua_data: Option<QualityCompressionData>,
                 head_stats: Option<HeaderStats>)
                 -> FastoreResult<Self> {
        let mut meta =
            BufWriter::new(File::create(format!("{}{}", prefix, ARCHIVE_META_EXT))?);
        let data =
            BufWriter::new(File::create(format!("{}{}", prefix, ARCHIVE_DATA_EXT))?);

        meta.write_all(&[0u8; ArchiveFileHeader::SIZE])?;

        Ok(ArchiveFileWriter {
            meta,
            data,
            footer: ArchiveFooter {
                config,
                qua_data,
                head_stats,
                ..ArchiveFooter::default()
            },
        })
    }

    pub fn write_block(&mut self, block: &CompressedBlock) -> FastoreResult<()> {
        debug_assert!(!block.data.is_empty());
        self.footer.block_sizes.push(block.data.len() as u64);
        self.footer.signatures.push(block.signature);
        self.data.write_all(&block.data)?;
        Ok(())
    }

    pub fn finish(mut self) -> FastoreResult<()> {
        let footer_offset = ArchiveFileHeader::SIZE as u64;
        let footer_bytes = write_footer(&self.footer)?;
        self.meta.write_all(&footer_bytes)?;

        let header = ArchiveFileHeader {
            footer_offset,
            footer_size: footer_bytes.len() as u64,
        };

        self.meta.flush()?;
        let file = self.meta.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.flush()?;
        self.data.flush()?;

        info!("archive finished: {} compressed blocks",
              self.footer.block_sizes.len());
        Ok(())
    }
}

fn write_footer(footer: &ArchiveFooter) -> FastoreResult<Vec<u8>> {
    let mut w = BitWriter::new();

    w.put_u32(footer.block_sizes.len() as u32);
    for &size in &footer.block_sizes {
        w.put_u64(size);
    }
    for &sig in &footer.signatures {
        w.put_u32(sig);
    }

    let config_blob = bincode::serialize(&footer.config)?;
    w.put_u64(config_blob.len() as u64);
    w.put_bytes(&config_blob);

    if let Some(qua_data) = &footer.qua_data {
        qua_data.write(&mut w);
    }
    if let Some(head_stats) = &footer.head_stats {
        head_stats.write(&mut w, footer.config.archive_type.paired_end);
    }

    Ok(w.into_inner())
}

fn read_footer(bytes: &[u8]) -> FastoreResult<ArchiveFooter> {
    let mut r = BitReader::new(bytes);

    let block_count = r.get_u32() as usize;
    if block_count == 0 {
        return Err(FastoreError::CorruptedFile("archive with no blocks".to_string()));
    }
    let mut block_sizes = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        block_sizes.push(r.get_u64());
    }
    let mut signatures = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        signatures.push(r.get_u32());
    }

    let config_len = r.get_u64() as usize;
    if config_len > bytes.len() {
        return Err(FastoreError::CorruptedFile(
            "archive configuration overruns the footer".to_string(),
        ));
    }
    let config: ArchiveConfig = bincode::deserialize(r.get_bytes(config_len))?;

    let qua_data = if config.quality.method == QualityMethod::Qvz {
        Some(QualityCompressionData::read(&mut r))
    } else {
        None
    };
    let head_stats = if config.archive_type.has_headers {
        Some(HeaderStats::read(&mut r, config.archive_type.paired_end)?)
    } else {
        None
    };

    Ok(ArchiveFooter {
        block_sizes,
        signatures,
        config,
        qua_data,
        head_stats,
    })
}

/// Reader of the archive; iterates blocks in footer order.
pub struct ArchiveFileReader {
    data: File,
    footer: ArchiveFooter,
    offsets: Vec<u64>,
    next: usize,
}

impl ArchiveFileReader {
    pub fn open(prefix: &str) -> FastoreResult<Self> {
        let meta_path = format!("{}{}", prefix, ARCHIVE_META_EXT);
        let mut meta = File::open(&meta_path)
            .map_err(|_| FastoreError::MissingFile(meta_path.clone()))?;
        let meta_size = meta.metadata()?.len();
        if meta_size == 0 {
            return Err(FastoreError::CorruptedFile("empty archive".to_string()));
        }

        let mut header_bytes = [0u8; ArchiveFileHeader::SIZE];
        if meta.read_exact(&mut header_bytes).is_err() {
            return Err(FastoreError::CorruptedFile(
                "archive shorter than its header".to_string(),
            ));
        }
        let header = ArchiveFileHeader::from_bytes(&header_bytes);

        let footer_end = header.footer_offset.checked_add(header.footer_size);
        if footer_end.map_or(true, |end| end > meta_size) {
            return Err(FastoreError::CorruptedFile(
                "corrupted archive header".to_string(),
            ));
        }

        meta.seek(SeekFrom::Start(header.footer_offset))?;
        let mut footer_bytes = vec![0u8; header.footer_size as usize];
        meta.read_exact(&mut footer_bytes)?;
        let footer = read_footer(&footer_bytes)?;

        let data_path = format!("{}{}", prefix, ARCHIVE_DATA_EXT);
        let data = File::open(&data_path)
            .map_err(|_| FastoreError::MissingFile(data_path.clone()))?;
        let data_size = data.metadata()?.len();
        if data_size == 0 {
            return Err(FastoreError::CorruptedFile("empty archive".to_string()));
        }

        let mut offsets = Vec::with_capacity(footer.block_sizes.len());
        let mut offset = 0u64;
        for &size in &footer.block_sizes {
            offsets.push(offset);
            offset = offset.checked_add(size).ok_or_else(|| {
                FastoreError::CorruptedFile("archive block sizes overflow".to_string())
            })?;
        }
        if offset > data_size {
            return Err(FastoreError::CorruptedFile(
                "archive data shorter than its block table".to_string(),
            ));
        }

        Ok(ArchiveFileReader {
            data,
            footer,
            offsets,
            next: 0,
        })
    }

    pub fn footer(&self) -> &ArchiveFooter {
        &self.footer
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.footer.config
    }

    pub fn block_count(&self) -> usize {
        self.footer.block_sizes.len()
    }

    /// Read the next compressed block; returns `false` at the end.
    pub fn read_next_block(&mut self, block: &mut CompressedBlock) -> FastoreResult<bool> {
        if self.next >= self.footer.block_sizes.len() {
            return Ok(false);
        }
        let idx = self.next;
        self.next += 1;
        self.read_block(idx, block)?;
        Ok(true)
    }

    /// Random access to any block by its footer index.
    pub fn read_block(&mut self,
                      idx: usize,
                      block: &mut CompressedBlock)
                      -> FastoreResult<()> {
        let size = self.footer.block_sizes[idx] as usize;
        self.data.seek(SeekFrom::Start(self.offsets[idx]))?;
        block.signature = self.footer.signatures[idx];
        block.part_id = idx as u64;
        block.data.resize(size, 0);
        self.data.read_exact(&mut block.data).map_err(|_| {
            FastoreError::CorruptedFile("archive data truncated".to_string())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn sample_block(signature: u32, fill: u8, len: usize) -> CompressedBlock {
        CompressedBlock {
            signature,
            data: vec![fill; len],
            part_id: 0,
        }
    }

    #[test]
    fn archive_roundtrip() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("arch");
        let prefix = prefix.to_str().unwrap();

        let config = ArchiveConfig::default();
        let mut writer =
            ArchiveFileWriter::start(prefix, config.clone(), None, None).unwrap();
        writer.write_block(&sample_block(11, 0xAA, 100)).unwrap();
        writer.write_block(&sample_block(22, 0xBB, 50)).unwrap();
        writer.write_block(&sample_block(33, 0xCC, 7)).unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveFileReader::open(prefix).unwrap();
        assert_eq!(config, *reader.config());
        assert_eq!(3, reader.block_count());

        let mut block = CompressedBlock::default();
        let mut seen = Vec::new();
        while reader.read_next_block(&mut block).unwrap() {
            seen.push((block.signature, block.data.clone()));
        }
        assert_eq!(3, seen.len());
        assert_eq!((11, vec![0xAA; 100]), seen[0]);
        assert_eq!((22, vec![0xBB; 50]), seen[1]);
        assert_eq!((33, vec![0xCC; 7]), seen[2]);
    }

    #[test]
    fn random_access_by_index() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("rand");
        let prefix = prefix.to_str().unwrap();

        let mut writer =
            ArchiveFileWriter::start(prefix, ArchiveConfig::default(), None, None)
                .unwrap();
        for i in 0..5u8 {
            writer.write_block(&sample_block(i as u32, i, 10 + i as usize)).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = ArchiveFileReader::open(prefix).unwrap();
        let mut block = CompressedBlock::default();
        reader.read_block(3, &mut block).unwrap();
        assert_eq!(3, block.signature);
        assert_eq!(vec![3u8; 13], block.data);
    }

    #[test]
    fn corrupted_footer_offset_is_detected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("bad");
        let prefix = prefix.to_str().unwrap();

        let mut writer =
            ArchiveFileWriter::start(prefix, ArchiveConfig::default(), None, None)
                .unwrap();
        writer.write_block(&sample_block(1, 1, 10)).unwrap();
        writer.finish().unwrap();

        let meta_path = format!("{}{}", prefix, ARCHIVE_META_EXT);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&meta_path)
            .unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.flush().unwrap();

        assert!(matches!(ArchiveFileReader::open(prefix),
                         Err(FastoreError::CorruptedFile(_))));
    }

    #[test]
    fn qvz_and_header_sections_roundtrip() {
        use crate::quality::QualityStats;

        let dir = tempdir().unwrap();
        let prefix = dir.path().join("extra");
        let prefix = prefix.to_str().unwrap();

        let mut config = ArchiveConfig::default();
        config.quality.method = QualityMethod::Qvz;
        config.archive_type.has_headers = true;

        let mut qstats = QualityStats::default();
        qstats.update(&[10, 20, 30, 40]);
        let qua_data = QualityCompressionData::from_stats(&qstats);

        let mut head_stats = HeaderStats::default();
        head_stats.update(b"@RUN.1").unwrap();
        head_stats.update(b"@RUN.2").unwrap();

        let mut writer = ArchiveFileWriter::start(
            prefix,
            config,
            Some(qua_data.clone()),
            Some(head_stats.clone()),
        )
        .unwrap();
        writer.write_block(&sample_block(1, 9, 3)).unwrap();
        writer.finish().unwrap();

        let reader = ArchiveFileReader::open(prefix).unwrap();
        assert_eq!(Some(&qua_data), reader.footer().qua_data.as_ref());
        assert_eq!(Some(&head_stats), reader.footer().head_stats.as_ref());
    }
}
