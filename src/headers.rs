//! Identifier-field schema: tokenization of read headers into fields and the
//! per-field compression used by the packing stage.
//!
//! Headers are split on a fixed separator set; each field is tracked as
//! constant, numeric (with min/max) or an enumerated token set. The schema is
//! inferred during binning, stored in the bin-file footer, and drives the
//! token/value range-coder streams of the archive.

use std::collections::BTreeSet;

use crate::bitio::{BitReader, BitWriter};
use crate::error::*;
use crate::rc::{CoderDecoder, CoderEncoder};
use crate::util::byte_log;

/// Characters recognized as field separators inside read identifiers.
pub const SEPARATORS: &[u8] = b" ._,=:/-#";

/// Enumerated token sets are stored with a 16-bit count.
pub const MAX_TOKEN_VALUES: usize = u16::MAX as usize;

fn is_separator(b: u8) -> bool {
    SEPARATORS.contains(&b)
}

fn parse_numeric(field: &[u8]) -> Option<u64> {
    if field.is_empty() || field.len() > 19 {
        return None;
    }
    let mut value = 0u64;
    for &b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (b - b'0') as u64;
    }
    Some(value)
}

/// Split a header into `(field, following_separator)` pairs; the final field
/// carries separator 0.
pub fn tokenize(head: &[u8]) -> Vec<(&[u8], u8)> {
    let mut fields = Vec::new();
    let mut start = 0;
    for (i, &b) in head.iter().enumerate() {
        if is_separator(b) {
            fields.push((&head[start..i], b));
            start = i + 1;
        }
    }
    fields.push((&head[start..], 0));
    fields
}

/// Statistics of one identifier field across all records seen so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldStats {
    pub separator: u8,
    pub is_numeric: bool,
    pub min_value: u64,
    pub max_value: u64,
    pub values: BTreeSet<Vec<u8>>,
}

impl FieldStats {
    fn new(separator: u8) -> Self {
        FieldStats {
            separator,
            is_numeric: true,
            min_value: u64::MAX,
            max_value: 0,
            values: BTreeSet::new(),
        }
    }

    pub fn is_const(&self) -> bool {
        if self.is_numeric {
            self.min_value == self.max_value
        } else {
            self.values.len() == 1
        }
    }

    fn update(&mut self, field: &[u8]) -> FastoreResult<()> {
        match parse_numeric(field) {
            Some(v) if self.is_numeric => {
                self.min_value = self.min_value.min(v);
                self.max_value = self.max_value.max(v);
            },
            _ => {
                self.is_numeric = false;
            },
        }
        if self.values.len() <= MAX_TOKEN_VALUES {
            self.values.insert(field.to_vec());
        }
        if !self.is_numeric && self.values.len() > MAX_TOKEN_VALUES {
            return Err(FastoreError::InvalidArgument(format!(
                "identifier field has more than {} distinct values",
                MAX_TOKEN_VALUES
            )));
        }
        Ok(())
    }

    fn merge(&mut self, other: &FieldStats) -> FastoreResult<()> {
        if self.separator != other.separator {
            return Err(FastoreError::InvalidArgument(
                "inconsistent identifier field separators".to_string(),
            ));
        }
        self.is_numeric &= other.is_numeric;
        self.min_value = self.min_value.min(other.min_value);
        self.max_value = self.max_value.max(other.max_value);
        for v in &other.values {
            self.values.insert(v.clone());
        }
        if !self.is_numeric && self.values.len() > MAX_TOKEN_VALUES {
            return Err(FastoreError::InvalidArgument(format!(
                "identifier field has more than {} distinct values",
                MAX_TOKEN_VALUES
            )));
        }
        Ok(())
    }
}

/// The full identifier schema of an archive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderStats {
    pub fields: Vec<FieldStats>,
    /// Index of the field carrying the `/1 /2` mate indicator (PE archives).
    pub paired_end_field: u8,
}

impl HeaderStats {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn update(&mut self, head: &[u8]) -> FastoreResult<()> {
        let tokens = tokenize(head);
        if self.fields.is_empty() {
            self.fields = tokens.iter().map(|&(_, sep)| FieldStats::new(sep)).collect();
        } else if self.fields.len() != tokens.len() {
            return Err(FastoreError::InvalidArgument(format!(
                "identifier has {} fields, expected {}",
                tokens.len(),
                self.fields.len()
            )));
        }
        for (stats, (field, sep)) in self.fields.iter_mut().zip(tokens) {
            if stats.separator != sep {
                return Err(FastoreError::InvalidArgument(
                    "inconsistent identifier field separators".to_string(),
                ));
            }
            stats.update(field)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &HeaderStats) -> FastoreResult<()> {
        if other.fields.is_empty() {
            return Ok(());
        }
        if self.fields.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        if self.fields.len() != other.fields.len() {
            return Err(FastoreError::InvalidArgument(
                "inconsistent identifier field counts across blocks".to_string(),
            ));
        }
        for (a, b) in self.fields.iter_mut().zip(&other.fields) {
            a.merge(b)?;
        }
        Ok(())
    }

    /// Locate the `/1 /2` mate field: the last numeric field spanning [1, 2].
    pub fn detect_paired_end_field(&mut self) {
        self.paired_end_field = 0;
        for (i, f) in self.fields.iter().enumerate().rev() {
            if f.is_numeric && f.min_value == 1 && f.max_value == 2 {
                self.paired_end_field = i as u8;
                break;
            }
        }
    }

    pub fn write(&self, writer: &mut BitWriter, paired_end: bool) {
        debug_assert!(!self.fields.is_empty());
        writer.put_byte(self.fields.len() as u8);
        for f in &self.fields {
            writer.put_byte(f.is_numeric as u8);
            writer.put_byte(f.is_const() as u8);
            writer.put_byte(f.separator);
            if f.is_numeric {
                writer.put_u64(f.min_value);
                if !f.is_const() {
                    writer.put_u64(f.max_value);
                }
            } else {
                if !f.is_const() {
                    writer.put_u16(f.values.len() as u16);
                }
                for v in &f.values {
                    writer.put_byte(v.len() as u8);
                    writer.put_bytes(v);
                }
            }
        }
        if paired_end {
            writer.put_byte(self.paired_end_field);
        }
    }

    pub fn read(reader: &mut BitReader, paired_end: bool) -> FastoreResult<HeaderStats> {
        let count = reader.get_byte() as usize;
        if count == 0 {
            return Err(FastoreError::CorruptedFile(
                "empty identifier schema".to_string(),
            ));
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let is_numeric = reader.get_byte() != 0;
            let is_const = reader.get_byte() != 0;
            let separator = reader.get_byte();
            let mut f = FieldStats::new(separator);
            f.is_numeric = is_numeric;
            if is_numeric {
                f.min_value = reader.get_u64();
                f.max_value = if is_const { f.min_value } else { reader.get_u64() };
            } else {
                let values = if is_const { 1 } else { reader.get_u16() as usize };
                for _ in 0..values {
                    let len = reader.get_byte() as usize;
                    f.values.insert(reader.get_bytes(len).to_vec());
                }
            }
            fields.push(f);
        }
        let paired_end_field = if paired_end { reader.get_byte() } else { 0 };
        Ok(HeaderStats { fields, paired_end_field })
    }
}

/// Per-field compression method resolved from the schema.
#[derive(Clone, Debug)]
enum FieldMethod {
    Const,
    Token(Vec<Vec<u8>>),
    Raw { min_value: u64, byte_count: u32 },
}

/// Compression plan derived once from a [`HeaderStats`] schema.
#[derive(Clone, Debug)]
pub struct FieldsSpec {
    methods: Vec<FieldMethod>,
    separators: Vec<u8>,
    const_texts: Vec<Option<Vec<u8>>>,
}

const VALUE_CTX_PER_FIELD: usize = 8;

impl FieldsSpec {
    pub fn new(stats: &HeaderStats) -> Self {
        let mut methods = Vec::with_capacity(stats.fields.len());
        let mut const_texts = Vec::with_capacity(stats.fields.len());
        for f in &stats.fields {
            if f.is_const() {
                let text = if f.is_numeric {
                    f.min_value.to_string().into_bytes()
                } else {
                    f.values.iter().next().cloned().unwrap_or_default()
                };
                methods.push(FieldMethod::Const);
                const_texts.push(Some(text));
            } else if f.is_numeric {
                methods.push(FieldMethod::Raw {
                    min_value: f.min_value,
                    byte_count: byte_log(f.max_value - f.min_value) + 1,
                });
                const_texts.push(None);
            } else {
                methods.push(FieldMethod::Token(f.values.iter().cloned().collect()));
                const_texts.push(None);
            }
        }
        let separators = stats.fields.iter().map(|f| f.separator).collect();
        FieldsSpec {
            methods,
            separators,
            const_texts,
        }
    }

    pub fn field_count(&self) -> usize {
        self.methods.len()
    }

    pub fn token_contexts(&self) -> usize {
        self.methods.len().max(1)
    }

    pub fn value_contexts(&self) -> usize {
        (self.methods.len() * VALUE_CTX_PER_FIELD).max(1)
    }

    /// Encode one identifier through the token/value coder pair.
    pub fn compress_read_id(&self,
                            head: &[u8],
                            token_coder: &mut CoderEncoder,
                            value_coder: &mut CoderEncoder)
                            -> FastoreResult<()> {
        let tokens = tokenize(head);
        if tokens.len() != self.methods.len() {
            return Err(FastoreError::InvalidArgument(
                "identifier does not match the archive schema".to_string(),
            ));
        }

        for (field_id, ((field, _), method)) in tokens.iter().zip(&self.methods).enumerate() {
            match method {
                FieldMethod::Const => {},
                FieldMethod::Token(values) => {
                    let id = values
                        .iter()
                        .position(|v| v.as_slice() == *field)
                        .ok_or_else(|| {
                            FastoreError::InvalidArgument(
                                "identifier token missing from the schema".to_string(),
                            )
                        })?;
                    token_coder.encode(id & 0xFF, field_id);
                    if values.len() > 256 {
                        token_coder.encode(id >> 8, field_id);
                    }
                },
                FieldMethod::Raw { min_value, byte_count } => {
                    let value = parse_numeric(field).ok_or_else(|| {
                        FastoreError::InvalidArgument(
                            "non-numeric value in numeric identifier field".to_string(),
                        )
                    })?;
                    let diff = value - min_value;
                    let mut ctx = field_id * VALUE_CTX_PER_FIELD;
                    for b in (0..*byte_count).rev() {
                        value_coder.encode(((diff >> (8 * b)) & 0xFF) as usize, ctx);
                        ctx += 1;
                    }
                },
            }
        }
        Ok(())
    }

    /// Decode one identifier; the inverse of [`FieldsSpec::compress_read_id`].
    pub fn decompress_read_id(&self,
                              token_coder: &mut CoderDecoder,
                              value_coder: &mut CoderDecoder)
                              -> Vec<u8> {
        let mut head = Vec::new();
        for (field_id, method) in self.methods.iter().enumerate() {
            match method {
                FieldMethod::Const => {
                    head.extend_from_slice(self.const_texts[field_id].as_ref().unwrap());
                },
                FieldMethod::Token(values) => {
                    let mut id = token_coder.decode(field_id);
                    if values.len() > 256 {
                        id |= token_coder.decode(field_id) << 8;
                    }
                    head.extend_from_slice(&values[id.min(values.len() - 1)]);
                },
                FieldMethod::Raw { min_value, byte_count } => {
                    let mut diff = 0u64;
                    let mut ctx = field_id * VALUE_CTX_PER_FIELD;
                    for _ in 0..*byte_count {
                        diff = (diff << 8) | value_coder.decode(ctx) as u64;
                        ctx += 1;
                    }
                    let value = diff + min_value;
                    head.extend_from_slice(value.to_string().as_bytes());
                },
            }
            if field_id != self.methods.len() - 1 {
                head.push(self.separators[field_id]);
            }
        }
        head
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tokenize_splits_on_all_separators() {
        let fields = tokenize(b"@SRR001.17/1 len=36");
        let texts: Vec<&[u8]> = fields.iter().map(|&(f, _)| f).collect();
        assert_eq!(
            vec![&b"@SRR001"[..], b"17", b"1", b"len", b"36"],
            texts
        );
        let seps: Vec<u8> = fields.iter().map(|&(_, s)| s).collect();
        assert_eq!(vec![b'.', b'/', b' ', b'=', 0], seps);
    }

    #[test]
    fn schema_inference() {
        let mut stats = HeaderStats::default();
        stats.update(b"@SRR001.1/1").unwrap();
        stats.update(b"@SRR001.2/2").unwrap();
        stats.update(b"@SRR001.3/1").unwrap();

        assert_eq!(3, stats.fields.len());
        assert!(stats.fields[0].is_const());
        assert!(!stats.fields[0].is_numeric);
        assert!(stats.fields[1].is_numeric);
        assert_eq!(1, stats.fields[1].min_value);
        assert_eq!(3, stats.fields[1].max_value);

        stats.detect_paired_end_field();
        assert_eq!(2, stats.paired_end_field);
    }

    #[test]
    fn mismatched_field_count_is_an_error() {
        let mut stats = HeaderStats::default();
        stats.update(b"@SRR001.1").unwrap();
        assert!(stats.update(b"@SRR001.1/1").is_err());
    }

    #[test]
    fn schema_serialization_roundtrip() {
        let mut stats = HeaderStats::default();
        stats.update(b"@INST:4:lane1:55/1").unwrap();
        stats.update(b"@INST:4:lane2:107/2").unwrap();
        stats.detect_paired_end_field();

        let mut writer = BitWriter::new();
        stats.write(&mut writer, true);
        let buf = writer.into_inner();

        let mut reader = BitReader::new(&buf);
        let back = HeaderStats::read(&mut reader, true).unwrap();
        assert_eq!(stats, back);
    }

    #[test]
    fn id_compression_roundtrip() {
        let heads: Vec<&[u8]> = vec![
            b"@RUN7:3:lane2:1101:2203/1",
            b"@RUN7:1:lane1:1102:17/2",
            b"@RUN7:2:lane2:1101:996/1",
        ];

        let mut stats = HeaderStats::default();
        for h in &heads {
            stats.update(h).unwrap();
        }
        let spec = FieldsSpec::new(&stats);

        let mut token_enc = CoderEncoder::new(256, spec.token_contexts());
        let mut value_enc = CoderEncoder::new(256, spec.value_contexts());
        for h in &heads {
            spec.compress_read_id(h, &mut token_enc, &mut value_enc).unwrap();
        }
        let token_buf = token_enc.finish();
        let value_buf = value_enc.finish();

        let mut token_dec = CoderDecoder::new(&token_buf, 256, spec.token_contexts());
        let mut value_dec = CoderDecoder::new(&value_buf, 256, spec.value_contexts());
        for h in &heads {
            let decoded = spec.decompress_read_id(&mut token_dec, &mut value_dec);
            assert_eq!(h.to_vec(), decoded);
        }
    }
}
