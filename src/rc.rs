//! Byte-oriented range coder with adaptive per-context frequency models.
//!
//! Each range-coded stream owns one encoder (or decoder) plus one or more
//! context models; the coded bytes are emitted into the stream's buffer and
//! are passed through the block back-end verbatim, since they are already
//! close to entropy.

const TOP: u32 = 1 << 24;
const MAX_TOTAL: u32 = 1 << 15;
const INCREMENT: u32 = 32;

/// Carry-aware range encoder (LZMA-style byte renormalization).
pub struct RangeEncoder {
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u64,
    out: Vec<u8>,
}

impl Default for RangeEncoder {
    fn default() -> Self {
        RangeEncoder::new()
    }
}

impl RangeEncoder {
    pub fn new() -> Self {
        RangeEncoder {
            low: 0,
            range: u32::MAX,
            cache: 0,
            cache_size: 1,
            out: Vec::new(),
        }
    }

    fn shift_low(&mut self) {
        if (self.low as u32) < 0xFF00_0000 || (self.low >> 32) != 0 {
            let carry = (self.low >> 32) as u8;
            while self.cache_size > 0 {
                self.out.push(self.cache.wrapping_add(carry));
                self.cache = 0xFF;
                self.cache_size -= 1;
            }
            self.cache = (self.low >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = (self.low << 8) & 0xFFFF_FFFF;
    }

    /// Encode a symbol spanning `[cum, cum + freq)` out of `total`.
    pub fn encode(&mut self, cum: u32, freq: u32, total: u32) {
        debug_assert!(freq > 0 && cum + freq <= total);
        let r = self.range / total;
        self.low += r as u64 * cum as u64;
        self.range = r * freq;
        while self.range < TOP {
            self.shift_low();
            self.range <<= 8;
        }
    }

    /// Flush the remaining state and return the coded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.shift_low();
        }
        self.out
    }

    pub fn position(&self) -> usize {
        self.out.len()
    }
}

/// Range decoder mirroring [`RangeEncoder`].
pub struct RangeDecoder<'a> {
    range: u32,
    code: u32,
    input: &'a [u8],
    pos: usize,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        let mut dec = RangeDecoder {
            range: u32::MAX,
            code: 0,
            input,
            pos: 0,
        };
        // the first byte is always the encoder's zero cache
        for _ in 0..5 {
            dec.code = (dec.code << 8) | dec.next_byte() as u32;
        }
        dec
    }

    fn next_byte(&mut self) -> u8 {
        let byte = self.input.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        byte
    }

    /// Return the cumulated frequency of the next symbol, in `[0, total)`.
    pub fn decode_freq(&mut self, total: u32) -> u32 {
        self.range /= total;
        (self.code / self.range).min(total - 1)
    }

    /// Consume the symbol previously looked up with [`RangeDecoder::decode_freq`].
    pub fn decode_update(&mut self, cum: u32, freq: u32) {
        self.code -= cum * self.range;
        self.range *= freq;
        while self.range < TOP {
            self.code = (self.code << 8) | self.next_byte() as u32;
            self.range <<= 8;
        }
    }
}

/// Adaptive frequency model over `symbols` symbols, replicated per context.
/// Symbol counts adapt by increment and are halved when the context total
/// saturates.
pub struct ContextCoder {
    symbols: usize,
    freqs: Vec<u32>,
    totals: Vec<u32>,
}

impl ContextCoder {
    pub fn new(symbols: usize, contexts: usize) -> Self {
        ContextCoder {
            symbols,
            freqs: vec![1; symbols * contexts],
            totals: vec![symbols as u32; contexts],
        }
    }

    fn update(&mut self, ctx: usize, symbol: usize) {
        let base = ctx * self.symbols;
        self.freqs[base + symbol] += INCREMENT;
        self.totals[ctx] += INCREMENT;
        if self.totals[ctx] >= MAX_TOTAL {
            let mut total = 0;
            for f in &mut self.freqs[base..base + self.symbols] {
                *f = (*f >> 1).max(1);
                total += *f;
            }
            self.totals[ctx] = total;
        }
    }

    pub fn encode(&mut self, rc: &mut RangeEncoder, symbol: usize, ctx: usize) {
        debug_assert!(symbol < self.symbols);
        let base = ctx * self.symbols;
        let cum: u32 = self.freqs[base..base + symbol].iter().sum();
        rc.encode(cum, self.freqs[base + symbol], self.totals[ctx]);
        self.update(ctx, symbol);
    }

    pub fn decode(&mut self, rc: &mut RangeDecoder, ctx: usize) -> usize {
        let base = ctx * self.symbols;
        let target = rc.decode_freq(self.totals[ctx]);
        let mut cum = 0;
        let mut symbol = 0;
        while cum + self.freqs[base + symbol] <= target {
            cum += self.freqs[base + symbol];
            symbol += 1;
        }
        rc.decode_update(cum, self.freqs[base + symbol]);
        self.update(ctx, symbol);
        symbol
    }
}

/// A range-coded output stream bundling the encoder with its model.
pub struct CoderEncoder {
    pub rc: RangeEncoder,
    pub model: ContextCoder,
}

impl CoderEncoder {
    pub fn new(symbols: usize, contexts: usize) -> Self {
        CoderEncoder {
            rc: RangeEncoder::new(),
            model: ContextCoder::new(symbols, contexts),
        }
    }

    pub fn encode(&mut self, symbol: usize, ctx: usize) {
        self.model.encode(&mut self.rc, symbol, ctx);
    }

    pub fn finish(self) -> Vec<u8> {
        self.rc.finish()
    }
}

/// A range-coded input stream bundling the decoder with its model.
pub struct CoderDecoder<'a> {
    pub rc: RangeDecoder<'a>,
    pub model: ContextCoder,
}

impl<'a> CoderDecoder<'a> {
    pub fn new(input: &'a [u8], symbols: usize, contexts: usize) -> Self {
        CoderDecoder {
            rc: RangeDecoder::new(input),
            model: ContextCoder::new(symbols, contexts),
        }
    }

    pub fn decode(&mut self, ctx: usize) -> usize {
        self.model.decode(&mut self.rc, ctx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn skewed_symbols_roundtrip() {
        let mut rng = StdRng::seed_from_u64(7);
        let symbols: Vec<usize> = (0..10_000)
            .map(|_| if rng.gen_ratio(9, 10) { 0 } else { rng.gen_range(1, 5) })
            .collect();

        let mut enc = CoderEncoder::new(5, 1);
        for &s in &symbols {
            enc.encode(s, 0);
        }
        let coded = enc.finish();
        // a 90/10 split over 5 symbols should squeeze well below 1 B/symbol
        assert!(coded.len() < symbols.len() / 2);

        let mut dec = CoderDecoder::new(&coded, 5, 1);
        for &s in &symbols {
            assert_eq!(s, dec.decode(0));
        }
    }

    #[test]
    fn contexts_are_independent() {
        let mut enc = CoderEncoder::new(4, 3);
        let stream: Vec<(usize, usize)> =
            (0..600).map(|i| (i % 4, (i / 4) % 3)).collect();
        for &(s, c) in &stream {
            enc.encode(s, c);
        }
        let coded = enc.finish();
        let mut dec = CoderDecoder::new(&coded, 4, 3);
        for &(s, c) in &stream {
            assert_eq!(s, dec.decode(c));
        }
    }

    #[test]
    fn empty_stream_decodes_nothing() {
        let enc = CoderEncoder::new(2, 1);
        let coded = enc.finish();
        assert_eq!(5, coded.len());
        let _ = CoderDecoder::new(&coded, 2, 1);
    }

    #[test]
    fn binary_stream_roundtrip() {
        let bits: Vec<usize> = (0..2048).map(|i| ((i * 31) % 7 == 0) as usize).collect();
        let mut enc = CoderEncoder::new(2, 2);
        for (i, &b) in bits.iter().enumerate() {
            enc.encode(b, i & 1);
        }
        let coded = enc.finish();
        let mut dec = CoderDecoder::new(&coded, 2, 2);
        for (i, &b) in bits.iter().enumerate() {
            assert_eq!(b, dec.decode(i & 1));
        }
    }
}
