//! FaStore: a multi-stage compressor for FASTQ short-read sequencing data.
//!
//! The pipeline runs in up to three stages, each with its own executable:
//!
//! * `fastore-bin` -- distributes reads into signature bins and writes the
//!   intermediate bin files (`.bmeta`/`.bdna`/`.bqua`/`.bhead`),
//! * `fastore-rebin` -- optionally coarsens the bin grid by raising the
//!   signature parity, carrying match-tree linkage across bin boundaries,
//! * `fastore-pack` -- builds per-bin match trees and consensus contigs and
//!   entropy-codes everything into the final archive (`.cmeta`/`.cdata`).

#[macro_use]
extern crate log;

pub mod archive;
pub mod bin_block;
pub mod bin_file;
pub mod bin_module;
pub mod bitio;
pub mod categorizer;
pub mod classifier;
pub mod compressor;
pub mod contig;
pub mod error;
pub mod fastq_io;
pub mod graph;
pub mod headers;
pub mod pack_module;
pub mod packer;
pub mod params;
pub mod pipeline;
pub mod quality;
pub mod rc;
pub mod rebin;
pub mod rebin_module;
pub mod records;
pub mod rle;
pub mod util;
