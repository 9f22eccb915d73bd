#[macro_use]
extern crate log;

extern crate clap;
extern crate fastore;

use clap::{App, Arg};
use log::LevelFilter;

use fastore::pack_module;
use fastore::params::CompressorParams;
use fastore::util;

fn main() {
    let args = App::new("fastore-pack")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Bin compression tool: builds the final archive.")
        .arg(Arg::with_name("MODE")
            .help("e = compress bins into an archive, d = decompress to FASTQ.")
            .possible_values(&["e", "d"])
            .required(true))
        .arg(Arg::with_name("INPUT")
            .short("i")
            .long("input")
            .help("Input prefix (encode: bin files; decode: archive).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT")
            .short("o")
            .long("output")
            .help("Output prefix (encode) or FASTQ file list (decode).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("MIN_BIN_SIZE")
            .short("f")
            .long("min-bin-size")
            .takes_value(true)
            .help("Bins with fewer records go through the raw store.")
            .default_value("256"))
        .arg(Arg::with_name("REDUCE_HARD")
            .short("e")
            .long("reduce-hard-reads")
            .help("Consult the prefix buffer before emitting a hard read."))
        .arg(Arg::with_name("REDUCE_EXPENSIVE")
            .short("E")
            .long("reduce-expensive-matches")
            .help("Consult the prefix buffer for expensive LZ matches too."))
        .arg(Arg::with_name("LZ_WINDOW")
            .short("w")
            .long("lz-window")
            .takes_value(true)
            .help("LZ candidate window (single-end).")
            .default_value("255"))
        .arg(Arg::with_name("PAIR_LZ_WINDOW")
            .short("W")
            .long("pair-lz-window")
            .takes_value(true)
            .help("LZ candidate window for second mates.")
            .default_value("4096"))
        .arg(Arg::with_name("MISMATCH_COST")
            .short("m")
            .long("mismatch-cost")
            .takes_value(true)
            .help("Cost of one mismatch in the match metric.")
            .default_value("2"))
        .arg(Arg::with_name("SHIFT_COST")
            .short("s")
            .long("shift-cost")
            .takes_value(true)
            .help("Cost of one shifted position in the match metric.")
            .default_value("1"))
        .arg(Arg::with_name("ENCODE_THRESHOLD")
            .short("T")
            .long("encode-threshold")
            .takes_value(true)
            .help("LZ encode threshold; 0 selects half the read length.")
            .default_value("0"))
        .arg(Arg::with_name("MIN_CONSENSUS")
            .short("c")
            .long("min-consensus-size")
            .takes_value(true)
            .help("Minimum number of reads in a consensus contig.")
            .default_value("10"))
        .arg(Arg::with_name("DRY_RUN")
            .short("d")
            .long("dry-run")
            .help("Emit the reconstructed (lossy) FASTQ instead of an archive."))
        .arg(Arg::with_name("PAIRED")
            .short("z")
            .long("paired-end")
            .help("Paired-end archive."))
        .arg(Arg::with_name("THREADS")
            .short("t")
            .long("threads")
            .takes_value(true)
            .help("Number of worker threads to spawn.")
            .default_value("4"))
        .arg(Arg::with_name("VERBOSE")
            .short("v")
            .help("Include this flag to trigger debug-level logging."))
        .get_matches();

    util::init_logging(if args.is_present("VERBOSE") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let mode = args.value_of("MODE").unwrap();
    let input = args.value_of("INPUT").unwrap();
    let outputs: Vec<String> = args
        .value_of("OUTPUT")
        .unwrap()
        .split_whitespace()
        .map(String::from)
        .collect();
    let threads = args
        .value_of("THREADS")
        .unwrap()
        .parse::<usize>()
        .expect("Invalid number entered for number of threads!");

    let mut params = CompressorParams::default();
    params.min_bin_size = args
        .value_of("MIN_BIN_SIZE")
        .unwrap()
        .parse::<u64>()
        .expect("Invalid minimum bin size!");
    params.classifier.extra_reduce_hard_reads = args.is_present("REDUCE_HARD");
    params.classifier.extra_reduce_expensive_lz = args.is_present("REDUCE_EXPENSIVE");
    params.classifier.lz_window = args
        .value_of("LZ_WINDOW")
        .unwrap()
        .parse::<usize>()
        .expect("Invalid LZ window!");
    params.classifier.pair_lz_window = args
        .value_of("PAIR_LZ_WINDOW")
        .unwrap()
        .parse::<usize>()
        .expect("Invalid pair LZ window!");
    params.classifier.mismatch_cost = args
        .value_of("MISMATCH_COST")
        .unwrap()
        .parse::<i32>()
        .expect("Invalid mismatch cost!");
    params.classifier.shift_cost = args
        .value_of("SHIFT_COST")
        .unwrap()
        .parse::<i32>()
        .expect("Invalid shift cost!");
    params.classifier.encode_threshold = args
        .value_of("ENCODE_THRESHOLD")
        .unwrap()
        .parse::<i32>()
        .expect("Invalid encode threshold!");
    params.contig.min_consensus_size = args
        .value_of("MIN_CONSENSUS")
        .unwrap()
        .parse::<usize>()
        .expect("Invalid minimum consensus size!");

    let exit_code = if mode == "e" {
        let result = if args.is_present("DRY_RUN") {
            pack_module::pack_dry_run(input, &outputs, &params, threads)
        } else {
            pack_module::pack_bins(input, &outputs[0], &params, threads)
        };
        match result {
            Ok(_) => 0,
            Err(why) => {
                error!("Error while packing: {}", why);
                -1
            },
        }
    } else {
        match pack_module::unpack_archive(input, &outputs, threads) {
            Ok(_) => 0,
            Err(why) => {
                error!("Error while unpacking: {}", why);
                -1
            },
        }
    };

    std::process::exit(exit_code);
}
