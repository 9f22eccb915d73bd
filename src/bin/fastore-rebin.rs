#[macro_use]
extern crate log;

extern crate clap;
extern crate fastore;

use clap::{App, Arg};
use log::LevelFilter;

use fastore::params::RebinParams;
use fastore::rebin_module;
use fastore::util;

fn main() {
    let args = App::new("fastore-rebin")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Bin-grid coarsening tool: raises the signature parity.")
        .arg(Arg::with_name("MODE")
            .help("e = rebin an existing bin file, d = decode bins to FASTQ.")
            .possible_values(&["e", "d"])
            .required(true))
        .arg(Arg::with_name("INPUT")
            .short("i")
            .long("input")
            .help("Input bin file prefix.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT")
            .short("o")
            .long("output")
            .help("Output prefix (encode) or FASTQ file list (decode).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("PARITY")
            .short("p")
            .long("parity")
            .takes_value(true)
            .help("Target signature parity (power of two).")
            .default_value("2"))
        .arg(Arg::with_name("MIN_TREE_SIZE")
            .short("q")
            .long("min-tree-size")
            .takes_value(true)
            .help("Trees at most this big are dissolved into single reads.")
            .default_value("4"))
        .arg(Arg::with_name("ENCODE_THRESHOLD")
            .short("e")
            .long("encode-threshold")
            .takes_value(true)
            .help("LZ encode threshold; 0 selects half the read length.")
            .default_value("0"))
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
        .arg(Arg::with_name("LZ_WINDOW")
            .short("w")
            .long("lz-window")
            .takes_value(true)
            .help("Number of recent reads scanned for LZ candidates.")
            .default_value("255"))
        .arg(Arg::with_name("KEEP_ROOT")
            .short("r")
            .long("keep-root")
            .help("Keep the current tree root instead of picking an \
                   extreme-signature-position read."))
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

    let mut params = RebinParams::default();
    params.signature_parity = args
        .value_of("PARITY")
        .unwrap()
        .parse::<u32>()
        .expect("Invalid parity!");
    if params.signature_parity < 2 || !params.signature_parity.is_power_of_two() {
        error!("Parity must be a power of two greater than one");
        std::process::exit(-1);
    }
    params.min_tree_size = args
        .value_of("MIN_TREE_SIZE")
        .unwrap()
        .parse::<u64>()
        .expect("Invalid minimum tree size!");
    params.select_max_edge_read = !args.is_present("KEEP_ROOT");
    params.classifier.encode_threshold = args
        .value_of("ENCODE_THRESHOLD")
        .unwrap()
        .parse::<i32>()
        .expect("Invalid encode threshold!");
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
    params.classifier.lz_window = args
        .value_of("LZ_WINDOW")
        .unwrap()
        .parse::<usize>()
        .expect("Invalid LZ window!");

    let exit_code = if mode == "e" {
        match rebin_module::rebin_bins(input, &outputs[0], &params, threads) {
            Ok(_) => 0,
            Err(why) => {
                error!("Error while rebinning: {}", why);
                -1
            },
        }
    } else {
        match rebin_module::rebin_to_fastq(input, &outputs, threads) {
            Ok(_) => 0,
            Err(why) => {
                error!("Error while decoding: {}", why);
                -1
            },
        }
    };

    std::process::exit(exit_code);
}
