#[macro_use]
extern crate log;

extern crate clap;
extern crate fastore;

use clap::{App, Arg};
use log::LevelFilter;

use fastore::bin_module;
use fastore::params::{BinModuleConfig, QualityMethod};
use fastore::util;

fn main() {
    let args = App::new("fastore-bin")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("FASTQ reads binning tool.")
        .arg(Arg::with_name("MODE")
            .help("e = encode FASTQ into bins, d = decode bins back to FASTQ.")
            .possible_values(&["e", "d"])
            .required(true))
        .arg(Arg::with_name("INPUT")
            .short("i")
            .long("input")
            .help("Input files (encode: FASTQ files; decode: bin file prefix).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT")
            .short("o")
            .long("output")
            .help("Output prefix (encode) or FASTQ file list (decode).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("SIGNATURE_LEN")
            .short("p")
            .long("signature-length")
            .takes_value(true)
            .help("Signature length.")
            .default_value("8"))
        .arg(Arg::with_name("SKIP_ZONE")
            .short("s")
            .long("skip-zone")
            .takes_value(true)
            .help("Skip-zone length at the read end.")
            .default_value("0"))
        .arg(Arg::with_name("MIN_BIN_SIZE")
            .short("m")
            .long("min-bin-size")
            .takes_value(true)
            .help("Minimum per-batch bin size; smaller bins are deferred.")
            .default_value("8"))
        .arg(Arg::with_name("BLOCK_MB")
            .short("b")
            .long("block-size")
            .takes_value(true)
            .help("FASTQ input buffer size in MB.")
            .default_value("256"))
        .arg(Arg::with_name("THREADS")
            .short("t")
            .long("threads")
            .takes_value(true)
            .help("Number of worker threads to spawn.")
            .default_value("4"))
        .arg(Arg::with_name("PAIRED")
            .short("z")
            .long("paired-end")
            .help("Paired-end mode; -i takes both file sets, first half /1."))
        .arg(Arg::with_name("GZIPPED")
            .short("g")
            .long("gzip-input")
            .help("Input is gzip-compressed (also auto-detected)."))
        .arg(Arg::with_name("KEEP_HEADERS")
            .short("H")
            .long("keep-headers")
            .help("Preserve read identifiers in the archive."))
        .arg(Arg::with_name("SKIP_COMMENTS")
            .short("C")
            .long("skip-comments")
            .help("Drop identifier content after the first space."))
        .arg(Arg::with_name("QUALITY")
            .short("q")
            .long("quality")
            .takes_value(true)
            .help("Quality method: 0 lossless, 1 binary, 2 Illumina-8, 3 QVZ.")
            .default_value("0"))
        .arg(Arg::with_name("BINARY_THRESHOLD")
            .short("w")
            .long("binary-threshold")
            .takes_value(true)
            .help("Quality threshold for -q1.")
            .default_value("20"))
        .arg(Arg::with_name("PHRED64")
            .short("I")
            .long("phred64")
            .help("Use the Phred+64 quality scale instead of Phred+33."))
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
    let inputs: Vec<String> = args
        .value_of("INPUT")
        .unwrap()
        .split_whitespace()
        .map(String::from)
        .collect();
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

    let mut config = BinModuleConfig::default();
    config.minimizer.signature_len = args
        .value_of("SIGNATURE_LEN")
        .unwrap()
        .parse::<u8>()
        .expect("Invalid signature length!");
    config.minimizer.skip_zone_len = args
        .value_of("SKIP_ZONE")
        .unwrap()
        .parse::<u8>()
        .expect("Invalid skip-zone length!");
    config.categorizer.min_bin_size = args
        .value_of("MIN_BIN_SIZE")
        .unwrap()
        .parse::<u32>()
        .expect("Invalid minimum bin size!");
    config.fastq_block_size = args
        .value_of("BLOCK_MB")
        .unwrap()
        .parse::<u64>()
        .expect("Invalid block size!")
        << 20;
    config.archive_type.paired_end = args.is_present("PAIRED");
    config.archive_type.has_headers = args.is_present("KEEP_HEADERS");
    config.archive_type.quality_offset =
        if args.is_present("PHRED64") { 64 } else { 33 };
    config.headers.preserve_comments = !args.is_present("SKIP_COMMENTS");

    let quality = args
        .value_of("QUALITY")
        .unwrap()
        .parse::<u32>()
        .expect("Invalid quality method!");
    config.quality.method = match QualityMethod::from_cli(quality) {
        Some(m) => m,
        None => {
            error!("Quality method must be 0..3");
            std::process::exit(-1);
        },
    };
    config.quality.binary_threshold = args
        .value_of("BINARY_THRESHOLD")
        .unwrap()
        .parse::<u8>()
        .expect("Invalid binary threshold!");

    let exit_code = if mode == "e" {
        let (inputs_1, inputs_2) = if config.archive_type.paired_end {
            if inputs.len() % 2 != 0 {
                error!("Paired-end mode needs an even number of input files");
                std::process::exit(-1);
            }
            let half = inputs.len() / 2;
            (inputs[..half].to_vec(), inputs[half..].to_vec())
        } else {
            (inputs.clone(), Vec::new())
        };

        match bin_module::fastq_to_bin(inputs_1, inputs_2, &outputs[0], &config, threads)
        {
            Ok(_) => 0,
            Err(why) => {
                error!("Error while binning: {}", why);
                -1
            },
        }
    } else {
        match bin_module::bin_to_fastq(&inputs[0], &outputs, threads) {
            Ok(_) => 0,
            Err(why) => {
                error!("Error while decoding: {}", why);
                -1
            },
        }
    };

    std::process::exit(exit_code);
}
