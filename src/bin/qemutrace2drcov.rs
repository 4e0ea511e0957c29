use clap::Parser;
use qemutrace2drcov::Config;
use std::path::PathBuf;
use std::process;

/// Convert a qemu `exec_tb` trace into a drcov coverage log.
///
/// Set `RUST_LOG=debug` to see every block boundary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Module path written into the module table
    base_module: String,

    /// Path to the qemu trace
    infile: PathBuf,

    /// Path of the drcov log to write
    outfile: PathBuf,

    /// Address distance between two contiguous exec_tb records
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    step: u64,

    /// Base address of the module (hex)
    #[arg(long, value_parser = parse_hex, default_value = "0x100")]
    module_base: u64,

    /// End address of the module (hex)
    #[arg(long, value_parser = parse_hex, default_value = "0xffffff")]
    module_end: u64,

    /// Do not print the summary
    #[arg(short, long)]
    quiet: bool,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex address '{s}': {e}"))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(1);
        }
        Err(e) => e.exit(),
    };

    let config = Config::default()
        .step(args.step)
        .module_range(args.module_base, args.module_end);

    let trace = match qemutrace2drcov::translate_file(
        &args.base_module,
        &args.infile,
        &args.outfile,
        &config,
    ) {
        Ok(trace) => trace,
        Err(e) => {
            eprintln!(
                "Error: Failed to convert trace '{}': {}",
                args.infile.display(),
                e
            );
            process::exit(1);
        }
    };

    if args.quiet {
        return;
    }

    println!("=== Conversion Summary ===");
    println!("Trace: {}", args.infile.display());
    println!("Output: {}", args.outfile.display());
    println!("Thread: {}", trace.thread);
    println!("Records: {}", trace.records);
    println!("Ignored Records: {}", trace.ignored_records());
    println!("Basic Blocks: {}", trace.blocks.len());
    println!("Covered Bytes: {}", trace.covered_bytes());
}
