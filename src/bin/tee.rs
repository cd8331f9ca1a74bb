use std::fmt::Display;
use std::fs::OpenOptions;
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use color_eyre::Result;

use dgsh::negotiate::{negotiate, NegotiateFlags, Outcome};
use dgsh::tee::{Config, Engine};
use dgsh::EX_DRAW_EXIT;

/// Buffer data between the negotiated inputs and outputs of a directed
/// graph pipeline: copy one stream to many, gather many into one,
/// scatter records across outputs, or permute streams, without letting
/// a slow consumer block the rest.
#[derive(Parser, Debug)]
#[clap(version, long_about = None)]
struct Args {
    /// Open output files for appending
    #[clap(short = 'a')]
    append: bool,

    /// Buffer size
    #[clap(short = 'b', value_parser = parse_size)]
    buffer_size: Option<u64>,

    /// Overflow buffered data into a temporary file
    #[clap(short = 'f')]
    overflow_file: bool,

    /// Input-side buffering: never block the upstream writer
    #[clap(short = 'I')]
    input_side_buffering: bool,

    /// Gather input from the specified file
    #[clap(short = 'i')]
    input: Vec<PathBuf>,

    /// Maximum buffer memory (with optional k, M or G suffix)
    #[clap(short = 'm', value_parser = parse_size)]
    max_mem: Option<u64>,

    /// Print buffer statistics on termination
    #[clap(short = 'M')]
    memory_stats: bool,

    /// Scatter output to the specified file
    #[clap(short = 'o')]
    output: Vec<PathBuf>,

    /// Permute inputs to the specified outputs, e.g. 2,1
    #[clap(short = 'p')]
    permute: Option<String>,

    /// Scatter the input across the outputs rather than copying it to all
    #[clap(short = 's', conflicts_with = "permute")]
    scatter: bool,

    /// Directory for the temporary overflow file
    #[clap(short = 'T')]
    tmp_dir: Option<PathBuf>,

    /// Record terminator for scatter alignment (newline by default)
    #[clap(short = 't')]
    terminator: Option<String>,
}

/// Parse a size with an optional b/k/M/G suffix.
fn parse_size(opt: &str) -> Result<u64, String> {
    let split = opt
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(opt.len());
    let (digits, suffix) = opt.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size [{opt}]"))?;
    match suffix {
        "" | "b" | "B" => Ok(n),
        "k" | "K" => Ok(n * 1024),
        "m" | "M" => Ok(n * 1024 * 1024),
        "g" | "G" => Ok(n * 1024 * 1024 * 1024),
        other => Err(format!("unknown size suffix: {other}")),
    }
}

/// Parse a comma-separated list of 1-based destination outputs.
fn parse_permute(s: &str) -> Result<Vec<usize>, String> {
    let dest: Vec<i64> = s
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("illegal permutation destination [{s}]"))?;
    let n = dest.len() as i64;
    dest.iter()
        .map(|&d| {
            if d < 1 || d > n {
                Err(format!("illegal permutation destination [{s}]"))
            } else {
                Ok(d as usize - 1)
            }
        })
        .collect()
}

fn die(code: i32, msg: impl Display) -> ! {
    eprintln!("dgsh-tee: {msg}");
    process::exit(code);
}

fn main() -> Result<()> {
    color_eyre::install()?;
    dgsh::init_diagnostics();

    let args = Args::parse();

    let permute = match &args.permute {
        Some(list) => parse_permute(list).unwrap_or_else(|e| die(1, e)),
        None => Vec::new(),
    };
    let record_terminator = match &args.terminator {
        None => b'\n',
        Some(t) if t.len() <= 1 => t.as_bytes().first().copied().unwrap_or(0),
        Some(t) => die(1, format!("record terminator [{t}] is not a single character")),
    };

    let cfg = Config {
        buffer_size: args.buffer_size.unwrap_or(1024 * 1024) as usize,
        max_mem: args.max_mem.unwrap_or(256 * 1024 * 1024),
        scatter: args.scatter,
        permute: permute.clone(),
        use_tmp_file: args.overflow_file,
        tmp_dir: args.tmp_dir.clone(),
        record_terminator,
        input_side_buffering: args.input_side_buffering,
        memory_stats: args.memory_stats,
        block_len: 0,
    };
    if cfg.buffer_size as u64 > cfg.max_mem {
        die(
            1,
            format!(
                "buffer size {} is larger than the maximum memory limit {}",
                cfg.buffer_size, cfg.max_mem
            ),
        );
    }

    // Channel requirements: explicit files replace stdio participation;
    // otherwise any number of negotiated streams is welcome.
    let (name, n_inputs, n_outputs) = if permute.is_empty() {
        let graph_in = std::env::var("DGSH_IN").map_or(false, |v| v != "0");
        let graph_out = std::env::var("DGSH_OUT").map_or(false, |v| v != "0");
        let name = match (graph_in, graph_out) {
            (true, false) => "cat",
            (false, true) => "tee",
            _ => "dgsh-tee",
        };
        let n_in = if args.input.is_empty() { -1 } else { 0 };
        let n_out = if args.output.is_empty() { -1 } else { 0 };
        (name, Some(n_in), Some(n_out))
    } else {
        let n = permute.len() as i32;
        ("perm", Some(n), Some(n))
    };

    log::debug!("calling negotiate with in={n_inputs:?} out={n_outputs:?}");
    let outcome = negotiate(NegotiateFlags::HANDLE_ERROR, name, n_inputs, n_outputs)?;
    let Outcome::Ready {
        input_fds,
        output_fds,
    } = outcome
    else {
        process::exit(EX_DRAW_EXIT);
    };
    log::debug!("negotiated {} inputs, {} outputs", input_fds.len(), output_fds.len());

    if !permute.is_empty() && permute.len() != input_fds.len() {
        die(
            1,
            format!(
                "the number of inputs {} does not match the specified permutation {}",
                input_fds.len(),
                permute.len()
            ),
        );
    }
    if !permute.is_empty() && permute.len() != output_fds.len() {
        die(
            1,
            format!(
                "the number of outputs {} does not match the specified permutation {}",
                output_fds.len(),
                permute.len()
            ),
        );
    }

    let mut engine = Engine::new(cfg);

    for path in &args.output {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(args.append)
            .truncate(!args.append)
            .open(path)
            .unwrap_or_else(|e| die(2, format!("error opening {}: {e}", path.display())));
        engine
            .add_sink(Some(path.display().to_string()), file.into_raw_fd())
            .unwrap_or_else(|e| die(e.exit_code(), e));
    }
    for (j, fd) in output_fds.iter().enumerate() {
        let name = (j == 0).then(|| "standard output".to_string());
        engine
            .add_sink(name, *fd)
            .unwrap_or_else(|e| die(e.exit_code(), e));
    }

    for path in &args.input {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .unwrap_or_else(|e| die(2, format!("error opening {}: {e}", path.display())));
        engine
            .add_source(Some(path.display().to_string()), file.into_raw_fd())
            .unwrap_or_else(|e| die(e.exit_code(), e));
    }
    for (j, fd) in input_fds.iter().enumerate() {
        let name = (j == 0).then(|| "standard input".to_string());
        engine
            .add_source(name, *fd)
            .unwrap_or_else(|e| die(e.exit_code(), e));
    }

    if args.scatter && engine.n_sources() > 1 {
        die(1, "scattering not supported with more than one input");
    }

    match engine.run() {
        Ok(()) => Ok(()),
        Err(e) => die(e.exit_code(), e),
    }
}
