use clap::Parser;
use color_eyre::Result;
use std::process;

use dgsh::conc::Concentrator;
use dgsh::graph::State;
use dgsh::negotiate::{arm_negotiation_timeout, disarm_negotiation_timeout};
use dgsh::{EX_DRAW_EXIT, EX_PROTOCOL};

/// Relay negotiation blocks around a multi-way junction of a directed
/// graph pipeline, then pass the negotiated descriptors across it.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Input concentrator: multiple inputs to a single output
    #[clap(short = 'i', conflicts_with = "output")]
    input: bool,

    /// Output concentrator: single input to multiple outputs
    #[clap(short = 'o')]
    output: bool,

    /// Do not consider standard input (used with -o)
    #[clap(short = 'n', requires = "output")]
    no_input: bool,

    /// Number of peer processes on the multi-descriptor side
    nprog: usize,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    dgsh::init_diagnostics();

    let args = Args::parse();
    if args.nprog == 0 {
        eprintln!("dgsh-conc: at least one peer process is required");
        process::exit(1);
    }

    arm_negotiation_timeout()?;
    let conc = Concentrator::new(args.input, args.no_input, args.nprog);
    let code = match conc.run() {
        Ok(State::Complete) => 0,
        Ok(State::DrawExit) => EX_DRAW_EXIT,
        Ok(state) => {
            log::error!("negotiation ended in state {}", state.name());
            EX_PROTOCOL
        }
        Err(err) => {
            eprintln!("dgsh-conc: {err:#}");
            EX_PROTOCOL
        }
    };
    disarm_negotiation_timeout();
    process::exit(code);
}
