//! Command-line surface. Simplified from the teacher's `cmd/ethrex/cli.rs`
//! `Options`/`CLI` split: a vat kernel demo has no network/datadir/syncmode
//! concerns, just a log level and which bundled scenario to run.

use clap::Parser as ClapParser;
use tracing::Level;

#[derive(ClapParser, Debug, Clone)]
#[command(name = "vatkernel", author, version, about = "Object-capability kernel host")]
pub struct Options {
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        help = "Minimum tracing level to emit.",
        default_value = "info",
        env = "VATKERNEL_LOG_LEVEL"
    )]
    pub log_level: Level,

    #[arg(
        long = "demo",
        help = "Launch the bundled two-vat echo demo and run it to quiescence.",
        long_help = "Launches an 'alice' and a 'bob' vat backed by the in-process EchoVatWorker, \
sends one message from the kernel to bob's root, drives the crank loop to quiescence, \
and prints the resulting promise and vat records.",
        action = clap::ArgAction::SetTrue
    )]
    pub demo: bool,
}
