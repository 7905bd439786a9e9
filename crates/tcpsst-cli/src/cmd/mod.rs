use clap::{Args, Subcommand, ValueEnum};
use tcpsst::Reliability;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept sessions and print received frames.
    Listen(ListenArgs),
    /// Connect, send a payload on one stream, optionally await a reply.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ReliabilityArg {
    Ordered,
    Unordered,
    Unreliable,
}

impl From<ReliabilityArg> for Reliability {
    fn from(arg: ReliabilityArg) -> Self {
        match arg {
            ReliabilityArg::Ordered => Reliability::ReliableOrdered,
            ReliabilityArg::Unordered => Reliability::ReliableUnordered,
            ReliabilityArg::Unreliable => Reliability::Unreliable,
        }
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind, e.g. 127.0.0.1:7077.
    pub addr: String,
    /// Exit after printing N frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Echo each frame back on the stream it arrived on.
    #[arg(long)]
    pub echo: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to connect to, e.g. 127.0.0.1:7077.
    pub addr: String,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<std::path::PathBuf>,
    /// Delivery guarantees for the send.
    #[arg(long, value_enum, default_value = "ordered")]
    pub reliability: ReliabilityArg,
    /// Multiplex width for the session.
    #[arg(long, default_value_t = tcpsst::DEFAULT_WIDTH)]
    pub width: u8,
    /// Wait for one response frame and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum seconds to wait for connect (and response with --wait).
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}
