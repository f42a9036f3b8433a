use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lanbeam")]
#[command(about = "Send files to another machine on the local network", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: <config dir>/lanbeam/config.toml)
    #[arg(long, global = true, env = "LANBEAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device name announced to the receiver
    #[arg(long, global = true)]
    pub name: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send files and directories to a receiver
    Send {
        /// Receiver address, host:port (port defaults to the configured one)
        addr: String,

        /// Files or directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Accept incoming transfers
    Receive {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory to write received items into
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Exit after the first transfer finishes
        #[arg(long)]
        once: bool,
    },
}

impl Cli {
    /// Default log filter for the given verbosity; RUST_LOG overrides it.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "lanbeam=info",
            2 => "lanbeam=debug",
            _ => "lanbeam=trace",
        }
    }
}
