// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

use std::path::PathBuf;

use clap::{crate_version, Parser, ValueEnum};

use crate::config::{Config, Mode, RawArgs};
use crate::error::Result;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ModeArg {
    Import,
    Export,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Import => Mode::Import,
            ModeArg::Export => Mode::Export,
        }
    }
}

/// Supervise a block-device copier/compressor/relay pipeline for instance
/// export or import, reporting progress into a status file.
#[derive(Debug, Parser)]
#[command(name = "impexpd", version = crate_version!(), about)]
pub struct Cli {
    /// Path of the status file this run writes progress into.
    pub status_file: PathBuf,

    /// Which side of the transfer this invocation performs.
    #[arg(value_enum)]
    pub mode: ModeArg,

    /// Verbose (INFO) logging.
    #[arg(long)]
    pub verbose: bool,

    /// Debug (TRACE) logging. Takes precedence over --verbose.
    #[arg(long)]
    pub debug: bool,

    /// TLS private key path, forwarded to the relay helper opaquely.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// TLS certificate path, forwarded to the relay helper opaquely.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS CA bundle path, forwarded to the relay helper opaquely.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Local address to bind the relay's listening/connecting socket to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Restrict the relay to IPv4.
    #[arg(long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Restrict the relay to IPv6.
    #[arg(long, conflicts_with = "ipv4")]
    pub ipv6: bool,

    /// Remote host to connect to (export mode only).
    #[arg(long)]
    pub host: Option<String>,

    /// Remote port or service name to connect to (export mode only).
    #[arg(long)]
    pub port: Option<String>,

    /// Number of times the export side retries the initial connection.
    #[arg(long, default_value_t = 0)]
    pub connect_retries: u32,

    /// Seconds to wait for the import side to observe a connection before
    /// sending SIGTERM to the pipeline. 0 disables the deadline.
    #[arg(long, default_value_t = 60)]
    pub connect_timeout: u64,

    /// Compression method name, or "none" to disable compression.
    #[arg(long)]
    pub compress: Option<String>,

    /// Expected transfer size in MiB, or the literal "custom" if the export
    /// helper reports the real size at runtime.
    #[arg(long)]
    pub expected_size: Option<String>,

    /// Opaque cookie forwarded to the helpers, must match `^[A-Za-z0-9._-]+$`.
    #[arg(long)]
    pub magic: Option<String>,

    /// Shell fragment spliced in before the copier pipeline.
    #[arg(long)]
    pub cmd_prefix: Option<String>,

    /// Shell fragment spliced in after the copier pipeline.
    #[arg(long)]
    pub cmd_suffix: Option<String>,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let raw = RawArgs {
            status_path: self.status_file,
            mode: self.mode.into(),
            debug: self.debug,
            verbose: self.verbose,
            key: self.key,
            cert: self.cert,
            ca: self.ca,
            bind: self.bind,
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            host: self.host,
            port: self.port,
            connect_retries: self.connect_retries,
            connect_timeout: self.connect_timeout,
            compress: self.compress,
            expected_size: self.expected_size,
            magic: self.magic,
            cmd_prefix: self.cmd_prefix,
            cmd_suffix: self.cmd_suffix,
        };
        Config::validate(raw)
    }
}
