// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Import,
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressMethod {
    None,
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedSize {
    Unknown,
    /// The export helper reports the real size at runtime over `EXP_SIZE_FD`.
    Custom,
    FixedMiB(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error,
    Info,
    Trace,
}

/// Immutable for the whole run. Built once from CLI arguments and handed
/// to every component by reference or by owned clone of the fields it needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub status_path: PathBuf,
    pub connect_timeout: Duration,
    pub expected_size: ExpectedSize,
    pub compress: CompressMethod,
    pub verbosity: Verbosity,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub bind: Option<String>,
    pub family: AddressFamily,
    pub host: Option<String>,
    pub port: Option<String>,
    pub connect_retries: u32,
    pub magic: Option<String>,
    pub cmd_prefix: Option<String>,
    pub cmd_suffix: Option<String>,
    pub exit_failure_code: i32,
}

/// `MAGIC` must look like a ganeti export/import cookie: word characters,
/// dashes and dots only, so it's safe to splice into a shell command line.
const MAGIC_RE: &str = r"^[A-Za-z0-9._-]+$";

impl Config {
    /// Validate cross-field invariants that `clap` itself can't express
    /// (mutually-exclusive families, export-only fields, magic shape).
    pub fn validate(raw: RawArgs) -> Result<Self> {
        if raw.ipv4 && raw.ipv6 {
            return Err(SupervisorError::Config(
                "--ipv4 and --ipv6 are mutually exclusive".into(),
            ));
        }
        let family = if raw.ipv4 {
            AddressFamily::V4
        } else if raw.ipv6 {
            AddressFamily::V6
        } else {
            AddressFamily::Any
        };

        if raw.mode == Mode::Export && raw.host.is_none() {
            return Err(SupervisorError::Config(
                "--host is required in export mode".into(),
            ));
        }

        if let Some(magic) = &raw.magic {
            let re = Regex::new(MAGIC_RE).expect("static regex is valid");
            if !re.is_match(magic) {
                return Err(SupervisorError::Config(format!(
                    "--magic '{magic}' does not match the required pattern {MAGIC_RE}"
                )));
            }
        }

        let expected_size = match raw.expected_size.as_deref() {
            None => ExpectedSize::Unknown,
            Some("custom") => ExpectedSize::Custom,
            Some(n) => {
                let mib: u64 = n.parse().map_err(|_| {
                    SupervisorError::Config(format!(
                        "--expected-size must be 'custom' or an integer MiB count, got '{n}'"
                    ))
                })?;
                ExpectedSize::FixedMiB(mib)
            }
        };

        let compress = match raw.compress.as_deref() {
            None | Some("none") => CompressMethod::None,
            Some(name) => CompressMethod::Named(name.to_string()),
        };

        let verbosity = if raw.debug {
            Verbosity::Trace
        } else if raw.verbose {
            Verbosity::Info
        } else {
            Verbosity::Error
        };

        Ok(Config {
            mode: raw.mode,
            status_path: raw.status_path,
            connect_timeout: Duration::from_secs(raw.connect_timeout),
            expected_size,
            compress,
            verbosity,
            key: raw.key,
            cert: raw.cert,
            ca: raw.ca,
            bind: raw.bind,
            family,
            host: raw.host,
            port: raw.port,
            connect_retries: raw.connect_retries,
            magic: raw.magic,
            cmd_prefix: raw.cmd_prefix,
            cmd_suffix: raw.cmd_suffix,
            exit_failure_code: 1,
        })
    }
}

/// The raw, unvalidated shape parsed directly off argv by `clap`. Kept
/// separate from [`Config`] so [`Config::validate`] has a single seam to
/// enforce invariants `clap`'s declarative validators can't express.
#[derive(Debug, Clone)]
pub struct RawArgs {
    pub status_path: PathBuf,
    pub mode: Mode,
    pub debug: bool,
    pub verbose: bool,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub bind: Option<String>,
    pub ipv4: bool,
    pub ipv6: bool,
    pub host: Option<String>,
    pub port: Option<String>,
    pub connect_retries: u32,
    pub connect_timeout: u64,
    pub compress: Option<String>,
    pub expected_size: Option<String>,
    pub magic: Option<String>,
    pub cmd_prefix: Option<String>,
    pub cmd_suffix: Option<String>,
}
