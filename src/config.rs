use crate::debugger::{DEFAULT_DEAD_INTERVAL, DEFAULT_LOOKAHEAD, DEFAULT_PING_INTERVAL};
use crate::engine::DEFAULT_GAS_LIMIT;
use crate::error::{DebugError, Result};
use crate::program::{parse_hex, ProgramSource};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command line.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Step through EVM bytecode one instruction at a time")]
pub struct Args {
    /// TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Hex file holding the program.
    #[arg(long, conflicts_with = "samples")]
    pub program: Option<PathBuf>,

    /// Directory of compiled `*.hex` samples.
    #[arg(long)]
    pub samples: Option<PathBuf>,

    /// Sample name (file stem) to pick from `--samples`.
    #[arg(long, requires = "samples")]
    pub sample: Option<String>,

    /// Input payload (call data) as hex.
    #[arg(long)]
    pub payload: Option<String>,

    /// Code section to debug first.
    #[arg(long)]
    pub section: Option<usize>,

    /// Serve the request boundary on stdin/stdout.
    #[arg(long, alias = "debug-adapter")]
    pub dap: bool,

    /// Append diagnostics to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub ping_interval_ms: u64,
    pub dead_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: DEFAULT_PING_INTERVAL.as_millis() as u64,
            dead_interval_ms: DEFAULT_DEAD_INTERVAL.as_millis() as u64,
        }
    }
}

impl LivenessConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn dead_interval(&self) -> Duration {
        Duration::from_millis(self.dead_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DebuggerConfig {
    pub program: ProgramSource,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub section: usize,
    #[serde(default = "default_lookahead")]
    pub lookahead_depth: usize,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub liveness: LivenessConfig,
}

fn default_lookahead() -> usize {
    DEFAULT_LOOKAHEAD
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

impl DebuggerConfig {
    pub fn new(program: ProgramSource) -> Self {
        Self {
            program,
            payload: String::new(),
            section: 0,
            lookahead_depth: DEFAULT_LOOKAHEAD,
            gas_limit: DEFAULT_GAS_LIMIT,
            log_file: None,
            liveness: LivenessConfig::default(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DebugError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// File values first, then command line overrides.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Some(Self::load(path)?),
            None => None,
        };

        let source = if let Some(path) = &args.program {
            Some(ProgramSource::File { path: path.clone() })
        } else {
            args.samples.as_ref().map(|dir| ProgramSource::Directory {
                path: dir.clone(),
                sample: args.sample.clone(),
            })
        };

        if let Some(source) = source {
            match config.as_mut() {
                Some(c) => c.program = source,
                None => config = Some(Self::new(source)),
            }
        }

        let mut config = config.ok_or_else(|| {
            DebugError::Config("no program given (use --config, --program or --samples)".into())
        })?;

        if let Some(payload) = &args.payload {
            config.payload = payload.clone();
        }
        if let Some(section) = args.section {
            config.section = section;
        }
        if args.log_file.is_some() {
            config.log_file = args.log_file.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.payload_bytes()?;
        if self.liveness.dead_interval_ms < self.liveness.ping_interval_ms {
            return Err(DebugError::Config(
                "liveness.dead_interval_ms must not be shorter than ping_interval_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        parse_hex(&self.payload)
    }
}
