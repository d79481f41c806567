use std::{path::Path, time::Duration};

use anyhow::{Result, bail};
use config::{Config, ConfigError, Environment, File};
use fntrace_common::{DEFAULT_RINGBUF_BYTES, ringbuf_record_size};
use serde::Deserialize;

use crate::probes::POLL_INTERVAL_MS;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_RETENTION_SECS: u64 = 300;
const MIN_PAGE_SIZE: u32 = 4096;

/// Which function to instrument
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TargetSettings {
    /// ELF file holding the function. Resolved from `pid` when absent.
    pub binary: Option<String>,
    /// Raw symbol or demangled Rust path without the hash suffix.
    pub function: Option<String>,
    /// Restrict the probes to one process.
    pub pid: Option<u32>,
}

/// Kernel-to-user event transport
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TransportSettings {
    pub ringbuf_bytes: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct CorrelationSettings {
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    /// Collector address; metrics export stays off when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub correlation: CorrelationSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Layers an optional config file under the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Applies command-line flags on top of file and environment values.
    pub fn apply_overrides(
        &mut self,
        binary: Option<String>,
        function: Option<String>,
        pid: Option<u32>,
        ringbuf_bytes: Option<u32>,
    ) {
        if binary.is_some() {
            self.target.binary = binary;
        }
        if function.is_some() {
            self.target.function = function;
        }
        if pid.is_some() {
            self.target.pid = pid;
        }
        if ringbuf_bytes.is_some() {
            self.transport.ringbuf_bytes = ringbuf_bytes;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.target.function.as_deref() {
            Some(f) if !f.trim().is_empty() => {}
            _ => bail!("No target function given (--function or TARGET__FUNCTION)"),
        }

        if self.target.binary.is_none() && self.target.pid.is_none() {
            bail!("Either a target binary (--binary) or a process id (--pid) is required");
        }

        let bytes = self.ringbuf_bytes();
        let page = page_size();
        if !bytes.is_power_of_two() || bytes % page != 0 {
            bail!(
                "Ring buffer size {} must be a power of two and a multiple of the page size ({})",
                bytes,
                page
            );
        }
        if (bytes as usize) < ringbuf_record_size() {
            bail!("Ring buffer size {} cannot hold a single event", bytes);
        }

        if self.channel_capacity() == 0 {
            bail!("transport.channel_capacity must be greater than zero");
        }

        Ok(())
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        self.otel_exporter_otlp_endpoint.as_deref()
    }

    pub fn ringbuf_bytes(&self) -> u32 {
        self.transport.ringbuf_bytes.unwrap_or(DEFAULT_RINGBUF_BYTES)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.transport.poll_interval_ms.unwrap_or(POLL_INTERVAL_MS))
    }

    pub fn channel_capacity(&self) -> usize {
        self.transport
            .channel_capacity
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(
            self.correlation
                .retention_secs
                .unwrap_or(DEFAULT_RETENTION_SECS),
        )
    }
}

fn page_size() -> u32 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        MIN_PAGE_SIZE
    } else {
        (size as u32).max(MIN_PAGE_SIZE)
    }
}
