//! Runtime settings, read from `SAFEHEAP_*` environment variables.
//!
//! The environment is read once, while the runtime initializes, so any
//! allocation done here is served by the bootstrap heap.

use std::ffi::OsString;

use log::LevelFilter;

use crate::{
    error::{Error, Result},
    os::pkey::Isolation,
};

pub const HEAP_SIZE: usize = 4 << 30;
pub const HEAP_HINT: usize = 0x3000_0000_0000;
pub const META_SIZE: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bytes reserved for the safe heap
    pub heap_size: usize,
    /// Where we would like the safe heap mapped, `0` lets the kernel pick
    pub heap_hint: usize,
    /// Bytes reserved for the registry and worklist
    pub meta_size: usize,
    pub isolation: Isolation,
    /// Run a collection on every n-th free request
    pub sweep_every: u64,
    /// Unreached sweeps a freed object sits through before it is reclaimed
    pub unreachable_threshold: u8,
    /// Treat the writable segments of loaded modules as roots
    pub scan_globals: bool,
    /// Leave the module holding the runtime itself out of the roots
    pub skip_own_module: bool,
    pub log: LevelFilter,
    /// Dump the registry to stderr at process exit
    pub dump_on_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heap_size: HEAP_SIZE,
            heap_hint: HEAP_HINT,
            meta_size: META_SIZE,
            isolation: Isolation::Hardware,
            sweep_every: 1,
            unreachable_threshold: 1,
            scan_globals: true,
            skip_own_module: true,
            log: LevelFilter::Warn,
            dump_on_exit: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars_os())
    }

    /// Build a config from `(name, value)` pairs. Unknown names are ignored,
    /// unset ones keep their default.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut config = Config::default();
        for (key, value) in vars {
            let (key, value) = (key.into(), value.into());
            let Some(key) = key.to_str() else { continue };
            let Some(var) = key.strip_prefix("SAFEHEAP_") else {
                continue;
            };
            config.set(var, &value)?;
        }
        Ok(config)
    }

    fn set(&mut self, var: &str, value: &OsString) -> Result<()> {
        let value = value.to_string_lossy();
        let value = value.trim();
        match var {
            "HEAP_SIZE" => self.heap_size = parse(value, "SAFEHEAP_HEAP_SIZE", parse_size)?,
            "HEAP_HINT" => self.heap_hint = parse(value, "SAFEHEAP_HEAP_HINT", parse_addr)?,
            "META_SIZE" => self.meta_size = parse(value, "SAFEHEAP_META_SIZE", parse_size)?,
            "ISOLATION" => self.isolation = parse(value, "SAFEHEAP_ISOLATION", parse_isolation)?,
            "SWEEP_EVERY" => {
                self.sweep_every = parse(value, "SAFEHEAP_SWEEP_EVERY", |v| {
                    v.parse().ok().filter(|&n| n > 0)
                })?
            }
            "UNREACHABLE_THRESHOLD" => {
                self.unreachable_threshold =
                    parse(value, "SAFEHEAP_UNREACHABLE_THRESHOLD", |v| v.parse().ok())?
            }
            "SCAN_GLOBALS" => {
                self.scan_globals = parse(value, "SAFEHEAP_SCAN_GLOBALS", parse_bool)?
            }
            "SKIP_OWN_MODULE" => {
                self.skip_own_module = parse(value, "SAFEHEAP_SKIP_OWN_MODULE", parse_bool)?
            }
            "LOG" => self.log = parse(value, "SAFEHEAP_LOG", |v| v.parse().ok())?,
            "DUMP_ON_EXIT" => {
                self.dump_on_exit = parse(value, "SAFEHEAP_DUMP_ON_EXIT", parse_bool)?
            }
            _ => log::debug!("[config] ignoring unknown variable SAFEHEAP_{var}"),
        }
        Ok(())
    }
}

fn parse<T>(value: &str, var: &'static str, f: impl FnOnce(&str) -> Option<T>) -> Result<T> {
    f(value).ok_or_else(|| Error::Config {
        var,
        value: value.to_owned(),
    })
}

/// `4096`, `64k`, `512M`, `4g`. Zero is not a size.
fn parse_size(value: &str) -> Option<usize> {
    let (digits, shift) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 10),
        b'm' | b'M' => (&value[..value.len() - 1], 20),
        b'g' | b'G' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let n: usize = digits.parse().ok()?;
    n.checked_mul(1 << shift).filter(|&n| n > 0)
}

fn parse_addr(value: &str) -> Option<usize> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_isolation(value: &str) -> Option<Isolation> {
    match value.to_ascii_lowercase().as_str() {
        "hardware" | "hw" => Some(Isolation::Hardware),
        "emulated" | "emu" => Some(Isolation::Emulated),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
