//! Debug logging utilities for microkvm.
//!
//! Set the `MICROKVM_DEBUG` environment variable to enable verbose logging:
//! - `MICROKVM_DEBUG=1` - Enable all debug output
//! - `MICROKVM_DEBUG=ioport` - Enable only port-I/O logs
//! - `MICROKVM_DEBUG=mmio` - Enable only MMIO logs
//! - `MICROKVM_DEBUG=ioport,runtime` - Enable multiple categories
//!
//! The `--ioport-debug` command-line flag forces the `ioport` category on
//! regardless of the environment.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Ioport,
    Mmio,
    Runtime,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    ioport: bool,
    mmio: bool,
    runtime: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        match std::env::var("MICROKVM_DEBUG") {
            Ok(val) if val == "1" || val.to_lowercase() == "all" => Self {
                ioport: true,
                mmio: true,
                runtime: true,
            },
            Ok(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    ioport: val_lower.contains("ioport"),
                    mmio: val_lower.contains("mmio"),
                    runtime: val_lower.contains("runtime"),
                }
            }
            Err(_) => Self::default(),
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    let config = get_config();
    match category {
        DebugCategory::Ioport => config.ioport,
        DebugCategory::Mmio => config.mmio,
        DebugCategory::Runtime => config.runtime,
    }
}

/// Debug print macro for port-I/O logs; the first argument forces the
/// category on (wired to `--ioport-debug`).
#[macro_export]
macro_rules! debug_ioport {
    ($force:expr, $($arg:tt)*) => {
        if $force || $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Ioport) {
            eprintln!($($arg)*);
        }
    };
}

/// Debug print macro for MMIO logs
#[macro_export]
macro_rules! debug_mmio {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Mmio) {
            eprintln!($($arg)*);
        }
    };
}

/// Debug print macro for run-loop logs
#[macro_export]
macro_rules! debug_runtime {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Runtime) {
            eprintln!($($arg)*);
        }
    };
}
