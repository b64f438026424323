//! Host facts read from the local system

use std::fs;

const HOSTNAME_FILES: [&str; 2] = ["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Best-effort host name; falls back to `localhost`
pub fn hostname() -> String {
    HOSTNAME_FILES
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Total memory and swap, in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_memory: u64,
    pub total_swap: u64,
}

/// Parse `/proc/meminfo` content
///
/// Values there are in KiB. Returns `None` unless both `MemTotal` and
/// `SwapTotal` are present.
pub fn parse_meminfo(text: &str) -> Option<MemoryInfo> {
    let mut total_memory = None;
    let mut total_swap = None;

    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "MemTotal" => &mut total_memory,
            "SwapTotal" => &mut total_swap,
            _ => continue,
        };
        *slot = rest
            .split_whitespace()
            .next()
            .and_then(|kib| kib.parse::<u64>().ok())
            .map(|kib| kib / 1024);
    }

    Some(MemoryInfo {
        total_memory: total_memory?,
        total_swap: total_swap?,
    })
}
