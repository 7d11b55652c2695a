//! Parsing of the engine's `stats --no-stream` output
//!
//! The format string used is `{{.MemUsage}}|{{.CPUPerc}}`, which yields lines
//! such as `312.5MiB / 3.84GiB|1.27%`. Anything unexpected parses to `None`.

use crate::adapter::EnvironmentStats;

pub const STATS_FORMAT: &str = "{{.MemUsage}}|{{.CPUPerc}}";

/// Parse one stats line into normalized units
pub fn parse_stats_line(line: &str) -> Option<EnvironmentStats> {
    let (mem, cpu) = line.trim().split_once('|')?;
    let used = mem.split('/').next()?.trim();
    Some(EnvironmentStats {
        memory_mb: parse_memory_mb(used)?,
        cpu_percent: cpu.trim().trim_end_matches('%').trim().parse().ok()?,
    })
}

/// Convert an amount with a unit suffix (`512KiB`, `1.5GB`, `0B`) to MiB
fn parse_memory_mb(text: &str) -> Option<f64> {
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let bytes_per_unit = match unit.trim() {
        "B" | "" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some(value * bytes_per_unit / (1024.0 * 1024.0))
}
