//! Parsers for the free-text `STATS` dump and the `VERSION` string.
//!
//! Each stats section is all-or-nothing: a section whose line does not fully match stays
//! `None` so consumers can tell "unknown" apart from a real zero.

use regex::Regex;
use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Raw `STATS` fields, keyed by the line prefix they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub pools: String,
    pub state: String,
    pub threads: String,
    pub queue: String,
    pub memstats: String,
}

impl StatsReport {
    /// Fold `STATS` output lines into their fields. Unknown lines and `END` are ignored.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut report = StatsReport::default();
        for line in lines {
            let (key, rest) = match line.split_once(':') {
                Some((k, v)) => (k, v.trim().to_string()),
                None => continue,
            };
            match key {
                "POOLS" => report.pools = rest,
                "STATE" => report.state = rest,
                "THREADS" => report.threads = rest,
                "QUEUE" => report.queue = rest,
                "MEMSTATS" => report.memstats = rest,
                _ => {}
            }
        }
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStats {
    pub live: u64,
    pub idle: u64,
    pub max: u64,
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub count: u64,
    pub used: u64,
    pub total: u64,
}

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub heap: u64,
    pub mmap: u64,
    pub used: u64,
    pub free: u64,
    pub releasable: u64,
    pub pools: PoolStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub pools: Option<u64>,
    pub state: String,
    pub queue_length: Option<u64>,
    pub threads: Option<ThreadStats>,
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone)]
pub struct StatsParser {
    queue: Regex,
    threads: Regex,
    memory: Regex,
}

impl StatsParser {
    pub fn new() -> Result<Self, regex::Error> {
        const SIZE: &str = r"([0-9]+(?:\.[0-9]+)?[KMGT]?)";
        Ok(StatsParser {
            queue: Regex::new(r"^(\d+)\s+item")?,
            threads: Regex::new(r"^live\s+(\d+)\s+idle\s+(\d+)\s+max\s+(\d+)\s+idle-timeout\s+(\d+)$")?,
            memory: Regex::new(&format!(
                r"^heap\s+{s}\s+mmap\s+{s}\s+used\s+{s}\s+free\s+{s}\s+releasable\s+{s}\s+pools\s+(\d+)\s+pools_used\s+{s}\s+pools_total\s+{s}$",
                s = SIZE
            ))?,
        })
    }

    pub fn parse(&self, report: &StatsReport) -> DaemonStats {
        DaemonStats {
            pools: report.pools.trim().parse().ok(),
            state: report.state.clone(),
            queue_length: self.parse_queue(&report.queue),
            threads: self.parse_threads(&report.threads),
            memory: self.parse_memory(&report.memstats),
        }
    }

    pub fn parse_queue(&self, s: &str) -> Option<u64> {
        let caps = self.queue.captures(s.trim())?;
        caps[1].parse().ok()
    }

    pub fn parse_threads(&self, s: &str) -> Option<ThreadStats> {
        let caps = self.threads.captures(s.trim())?;
        Some(ThreadStats {
            live: caps[1].parse().ok()?,
            idle: caps[2].parse().ok()?,
            max: caps[3].parse().ok()?,
            idle_timeout: caps[4].parse().ok()?,
        })
    }

    pub fn parse_memory(&self, s: &str) -> Option<MemoryStats> {
        let caps = self.memory.captures(s.trim())?;
        Some(MemoryStats {
            heap: parse_byte_size(&caps[1])?,
            mmap: parse_byte_size(&caps[2])?,
            used: parse_byte_size(&caps[3])?,
            free: parse_byte_size(&caps[4])?,
            releasable: parse_byte_size(&caps[5])?,
            pools: PoolStats {
                count: caps[6].parse().ok()?,
                used: parse_byte_size(&caps[7])?,
                total: parse_byte_size(&caps[8])?,
            },
        })
    }
}

/// Convert a human size token such as `12.5M` to bytes. clamd divides by 1024 per unit.
pub fn parse_byte_size(token: &str) -> Option<u64> {
    let (number, multiplier) = match token.as_bytes().last()? {
        b'K' => (&token[..token.len() - 1], 1u64 << 10),
        b'M' => (&token[..token.len() - 1], 1 << 20),
        b'G' => (&token[..token.len() - 1], 1 << 30),
        b'T' => (&token[..token.len() - 1], 1 << 40),
        _ => (token, 1),
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64).round() as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub engine: String,
    pub db_version: u64,
    pub db_time: OffsetDateTime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("invalid clamd version string: {0:?}")]
    Format(String),
    #[error("invalid virus database version: {0:?}")]
    DbVersion(String),
    #[error("invalid virus database time: {0:?}")]
    DbTime(String),
}

/// Parses `ClamAV <engine>/<db version>/<db build time>`.
///
/// The database time carries no zone; it is read in the offset the parser was built with,
/// normally the exporter host's local offset at startup. That one offset is applied to every
/// date, so a database built on the other side of a daylight-saving change, or a process that
/// outlives one, reports a build time that is off by the DST shift.
#[derive(Debug, Clone)]
pub struct VersionParser {
    pattern: Regex,
    offset: UtcOffset,
}

impl VersionParser {
    pub fn new(offset: UtcOffset) -> Result<Self, regex::Error> {
        Ok(VersionParser { pattern: Regex::new(r"^ClamAV (.*?)/(.*?)/(.*?)$")?, offset })
    }

    pub fn parse(&self, s: &str) -> Result<VersionInfo, VersionParseError> {
        let caps = self.pattern.captures(s.trim()).ok_or_else(|| VersionParseError::Format(s.to_string()))?;
        let engine = caps[1].to_string();
        let db_version = caps[2].parse().map_err(|_| VersionParseError::DbVersion(caps[2].to_string()))?;
        // ctime pads single-digit days with a second space
        let normalized = caps[3].split_whitespace().collect::<Vec<_>>().join(" ");
        let format = format_description!(
            "[weekday repr:short] [month repr:short] [day padding:none] [hour]:[minute]:[second] [year]"
        );
        let db_time = PrimitiveDateTime::parse(&normalized, format)
            .map_err(|_| VersionParseError::DbTime(caps[3].to_string()))?
            .assume_offset(self.offset);
        Ok(VersionInfo { engine, db_version, db_time })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn version_string_in_utc() {
        let p = VersionParser::new(UtcOffset::UTC).unwrap();
        let v = p.parse("ClamAV 0.102.1/25701/Mon Jan 20 12:41:43 2020").unwrap();
        assert_eq!(v.engine, "0.102.1");
        assert_eq!(v.db_version, 25701);
        assert_eq!(v.db_time.unix_timestamp(), 1579524103);
    }

    #[test]
    fn version_offset_is_fixed_across_seasons() {
        let parser = VersionParser::new(UtcOffset::from_hms(1, 0, 0).unwrap()).unwrap();
        let winter = parser.parse("ClamAV 1.0.3/27100/Tue Jan  2 12:00:00 2024").unwrap();
        let summer = parser.parse("ClamAV 1.0.3/27200/Tue Jul  2 12:00:00 2024").unwrap();
        assert_eq!(winter.db_time.offset(), summer.db_time.offset());
        assert_eq!(winter.db_time.unix_timestamp(), 1704193200);
        assert_eq!(summer.db_time.unix_timestamp(), 1719918000);
    }

    #[test]
    fn version_time_follows_offset() {
        let offset = UtcOffset::from_hms(2, 0, 0).unwrap();
        let v = VersionParser::new(offset).unwrap().parse("ClamAV 0.102.1/25701/Mon Jan 20 12:41:43 2020").unwrap();
        assert_eq!(v.db_time.unix_timestamp(), 1579524103 - 7200);
    }

    #[test]
    fn version_single_digit_day_with_ctime_padding() {
        let p = VersionParser::new(UtcOffset::UTC).unwrap();
        let v = p.parse("ClamAV 1.0.1/26830/Mon Mar  6 08:21:30 2023").unwrap();
        assert_eq!(v.db_version, 26830);
        assert_eq!(v.db_time.day(), 6);
    }

    #[test]
    fn version_errors_are_tagged() {
        let p = VersionParser::new(UtcOffset::UTC).unwrap();
        assert!(matches!(p.parse("PONG"), Err(VersionParseError::Format(_))));
        assert!(matches!(p.parse("ClamAV 0.102.1/abc/Mon Jan 20 12:41:43 2020"), Err(VersionParseError::DbVersion(_))));
        assert!(matches!(p.parse("ClamAV 0.102.1/25701/yesterday"), Err(VersionParseError::DbTime(_))));
    }

    #[test]
    fn memory_stats_megabytes() {
        let p = StatsParser::new().unwrap();
        let m = p
            .parse_memory("heap 10.5M mmap 2.0M used 8.0M free 1.0M releasable 0.5M pools 3 pools_used 4.0M pools_total 5.0M")
            .unwrap();
        assert_eq!(m.pools.count, 3);
        assert_eq!(m.heap, 10 * MIB + MIB / 2);
        assert_eq!(m.mmap, 2 * MIB);
        assert_eq!(m.used, 8 * MIB);
        assert_eq!(m.free, MIB);
        assert_eq!(m.releasable, MIB / 2);
        assert_eq!(m.pools.used, 4 * MIB);
        assert_eq!(m.pools.total, 5 * MIB);
    }

    #[test]
    fn memory_section_is_all_or_nothing() {
        let p = StatsParser::new().unwrap();
        assert_eq!(p.parse_memory("heap 10.5M mmap 2.0M used 8.0M"), None);
        assert_eq!(p.parse_memory("heap N/A mmap 2.0M used 8.0M free 1.0M releasable 0.5M pools 3 pools_used 4.0M pools_total 5.0M"), None);
    }

    #[test]
    fn threads_and_queue() {
        let p = StatsParser::new().unwrap();
        let t = p.parse_threads("live 1  idle 0 max 12 idle-timeout 30").unwrap();
        assert_eq!((t.live, t.idle, t.max, t.idle_timeout), (1, 0, 12, 30));
        assert_eq!(p.parse_queue("0 items"), Some(0));
        assert_eq!(p.parse_queue("7 items"), Some(7));
        assert_eq!(p.parse_queue("many items"), None);
        assert_eq!(p.parse_threads("live 1 idle 0"), None);
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_byte_size("512"), Some(512));
        assert_eq!(parse_byte_size("1.5K"), Some(1536));
        assert_eq!(parse_byte_size("1G"), Some(1 << 30));
        assert_eq!(parse_byte_size("M"), None);
        assert_eq!(parse_byte_size(""), None);
    }

    #[test]
    fn full_report_folds_and_parses() {
        let output = "POOLS: 1\n\nSTATE: VALID PRIMARY\nTHREADS: live 1  idle 0 max 12 idle-timeout 30\nQUEUE: 0 items\n\tSTATS 0.000061\n\nMEMSTATS: heap 9.082M mmap 0.000M used 6.902M free 2.184M releasable 0.129M pools 1 pools_used 565.979M pools_total 565.999M\nEND";
        let report = StatsReport::from_lines(output.lines());
        assert_eq!(report.state, "VALID PRIMARY");
        let stats = StatsParser::new().unwrap().parse(&report);
        assert_eq!(stats.pools, Some(1));
        assert_eq!(stats.queue_length, Some(0));
        assert_eq!(stats.threads.map(|t| t.max), Some(12));
        let mem = stats.memory.unwrap();
        assert_eq!(mem.mmap, 0);
        assert_eq!(mem.pools.count, 1);
    }

    #[test]
    fn empty_report_is_all_unknown() {
        let stats = StatsParser::new().unwrap().parse(&StatsReport::default());
        assert_eq!(stats, DaemonStats::default());
    }
}
