//! clamd probe: version, ping, stats and an EICAR scan per scrape.

use crate::stats::{DaemonStats, StatsParser, VersionInfo, VersionParser};
use crate::{Client, ClamdError, EICAR};
use async_trait::async_trait;
use exporter_core::metrics::{Collector, GaugeDesc, Sample};
use exporter_core::Endpoint;
use std::time::{Duration, Instant};
use time::UtcOffset;
use tracing::{debug, warn};

const UP: GaugeDesc = GaugeDesc::new("clamav_clamd_up", "connection to clamd is successful").with_labels(&["version"]);
const DB_VERSION: GaugeDesc = GaugeDesc::new("clamav_clamd_db_version", "version of currently used virus definition DB");
const DB_TIME: GaugeDesc = GaugeDesc::new("clamav_clamd_db_time", "timestamp of currently used virus definition DB");
const PING_TIME: GaugeDesc = GaugeDesc::new("clamav_clamd_ping_time_seconds", "clamd PING round-trip time");
const POOLS: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_pools", "number of memory pools reported by clamd");
const QUEUE_LENGTH: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_queue_length", "number of items in clamd queue");
const THREADS_LIVE: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_threads_live", "number of busy clamd threads");
const THREADS_IDLE: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_threads_idle", "number of idle clamd threads");
const THREADS_MAX: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_threads_max", "maximum number of clamd threads");
const MEM_HEAP: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_heap_bytes", "clamd heap memory");
const MEM_MMAP: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_mmap_bytes", "clamd mmap memory");
const MEM_USED: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_used_bytes", "clamd used memory");
const MEM_FREE: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_free_bytes", "clamd free memory");
const MEM_RELEASABLE: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_releasable_bytes", "clamd releasable memory");
const MEM_POOLS_COUNT: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_pools_count", "number of clamd memory pools");
const MEM_POOLS_USED: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_pools_used_bytes", "memory used by clamd pools");
const MEM_POOLS_TOTAL: GaugeDesc = GaugeDesc::new("clamav_clamd_stats_mem_pools_total_bytes", "memory allocated to clamd pools");
const EICAR_DETECTED: GaugeDesc = GaugeDesc::new("clamav_clamd_eicar_detected", "successfully detected eicar test stream");
const EICAR_TIME: GaugeDesc = GaugeDesc::new("clamav_clamd_eicar_detection_time_seconds", "eicar test stream detection time");

const GAUGES: &[GaugeDesc] = &[
    UP,
    DB_VERSION,
    DB_TIME,
    PING_TIME,
    POOLS,
    QUEUE_LENGTH,
    THREADS_LIVE,
    THREADS_IDLE,
    THREADS_MAX,
    MEM_HEAP,
    MEM_MMAP,
    MEM_USED,
    MEM_FREE,
    MEM_RELEASABLE,
    MEM_POOLS_COUNT,
    MEM_POOLS_USED,
    MEM_POOLS_TOTAL,
    EICAR_DETECTED,
    EICAR_TIME,
];

/// Everything one probe learned. `None` means the step failed or was skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClamdReading {
    pub version: Option<VersionInfo>,
    pub ping_time: Option<Duration>,
    pub stats: DaemonStats,
    pub eicar_detected: Option<bool>,
    pub eicar_time: Option<Duration>,
}

impl ClamdReading {
    pub fn up(&self) -> bool {
        self.version.is_some()
    }

    pub fn samples(&self) -> Vec<Sample> {
        let v = &self.version;
        let threads = self.stats.threads;
        let mem = self.stats.memory;
        let num = |x: Option<u64>| x.map(|n| n as f64);
        vec![
            Sample::new(UP, Some(if self.up() { 1.0 } else { 0.0 }))
                .with_label_values(vec![v.as_ref().map(|v| v.engine.clone()).unwrap_or_default()]),
            Sample::new(DB_VERSION, num(v.as_ref().map(|v| v.db_version))),
            Sample::new(DB_TIME, v.as_ref().map(|v| v.db_time.unix_timestamp() as f64)),
            Sample::new(PING_TIME, self.ping_time.map(|d| d.as_secs_f64())),
            Sample::new(POOLS, num(self.stats.pools)),
            Sample::new(QUEUE_LENGTH, num(self.stats.queue_length)),
            Sample::new(THREADS_LIVE, num(threads.map(|t| t.live))),
            Sample::new(THREADS_IDLE, num(threads.map(|t| t.idle))),
            Sample::new(THREADS_MAX, num(threads.map(|t| t.max))),
            Sample::new(MEM_HEAP, num(mem.map(|m| m.heap))),
            Sample::new(MEM_MMAP, num(mem.map(|m| m.mmap))),
            Sample::new(MEM_USED, num(mem.map(|m| m.used))),
            Sample::new(MEM_FREE, num(mem.map(|m| m.free))),
            Sample::new(MEM_RELEASABLE, num(mem.map(|m| m.releasable))),
            Sample::new(MEM_POOLS_COUNT, num(mem.map(|m| m.pools.count))),
            Sample::new(MEM_POOLS_USED, num(mem.map(|m| m.pools.used))),
            Sample::new(MEM_POOLS_TOTAL, num(mem.map(|m| m.pools.total))),
            Sample::new(EICAR_DETECTED, self.eicar_detected.map(|d| if d { 1.0 } else { 0.0 })),
            Sample::new(EICAR_TIME, self.eicar_time.map(|d| d.as_secs_f64())),
        ]
    }
}

pub struct ClamdCollector {
    client: Client,
    versions: VersionParser,
    stats: StatsParser,
}

impl ClamdCollector {
    /// `db_offset` is the offset used to read the zone-less database build time.
    pub fn new(endpoint: Endpoint, db_offset: UtcOffset) -> Result<Self, regex::Error> {
        Ok(ClamdCollector {
            client: Client::new(endpoint)?,
            versions: VersionParser::new(db_offset)?,
            stats: StatsParser::new()?,
        })
    }

    /// Run one probe. Step failures are logged and leave their fields unknown.
    pub async fn probe(&self) -> ClamdReading {
        let endpoint = self.client.endpoint();
        let mut reading = ClamdReading::default();

        match self.version().await {
            Ok(v) => reading.version = Some(v),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "clamd version query failed; reporting down");
                return reading;
            }
        }

        let started = Instant::now();
        match self.client.ping().await {
            Ok(()) => reading.ping_time = Some(started.elapsed()),
            Err(e) => debug!(endpoint = %endpoint, error = %e, "clamd ping failed"),
        }

        match self.client.stats().await {
            Ok(report) => reading.stats = self.stats.parse(&report),
            Err(e) => debug!(endpoint = %endpoint, error = %e, "clamd stats query failed"),
        }

        let started = Instant::now();
        match self.client.submit_stream(EICAR).await {
            Ok(results) => {
                reading.eicar_time = Some(started.elapsed());
                reading.eicar_detected = Some(results.iter().any(|r| r.is_found()));
            }
            Err(e) => debug!(endpoint = %endpoint, error = %e, "clamd eicar scan failed"),
        }

        reading
    }

    async fn version(&self) -> Result<VersionInfo, VersionError> {
        let raw = self.client.version().await?;
        Ok(self.versions.parse(&raw)?)
    }
}

#[derive(Debug, thiserror::Error)]
enum VersionError {
    #[error(transparent)]
    Clamd(#[from] ClamdError),
    #[error(transparent)]
    Parse(#[from] crate::VersionParseError),
}

#[async_trait]
impl Collector for ClamdCollector {
    fn name(&self) -> &str {
        "clamd"
    }

    fn describe(&self) -> Vec<GaugeDesc> {
        GAUGES.to_vec()
    }

    async fn collect(&self) -> Vec<Sample> {
        self.probe().await.samples()
    }
}
