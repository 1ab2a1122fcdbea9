use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use exporter_core::metrics::{self, Registry, Sample};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Instant;
use time::UtcOffset;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::Config;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Target { Clamd, Icap }

#[derive(Debug, Parser)]
#[command(name = "clamav-exporter", version, about = "Prometheus exporter for clamd and ICAP antivirus services")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./clamav-exporter.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Serve /metrics over HTTP until interrupted
    Serve {
        /// Listen address (host:port); overrides the config file
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run one collection against a single service and print the gauges
    Probe {
        #[arg(value_enum)]
        target: Target,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CLAMAV_EXPORTER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    // must run while the process is still single-threaded
    let local_offset = UtcOffset::current_local_offset().unwrap_or_else(|_| {
        warn!("could not determine local UTC offset; database times are read as UTC");
        UtcOffset::UTC
    });
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Version => {
            println!("clamav-exporter {} (core {})", env!("CARGO_PKG_VERSION"), exporter_core::version());
        }
        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| cfg.listen().to_string());
            let mut registry = Registry::new();
            if cfg.clamd().enabled() {
                register(&mut registry, Target::Clamd, &cfg, local_offset)?;
            }
            if cfg.icap().enabled() {
                register(&mut registry, Target::Icap, &cfg, local_offset)?;
            }
            if registry.is_empty() {
                warn!("no collectors enabled; /metrics will be empty");
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(server::serve(&listen, registry))?;
        }
        Commands::Probe { target, format } => {
            let mut registry = Registry::new();
            register(&mut registry, target, &cfg, local_offset)?;
            let rt = tokio::runtime::Runtime::new()?;
            let started = Instant::now();
            let samples = rt.block_on(registry.gather());
            info!(collector = ?target, elapsed_ms = started.elapsed().as_millis() as u64, "probe finished");
            match format {
                OutputFormat::Text => print!("{}", metrics::render(&samples)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&samples_json(&samples))?),
            }
        }
    }
    Ok(())
}

/// Add the collector for `target`, regardless of its `enable` flag.
fn register(registry: &mut Registry, target: Target, cfg: &Config, local_offset: UtcOffset) -> Result<()> {
    match target {
        #[cfg(feature = "clamd")]
        Target::Clamd => {
            let endpoint = cfg.clamd().endpoint();
            info!(endpoint = %endpoint, "enabling clamd collector");
            registry.register(Box::new(clamd::ClamdCollector::new(endpoint, local_offset)?))?;
        }
        #[cfg(feature = "icap")]
        Target::Icap => {
            let icap_cfg = cfg.icap();
            let endpoint = icap_cfg.endpoint();
            info!(endpoint = %endpoint, service = icap_cfg.service(), "enabling icap collector");
            registry.register(Box::new(icap::IcapCollector::new(endpoint, icap_cfg.service())?))?;
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = (cfg, local_offset);
            return Err(anyhow::anyhow!("{:?} support was not compiled into this build", other));
        }
    }
    Ok(())
}

fn samples_json(samples: &[Sample]) -> Value {
    let mut gauges = Map::new();
    for s in samples {
        let labels: Map<String, Value> = s
            .desc
            .labels
            .iter()
            .zip(&s.label_values)
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();
        // non-finite values have no JSON form
        let value = s.value.filter(|v| v.is_finite()).map_or(Value::Null, |v| json!(v));
        gauges.insert(s.desc.name.to_string(), json!({ "value": value, "labels": labels }));
    }
    Value::Object(gauges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exporter_core::metrics::GaugeDesc;

    #[test]
    fn json_output_maps_unknown_to_null() {
        let up = GaugeDesc::new("x_up", "up").with_labels(&["version"]);
        let t = GaugeDesc::new("x_time_seconds", "time");
        let samples = vec![
            Sample::new(up, Some(1.0)).with_label_values(vec!["1.2.3".into()]),
            Sample::new(t, None),
        ];
        let v = samples_json(&samples);
        assert_eq!(v["x_up"]["value"], json!(1.0));
        assert_eq!(v["x_up"]["labels"]["version"], json!("1.2.3"));
        assert_eq!(v["x_time_seconds"]["value"], Value::Null);
        assert_eq!(v["x_time_seconds"]["labels"], json!({}));
    }

    #[test]
    fn cli_parses_probe() {
        let cli = Cli::try_parse_from(["clamav-exporter", "probe", "icap", "--format", "json"]).unwrap();
        match cli.command {
            Commands::Probe { target, format } => {
                assert_eq!(target, Target::Icap);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[cfg(all(feature = "clamd", feature = "icap"))]
    #[test]
    fn register_ignores_enable_flag() {
        let cfg = Config::default();
        let mut registry = Registry::new();
        register(&mut registry, Target::Clamd, &cfg, UtcOffset::UTC).unwrap();
        register(&mut registry, Target::Icap, &cfg, UtcOffset::UTC).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
