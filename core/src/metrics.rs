//! Gauge descriptors, samples and the collector registry.
//!
//! Collectors keep "unknown" as `None`; the NaN sentinel only appears when a sample is
//! rendered into the text exposition format.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Write as FmtWrite;
use thiserror::Error;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaugeDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

impl GaugeDesc {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        GaugeDesc { name, help, labels: &[] }
    }

    pub const fn with_labels(self, labels: &'static [&'static str]) -> Self {
        GaugeDesc { labels, ..self }
    }
}

/// One reading of a gauge for one scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub desc: GaugeDesc,
    pub label_values: Vec<String>,
    pub value: Option<f64>,
}

impl Sample {
    pub fn new(desc: GaugeDesc, value: Option<f64>) -> Self {
        Sample { desc, label_values: Vec::new(), value }
    }

    pub fn with_label_values(mut self, values: Vec<String>) -> Self {
        self.label_values = values;
        self
    }

    /// The value as exposed to scrapers: unknown readings become NaN.
    pub fn rendered_value(&self) -> f64 {
        self.value.unwrap_or(f64::NAN)
    }
}

/// Something that owns a fixed set of gauges and produces one sample per gauge on demand.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn describe(&self) -> Vec<GaugeDesc>;

    /// Must yield exactly one sample per described gauge and never fail.
    async fn collect(&self) -> Vec<Sample>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("gauge {0} is already registered")]
    DuplicateGauge(String),
    #[error("invalid gauge name: {0:?}")]
    InvalidName(String),
}

#[derive(Default)]
pub struct Registry {
    collectors: Vec<Box<dyn Collector>>,
    names: HashSet<&'static str>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collector: Box<dyn Collector>) -> Result<(), RegistryError> {
        let descs = collector.describe();
        let mut seen = HashSet::new();
        for d in &descs {
            if !valid_name(d.name) || !d.labels.iter().all(|l| valid_name(l)) {
                return Err(RegistryError::InvalidName(d.name.to_string()));
            }
            if self.names.contains(d.name) || !seen.insert(d.name) {
                return Err(RegistryError::DuplicateGauge(d.name.to_string()));
            }
        }
        self.names.extend(seen);
        self.collectors.push(collector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Run every collector in registration order, one after another.
    pub async fn gather(&self) -> Vec<Sample> {
        let mut out = Vec::new();
        for c in &self.collectors {
            out.extend(c.collect().await);
        }
        out
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Render samples in the Prometheus text exposition format.
pub fn render(samples: &[Sample]) -> String {
    let mut out = String::new();
    let mut last: Option<&str> = None;
    for s in samples {
        if last != Some(s.desc.name) {
            let _ = writeln!(out, "# HELP {} {}", s.desc.name, escape_help(s.desc.help));
            let _ = writeln!(out, "# TYPE {} gauge", s.desc.name);
            last = Some(s.desc.name);
        }
        out.push_str(s.desc.name);
        if !s.desc.labels.is_empty() {
            out.push('{');
            for (i, (name, value)) in s.desc.labels.iter().zip(s.label_values.iter()).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}=\"{}\"", name, escape_label(value));
            }
            out.push('}');
        }
        let _ = writeln!(out, " {}", format_value(s.rendered_value()));
    }
    out
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".into()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf".into() } else { "-Inf".into() }
    } else {
        v.to_string()
    }
}

fn escape_help(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}
