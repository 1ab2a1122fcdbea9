//! ICAP probe: one EICAR submission and one harmless payload per scrape.

use crate::{Client, IcapResponse};
use async_trait::async_trait;
use exporter_core::metrics::{Collector, GaugeDesc, Sample};
use exporter_core::{Endpoint, EICAR};
use std::time::Duration;
use tracing::{debug, warn};

/// Benign payload that a healthy scanner must let through.
pub const HELLO: &[u8] = b"I am a totally legit non-threatening Hello message from The Beyond!";

const UP: GaugeDesc = GaugeDesc::new("clamav_icap_up", "connection to icap server is successful").with_labels(&["version"]);
const EICAR_CODE: GaugeDesc = GaugeDesc::new("clamav_icap_eicar_icap_code", "ICAP result code for eicar test stream");
const EICAR_DETECTED: GaugeDesc = GaugeDesc::new("clamav_icap_eicar_detected", "successfully detected eicar test stream");
const EICAR_TIME: GaugeDesc = GaugeDesc::new("clamav_icap_eicar_detection_time_seconds", "eicar test stream detection time");
const HELLO_OK: GaugeDesc = GaugeDesc::new("clamav_icap_hello_ok", "correctly identified hello as non-threatening");
const HELLO_TIME: GaugeDesc = GaugeDesc::new("clamav_icap_hello_ok_time_seconds", "unthreatening hello test stream detection time");

const GAUGES: &[GaugeDesc] = &[UP, EICAR_CODE, EICAR_DETECTED, EICAR_TIME, HELLO_OK, HELLO_TIME];

/// One probe's findings. Times are kept for failed exchanges too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcapReading {
    pub eicar: Option<IcapResponse>,
    pub eicar_time: Option<Duration>,
    pub hello: Option<IcapResponse>,
    pub hello_time: Option<Duration>,
}

impl IcapReading {
    pub fn up(&self) -> bool {
        self.eicar.is_some()
    }

    pub fn samples(&self) -> Vec<Sample> {
        let eicar = self.eicar.as_ref();
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        vec![
            Sample::new(UP, Some(flag(self.up())))
                .with_label_values(vec![eicar.map(|r| r.server_version.clone()).unwrap_or_default()]),
            Sample::new(EICAR_CODE, eicar.and_then(|r| r.code).map(f64::from)),
            Sample::new(EICAR_DETECTED, eicar.map(|r| flag(r.detected()))),
            Sample::new(EICAR_TIME, self.eicar_time.map(|d| d.as_secs_f64())),
            // a failed hello exchange is "not ok", not unknown
            Sample::new(HELLO_OK, Some(flag(self.hello.as_ref().is_some_and(|r| !r.detected())))),
            Sample::new(HELLO_TIME, self.hello_time.map(|d| d.as_secs_f64())),
        ]
    }
}

pub struct IcapCollector {
    client: Client,
}

impl IcapCollector {
    pub fn new(endpoint: Endpoint, service: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(IcapCollector { client: Client::new(endpoint, service)? })
    }

    pub async fn probe(&self) -> IcapReading {
        let endpoint = self.client.endpoint();
        let mut reading = IcapReading::default();
        match self.client.respmod(EICAR).await {
            Ok(ex) => {
                reading.eicar = Some(ex.response);
                reading.eicar_time = Some(ex.elapsed);
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "icap eicar exchange failed; reporting down");
                reading.eicar_time = Some(e.elapsed);
            }
        }
        match self.client.respmod(HELLO).await {
            Ok(ex) => {
                reading.hello = Some(ex.response);
                reading.hello_time = Some(ex.elapsed);
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "icap hello exchange failed");
                reading.hello_time = Some(e.elapsed);
            }
        }
        reading
    }
}

#[async_trait]
impl Collector for IcapCollector {
    fn name(&self) -> &str {
        "icap"
    }

    fn describe(&self) -> Vec<GaugeDesc> {
        GAUGES.to_vec()
    }

    async fn collect(&self) -> Vec<Sample> {
        self.probe().await.samples()
    }
}
