//! Network quality monitoring
//!
//! While a call is connected the monitor samples, on a fixed interval:
//!
//! - round-trip latency to the backend through a [`LatencyProbe`]
//! - connection type through [`NetworkInfo`]
//! - outbound audio bitrate and inbound packet loss from the SDK's
//!   peer-connection statistics, when the SDK exposes them
//!
//! Every source degrades to `None` on failure; sampling never errors.
//! Stopping clears all fields at once.

use crate::config::NetworkMonitorConfig;
use crate::sdk::SdkCall;
use crate::types::{NetworkStats, TransportStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latency probe errors
#[derive(Error, Debug)]
pub enum ProbeError {
    /// HTTP transport failure
    #[cfg(feature = "http-probe")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a failure status
    #[error("Probe endpoint returned status {0}")]
    Status(u16),

    /// No endpoint could be reached
    #[error("No probe endpoint reachable")]
    Unreachable,
}

/// Round-trip latency measurement
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Measure one round trip
    async fn round_trip(&self) -> Result<Duration, ProbeError>;
}

/// Platform network information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Effective type such as `4g` or `slow-2g`
    pub effective_type: Option<String>,
    /// Physical type such as `wifi` or `cellular`
    pub connection_type: Option<String>,
}

/// Source of [`ConnectionInfo`]
pub trait NetworkInfo: Send + Sync {
    /// Current connection, `None` if the platform does not say
    fn connection(&self) -> Option<ConnectionInfo>;
}

/// Human-readable connection type
pub fn network_type_label(info: Option<&ConnectionInfo>) -> String {
    let Some(info) = info else {
        return "Unknown".to_string();
    };
    if let Some(effective) = info.effective_type.as_deref() {
        return match effective {
            "slow-2g" => "2G (slow)",
            "2g" => "2G",
            "3g" => "3G",
            "4g" => "4G/LTE",
            other => other,
        }
        .to_string();
    }
    if let Some(kind) = info.connection_type.as_deref() {
        return match kind {
            "wifi" => "WiFi",
            "cellular" => "Cellular",
            "ethernet" => "Ethernet",
            "bluetooth" => "Bluetooth",
            other => other,
        }
        .to_string();
    }
    "Unknown".to_string()
}

/// Outbound audio bitrate in kbps
pub fn bitrate_kbps(stats: &TransportStats) -> Option<u32> {
    stats
        .outbound_audio_bytes_sent
        .filter(|bytes| *bytes > 0)
        .map(|bytes| (bytes as f64 * 8.0 / 1000.0).round() as u32)
}

/// Inbound packet loss percentage, two decimals
pub fn packet_loss_percent(stats: &TransportStats) -> Option<f64> {
    let lost = stats.inbound_packets_lost?;
    let received = stats.inbound_packets_received?;
    let total = lost + received;
    if total == 0 {
        return None;
    }
    Some((lost as f64 / total as f64 * 100.0 * 100.0).round() / 100.0)
}

/// Take one sample from every source
pub async fn sample(
    probe: &dyn LatencyProbe,
    info: &dyn NetworkInfo,
    call: Option<&dyn SdkCall>,
) -> NetworkStats {
    let ping_ms = match probe.round_trip().await {
        Ok(rtt) => Some((rtt.as_secs_f64() * 1000.0).round() as u32),
        Err(e) => {
            tracing::debug!(error = %e, "Latency probe failed");
            None
        }
    };
    let transport = match call {
        Some(call) => call.transport_stats().await,
        None => None,
    };
    NetworkStats {
        ping_ms,
        bitrate_kbps: transport.as_ref().and_then(bitrate_kbps),
        packet_loss_percent: transport.as_ref().and_then(packet_loss_percent),
        network_type: Some(network_type_label(info.connection().as_ref())),
    }
}

/// Periodic network sampler for the connected call
pub struct NetworkQualityMonitor {
    probe: Arc<dyn LatencyProbe>,
    info: Arc<dyn NetworkInfo>,
    interval: Duration,
    stats_tx: Arc<watch::Sender<NetworkStats>>,
    generation: Arc<Mutex<u64>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkQualityMonitor {
    /// Create a stopped monitor
    pub fn new(
        probe: Arc<dyn LatencyProbe>,
        info: Arc<dyn NetworkInfo>,
        config: &NetworkMonitorConfig,
    ) -> Self {
        let (stats_tx, _) = watch::channel(NetworkStats::default());
        Self {
            probe,
            info,
            interval: config.sample_interval(),
            stats_tx: Arc::new(stats_tx),
            generation: Arc::new(Mutex::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Start sampling now and on every interval, replacing a running sampler
    pub fn start(&self, call: Option<Arc<dyn SdkCall>>) {
        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            *generation
        };

        let probe = self.probe.clone();
        let info = self.info.clone();
        let stats_tx = self.stats_tx.clone();
        let current = self.generation.clone();
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = sample(probe.as_ref(), info.as_ref(), call.as_deref()).await;
                let guard = current.lock();
                if *guard != generation {
                    return;
                }
                tracing::trace!(?stats, "Network sample");
                stats_tx.send_replace(stats);
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        tracing::debug!(interval_ms = period.as_millis() as u64, "Network monitor started");
    }

    /// Stop sampling and clear every field
    pub fn stop(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("Network monitor stopped");
        }
        self.stats_tx.send_replace(NetworkStats::default());
    }

    /// Whether a sampler is running
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Latest sample
    pub fn current(&self) -> NetworkStats {
        self.stats_tx.borrow().clone()
    }

    /// Watch samples
    pub fn subscribe(&self) -> watch::Receiver<NetworkStats> {
        self.stats_tx.subscribe()
    }
}

impl Drop for NetworkQualityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Latency probe issuing `HEAD` requests against the backend
#[cfg(feature = "http-probe")]
pub struct HttpLatencyProbe {
    client: reqwest::Client,
    urls: Vec<String>,
}

#[cfg(feature = "http-probe")]
impl HttpLatencyProbe {
    /// Build a probe for the configured endpoints
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(config: &NetworkMonitorConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()?;
        let base = config.probe_base_url.trim_end_matches('/');
        let urls = config
            .probe_endpoints
            .iter()
            .map(|path| format!("{base}{path}"))
            .collect();
        Ok(Self { client, urls })
    }
}

#[cfg(feature = "http-probe")]
#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn round_trip(&self) -> Result<Duration, ProbeError> {
        let mut last_error = ProbeError::Unreachable;
        for url in &self.urls {
            let start = tokio::time::Instant::now();
            match self
                .client
                .head(url)
                .header("Cache-Control", "no-cache")
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(start.elapsed()),
                Ok(response) => {
                    tracing::debug!(%url, status = response.status().as_u16(), "Probe endpoint failed");
                    last_error = ProbeError::Status(response.status().as_u16());
                }
                Err(e) => {
                    tracing::debug!(%url, error = %e, "Probe endpoint unreachable");
                    last_error = ProbeError::Http(e);
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{FixedLatencyProbe, StaticNetworkInfo};
    use pretty_assertions::assert_eq;

    fn info(effective: Option<&str>, kind: Option<&str>) -> ConnectionInfo {
        ConnectionInfo {
            effective_type: effective.map(String::from),
            connection_type: kind.map(String::from),
        }
    }

    #[test]
    fn test_network_type_labels() {
        assert_eq!(network_type_label(None), "Unknown");
        assert_eq!(network_type_label(Some(&info(Some("slow-2g"), None))), "2G (slow)");
        assert_eq!(network_type_label(Some(&info(Some("4g"), Some("wifi")))), "4G/LTE");
        assert_eq!(network_type_label(Some(&info(None, Some("wifi")))), "WiFi");
        assert_eq!(network_type_label(Some(&info(None, Some("cellular")))), "Cellular");
        assert_eq!(network_type_label(Some(&info(Some("5g"), None))), "5g");
        assert_eq!(network_type_label(Some(&info(None, None))), "Unknown");
    }

    #[test]
    fn test_transport_figures() {
        let stats = TransportStats {
            outbound_audio_bytes_sent: Some(40_000),
            inbound_packets_lost: Some(1),
            inbound_packets_received: Some(299),
        };
        assert_eq!(bitrate_kbps(&stats), Some(320));
        assert_eq!(packet_loss_percent(&stats), Some(0.33));

        let empty = TransportStats {
            outbound_audio_bytes_sent: None,
            inbound_packets_lost: Some(0),
            inbound_packets_received: Some(0),
        };
        assert_eq!(bitrate_kbps(&empty), None);
        assert_eq!(packet_loss_percent(&empty), None);
    }

    #[tokio::test]
    async fn test_failed_probe_yields_none() {
        let probe = FixedLatencyProbe::failing();
        let info = StaticNetworkInfo::new(None);
        let stats = sample(&probe, &info, None).await;
        assert_eq!(stats.ping_ms, None);
        assert_eq!(stats.bitrate_kbps, None);
        assert_eq!(stats.network_type.as_deref(), Some("Unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_samples_and_clears() {
        let monitor = NetworkQualityMonitor::new(
            Arc::new(FixedLatencyProbe::new(Duration::from_millis(42))),
            Arc::new(StaticNetworkInfo::new(Some(info(Some("4g"), None)))),
            &NetworkMonitorConfig::default(),
        );
        let mut rx = monitor.subscribe();
        monitor.start(None);
        rx.changed().await.unwrap();
        let stats = rx.borrow_and_update().clone();
        assert_eq!(stats.ping_ms, Some(42));
        assert_eq!(stats.network_type.as_deref(), Some("4G/LTE"));
        assert!(monitor.is_running());

        monitor.stop();
        assert!(monitor.current().is_empty());

        // no sample lands after stop
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(monitor.current().is_empty());
    }
}
