//! Hardware capability profiler.
//!
//! Snapshots are published through `ArcSwap`: one writer refreshes, any
//! number of readers take the current snapshot without locking.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe::{FixedProbe, HardwareProbe};
use super::profile::HardwareProfile;

pub struct HardwareProfiler {
    probe: Box<dyn HardwareProbe>,
    current: ArcSwap<HardwareProfile>,
    writer: Mutex<()>,
    thermal_event: Notify,
    refreshes: AtomicU64,
}

impl HardwareProfiler {
    /// Creates a profiler and takes the first snapshot.
    pub fn new(probe: impl HardwareProbe + 'static) -> Self {
        let profiler = Self {
            probe: Box::new(probe),
            current: ArcSwap::from_pointee(HardwareProfile::fallback()),
            writer: Mutex::new(()),
            thermal_event: Notify::new(),
            refreshes: AtomicU64::new(0),
        };
        profiler.refresh();
        profiler
    }

    /// Profiler pinned to a known profile.
    pub fn fixed(profile: HardwareProfile) -> Self {
        Self::new(FixedProbe::new(profile))
    }

    /// Queries the hardware and publishes a new snapshot.
    ///
    /// Never fails: a probe error publishes the conservative fallback profile.
    pub fn refresh(&self) -> Arc<HardwareProfile> {
        let _writer = self.writer.lock();
        let profile = match self.probe.probe() {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Hardware probe failed, serving with fallback profile: {:#}", e);
                HardwareProfile::fallback()
            }
        };
        let profile = Arc::new(profile);
        self.current.store(profile.clone());
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(
            chip = %profile.chip_family,
            headroom = profile.thermal_headroom,
            "Published hardware profile"
        );
        profile
    }

    /// Last published snapshot. Never touches the hardware.
    pub fn current(&self) -> Arc<HardwareProfile> {
        self.current.load_full()
    }

    /// Number of snapshots published so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Requests an immediate refresh from the background task, e.g. when the
    /// OS reports a thermal throttle.
    pub fn notify_thermal_event(&self) {
        self.thermal_event.notify_one();
    }

    /// Refreshes every `interval` and on thermal notifications until the
    /// returned guard is dropped.
    pub fn spawn_refresh_task(self: &Arc<Self>, interval: Duration) -> RefreshTask {
        let profiler = Arc::clone(self);
        info!("Starting hardware profile refresh every {:?}", interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the constructor already probed.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = profiler.thermal_event.notified() => {
                        debug!("Thermal event received, refreshing hardware profile");
                    }
                }
                let probe_owner = Arc::clone(&profiler);
                if let Err(e) = tokio::task::spawn_blocking(move || probe_owner.refresh()).await {
                    warn!("Hardware refresh task failed: {}", e);
                }
            }
        });
        RefreshTask { handle }
    }
}

/// Background refresh loop; aborted on drop.
pub struct RefreshTask {
    handle: JoinHandle<()>,
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
