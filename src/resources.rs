//! Resource monitoring and admission control
//!
//! [`ResourceMonitor`] samples CPU and memory usage through a [`ResourceSampler`]
//! and classifies the load. [`AdmissionGate`] turns that classification into
//! backpressure for one worker pool:
//!
//! | status   | admission                                                   |
//! |----------|-------------------------------------------------------------|
//! | ok       | up to the pool's concurrency ceiling                        |
//! | warning  | only while in-flight work stays below the count at warning  |
//! | critical | none; sleep and resample until the load drops               |
//!
//! Sampling errors are recorded in the progress log and treated as warning.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceLimits;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;

/// No warning cap in effect
const NO_CAP: usize = usize::MAX;

/// Load classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Below the warning band of both limits
    Ok,
    /// In the warning band of either limit, below the hard ceiling
    Warning,
    /// At or above the hard ceiling
    Critical,
}

/// One point-in-time sample
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceMetrics {
    /// CPU usage in percent
    pub cpu_percent: f64,
    /// Memory usage in percent
    pub memory_percent: f64,
    /// Classification of this sample
    pub status: ResourceStatus,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

/// Source of CPU and memory readings
pub trait ResourceSampler: Send + Sync {
    /// Current `(cpu_percent, memory_percent)`
    fn sample(&self) -> Result<(f64, f64)>;
}

/// [`ResourceSampler`] backed by the operating system
///
/// Readings are cached for [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`]; sampling
/// more often than that returns the previous reading.
pub struct SystemSampler {
    state: std::sync::Mutex<SamplerState>,
}

struct SamplerState {
    system: sysinfo::System,
    last: Option<(std::time::Instant, (f64, f64))>,
}

impl SystemSampler {
    /// Create a sampler and take an initial CPU reading
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        // CPU usage is a delta; the first refresh only establishes a baseline
        system.refresh_cpu();
        Self {
            state: std::sync::Mutex::new(SamplerState { system, last: None }),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<(f64, f64)> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::ResourceMonitor("system sampler lock poisoned".to_string()))?;
        if let Some((taken, reading)) = state.last {
            if taken.elapsed() < sysinfo::MINIMUM_CPU_UPDATE_INTERVAL {
                return Ok(reading);
            }
        }

        let system = &mut state.system;
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(Error::ResourceMonitor(
                "total memory reported as zero".to_string(),
            ));
        }
        let cpu = f64::from(system.global_cpu_info().cpu_usage());
        let memory = system.used_memory() as f64 / total as f64 * 100.0;
        state.last = Some((std::time::Instant::now(), (cpu, memory)));
        Ok((cpu, memory))
    }
}

/// Samples system load and classifies it against [`ResourceLimits`]
pub struct ResourceMonitor {
    limits: ResourceLimits,
    sampler: Arc<dyn ResourceSampler>,
}

impl ResourceMonitor {
    /// Create a monitor using `sampler` for readings
    pub fn new(limits: ResourceLimits, sampler: Arc<dyn ResourceSampler>) -> Self {
        tracing::info!(
            max_cpu = limits.max_cpu_percent,
            max_memory = limits.max_memory_percent,
            critical = limits.critical_percent,
            "Resource monitor initialized"
        );
        Self { limits, sampler }
    }

    /// Configured limits
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Classify a reading
    pub fn classify(&self, cpu_percent: f64, memory_percent: f64) -> ResourceStatus {
        let limits = &self.limits;
        if cpu_percent >= limits.critical_percent || memory_percent >= limits.critical_percent {
            ResourceStatus::Critical
        } else if cpu_percent >= limits.max_cpu_percent * limits.warning_ratio
            || memory_percent >= limits.max_memory_percent * limits.warning_ratio
        {
            ResourceStatus::Warning
        } else {
            ResourceStatus::Ok
        }
    }

    /// Take a fresh sample
    pub fn sample(&self) -> Result<ResourceMetrics> {
        let (cpu_percent, memory_percent) = self.sampler.sample()?;
        let status = self.classify(cpu_percent, memory_percent);
        if status != ResourceStatus::Ok {
            tracing::debug!(cpu_percent, memory_percent, ?status, "Elevated resource usage");
        }
        Ok(ResourceMetrics {
            cpu_percent,
            memory_percent,
            status,
            sampled_at: Utc::now(),
        })
    }
}

/// Slot in an [`AdmissionGate`]'s pool, released on drop
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded worker-pool admission, gated by resource pressure
pub struct AdmissionGate {
    pool: &'static str,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    warning_cap: AtomicUsize,
    monitor: Option<Arc<ResourceMonitor>>,
    progress: Option<Arc<ProgressTracker>>,
    poll_interval: Duration,
}

impl AdmissionGate {
    /// Gate with a concurrency ceiling and optional resource monitoring
    ///
    /// `pool` names the gate in logs ("channels", "downloads").
    pub fn new(
        pool: &'static str,
        ceiling: usize,
        monitor: Option<Arc<ResourceMonitor>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            slots: Arc::new(Semaphore::new(ceiling.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            warning_cap: AtomicUsize::new(NO_CAP),
            monitor,
            progress: None,
            poll_interval,
        }
    }

    /// Gate that only enforces the concurrency ceiling
    pub fn unmonitored(pool: &'static str, ceiling: usize) -> Self {
        Self::new(pool, ceiling, None, Duration::from_millis(100))
    }

    /// Record sampling errors in `progress`
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Units of work currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop handing out permits; pending and future `admit` calls fail
    pub fn close(&self) {
        self.slots.close();
    }

    /// Wait for a slot and for the load to allow another unit of work
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires first
    /// - [`Error::AdmissionTimeout`] if `deadline` passes first
    /// - [`Error::ShuttingDown`] if the gate was closed
    pub async fn admit(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<AdmissionPermit> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = wait_until(deadline) => return Err(timeout_since(started)),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| Error::ShuttingDown)?
            }
        };

        let mut reported_error = false;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let status = match &self.monitor {
                None => ResourceStatus::Ok,
                Some(monitor) => match monitor.sample() {
                    Ok(metrics) => metrics.status,
                    Err(e) => {
                        if !reported_error {
                            reported_error = true;
                            self.report_sampling_error(&e).await;
                        }
                        ResourceStatus::Warning
                    }
                },
            };

            if self.try_enter(status) {
                return Ok(AdmissionPermit {
                    _slot: slot,
                    in_flight: Arc::clone(&self.in_flight),
                });
            }

            tracing::debug!(
                pool = self.pool,
                ?status,
                in_flight = self.in_flight(),
                "Admission delayed by resource pressure"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = wait_until(deadline) => return Err(timeout_since(started)),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Claim an in-flight slot if `status` allows it.
    fn try_enter(&self, status: ResourceStatus) -> bool {
        match status {
            ResourceStatus::Ok => {
                self.warning_cap.store(NO_CAP, Ordering::SeqCst);
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                true
            }
            ResourceStatus::Warning => {
                // Freeze growth at the in-flight count seen when warning began
                let current = self.in_flight();
                let cap = match self.warning_cap.compare_exchange(
                    NO_CAP,
                    current.max(1),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        tracing::warn!(
                            pool = self.pool,
                            cap = current.max(1),
                            "Resource warning, concurrency frozen"
                        );
                        current.max(1)
                    }
                    Err(existing) => existing,
                };
                self.in_flight
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < cap).then_some(n + 1)
                    })
                    .is_ok()
            }
            ResourceStatus::Critical => false,
        }
    }

    async fn report_sampling_error(&self, error: &Error) {
        let message = format!(
            "Resource sampling failed for {} pool, admitting conservatively: {}",
            self.pool, error
        );
        match &self.progress {
            Some(progress) => progress.record_error(&message).await,
            None => tracing::warn!(error = %error, pool = self.pool, "Resource sampling failed"),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn timeout_since(started: Instant) -> Error {
    Error::AdmissionTimeout {
        waited_secs: started.elapsed().as_secs_f64(),
    }
}
