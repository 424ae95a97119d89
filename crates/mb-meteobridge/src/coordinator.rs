//! Poll coordinator
//!
//! Fetches snapshots from a [`DataSource`] on a fixed interval and keeps the
//! latest successful one. Projections read the cached snapshot directly;
//! observers are told about every refresh outcome through a broadcast
//! channel.
//!
//! Only one fetch is ever in flight per coordinator. A poll cycle that runs
//! past its deadline delays the next one instead of overlapping it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mb_core::Readings;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::source::{DataSource, SourceError, SourceResult};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Outcome of one refresh, as seen by observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorUpdate {
    Refreshed,
    Failed(SourceError),
}

pub struct DataUpdateCoordinator {
    name: String,
    source: Arc<dyn DataSource>,
    interval: Duration,

    /// Latest successful snapshot, replaced wholesale
    data: RwLock<Option<Arc<Readings>>>,
    last_update_success: AtomicBool,
    last_error: RwLock<Option<SourceError>>,
    auth_failed: AtomicBool,
    closed: AtomicBool,

    /// Serialises fetches
    refresh_lock: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<CoordinatorUpdate>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DataUpdateCoordinator {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DataSource>,
        interval: Duration,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            source,
            interval,
            data: RwLock::new(None),
            last_update_success: AtomicBool::new(false),
            last_error: RwLock::new(None),
            auth_failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
            updates,
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Latest successful snapshot
    pub fn data(&self) -> Option<Arc<Readings>> {
        self.data.read().clone()
    }

    /// Whether the most recent refresh succeeded
    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<SourceError> {
        self.last_error.read().clone()
    }

    /// Set once polling hit an authentication failure and stopped
    pub fn auth_failed(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorUpdate> {
        self.updates.subscribe()
    }

    /// Fetch one snapshot
    ///
    /// On failure the previous snapshot stays cached. After [`shutdown`]
    /// a fetch that completes late is discarded without notifying anyone.
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn refresh(&self) -> SourceResult<Arc<Readings>> {
        let _guard = self.refresh_lock.lock().await;

        let result = self.source.fetch_snapshot().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!("Discarding {} refresh after shutdown", self.name);
            return result.map(Arc::new);
        }

        match result {
            Ok(readings) => {
                let readings = Arc::new(readings);
                *self.data.write() = Some(Arc::clone(&readings));
                *self.last_error.write() = None;

                let was_failing = !self.last_update_success.swap(true, Ordering::SeqCst);
                if was_failing {
                    info!("Fetching {} data recovered", self.name);
                }
                debug!(
                    "Fetched {} readings from {} ({} values)",
                    readings.timestamp(),
                    self.name,
                    readings.len()
                );

                let _ = self.updates.send(CoordinatorUpdate::Refreshed);
                Ok(readings)
            }
            Err(err) => {
                let was_succeeding = self.last_update_success.swap(false, Ordering::SeqCst);
                if err.is_auth() {
                    self.auth_failed.store(true, Ordering::SeqCst);
                    error!("Authentication failed fetching {} data: {}", self.name, err);
                } else if was_succeeding {
                    warn!("Error fetching {} data: {}", self.name, err);
                } else {
                    debug!("Error fetching {} data: {}", self.name, err);
                }
                *self.last_error.write() = Some(err.clone());

                let _ = self.updates.send(CoordinatorUpdate::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Eager refresh before polling starts; the caller classifies failures
    pub async fn first_refresh(&self) -> SourceResult<Arc<Readings>> {
        self.refresh().await
    }

    /// Spawn the polling loop
    ///
    /// The first poll happens one interval from now since setup has already
    /// refreshed eagerly. Transient failures keep the loop going; an
    /// authentication failure stops it.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Polling for {} already running", self.name);
            return;
        }

        let this = Arc::downgrade(self);
        let period = self.interval;
        let name = self.name.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(coordinator) = this.upgrade() else {
                    break;
                };
                if let Err(SourceError::Auth(_)) = coordinator.refresh().await {
                    error!("Stopped polling {}; reconfiguration required", name);
                    break;
                }
            }
        }));

        info!("Polling {} every {:?}", self.name, period);
    }

    /// Stop polling, cancelling any fetch in flight
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Stopped polling {}", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DataUpdateCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitDescriptions;
    use crate::DeviceInfo;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Replays scripted snapshots; an empty script repeats a default reading
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<SourceResult<Readings>>>,
        fetches: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(script: Vec<SourceResult<Readings>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn fetch_device_info(&self) -> SourceResult<DeviceInfo> {
            Ok(DeviceInfo::default())
        }

        async fn fetch_snapshot(&self) -> SourceResult<Readings> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(temperature(20.0)))
        }

        fn unit_descriptions(&self) -> UnitDescriptions {
            UnitDescriptions::default()
        }
    }

    fn temperature(value: f64) -> Readings {
        Readings::new(Utc::now()).with("air_temperature", value)
    }

    fn transient() -> SourceError {
        SourceError::Transient("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_snapshot() {
        let source = ScriptedSource::new(vec![Ok(temperature(21.5)), Err(transient())]);
        let coordinator = DataUpdateCoordinator::new("test", source, Duration::from_secs(10));
        let mut updates = coordinator.subscribe();

        coordinator.refresh().await.unwrap();
        assert!(coordinator.last_update_success());
        assert_eq!(updates.recv().await.unwrap(), CoordinatorUpdate::Refreshed);

        assert!(coordinator.refresh().await.is_err());
        assert!(!coordinator.last_update_success());
        assert_eq!(coordinator.last_error(), Some(transient()));
        assert_eq!(
            updates.recv().await.unwrap(),
            CoordinatorUpdate::Failed(transient())
        );

        let data = coordinator.data().unwrap();
        assert_eq!(data.get("air_temperature").and_then(|v| v.as_f64()), Some(21.5));
    }

    #[tokio::test]
    async fn test_no_data_before_first_refresh() {
        let coordinator = DataUpdateCoordinator::new(
            "test",
            ScriptedSource::new(vec![]),
            Duration::from_secs(10),
        );
        assert!(coordinator.data().is_none());
        assert!(!coordinator.last_update_success());
        assert!(!coordinator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_after_first_refresh() {
        let source = ScriptedSource::new(vec![]);
        let coordinator =
            DataUpdateCoordinator::new("test", source.clone(), Duration::from_secs(10));

        coordinator.first_refresh().await.unwrap();
        coordinator.start();
        assert!(coordinator.is_running());

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(source.fetches(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(source.fetches(), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(source.fetches(), 4);

        coordinator.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetches(), 4);
        assert!(!coordinator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_polling() {
        let source = ScriptedSource::new(vec![Ok(temperature(1.0)), Err(transient())]);
        let coordinator =
            DataUpdateCoordinator::new("test", source.clone(), Duration::from_secs(5));

        coordinator.first_refresh().await.unwrap();
        coordinator.start();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(!coordinator.last_update_success());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(coordinator.last_update_success());
        assert!(coordinator.is_running());
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_stops_polling() {
        let source = ScriptedSource::new(vec![
            Ok(temperature(1.0)),
            Err(SourceError::Auth("401".to_string())),
        ]);
        let coordinator =
            DataUpdateCoordinator::new("test", source.clone(), Duration::from_secs(5));

        coordinator.first_refresh().await.unwrap();
        coordinator.start();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(coordinator.auth_failed());
        assert!(!coordinator.is_running());
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_fetch_in_flight() {
        let source = ScriptedSource::slow(Duration::from_secs(3));
        let coordinator =
            DataUpdateCoordinator::new("test", source.clone(), Duration::from_secs(1));

        let (a, b) = futures::join!(coordinator.refresh(), coordinator.refresh());
        assert!(a.is_ok() && b.is_ok());

        coordinator.start();
        tokio::time::sleep(Duration::from_secs(30)).await;
        coordinator.shutdown();

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_in_flight_fetch() {
        let source = ScriptedSource::slow(Duration::from_secs(3));
        let coordinator =
            DataUpdateCoordinator::new("test", source.clone(), Duration::from_secs(5));
        let mut updates = coordinator.subscribe();

        coordinator.start();
        // Poll starts at 5s and would finish at 8s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.fetches(), 1);
        coordinator.shutdown();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(coordinator.data().is_none());
        assert!(updates.try_recv().is_err());
    }
}
