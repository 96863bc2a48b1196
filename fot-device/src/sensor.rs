//! Per-sensor flow controller.
//!
//! A [`Sensor`] owns one sampling task. The flow state lives in a `watch`
//! channel so start/pause/stop interrupt an in-progress wait immediately.
//!
//! States: `Idle -> Running <-> Paused -> Stopped`, and `Stopped` can be
//! started again.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::model::{DataRecord, SensorSpec};
use crate::rtt::RttTracker;
use crate::sink::BatchHandle;
use crate::tatu::{build_flow_response, topics};
use crate::transport::{Connection, QoS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Capabilities the dispatcher needs from a sensor.
pub trait FlowControl: Send + Sync {
    fn id(&self) -> &str;

    /// Starts or resumes the flow. Positive intervals replace the stored ones.
    fn start(&self, collect_ms: Option<i64>, publish_ms: Option<i64>);

    fn pause(&self);

    fn stop(&self);

    /// Takes a fresh sample.
    fn current_value(&self) -> i64;

    fn state(&self) -> FlowState;

    fn is_null(&self) -> bool {
        false
    }
}

/// Stand-in returned for unknown sensor ids. Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSensor;

pub static NULL_SENSOR: NullSensor = NullSensor;

impl FlowControl for NullSensor {
    fn id(&self) -> &str {
        "NullSensor"
    }

    fn start(&self, _collect_ms: Option<i64>, _publish_ms: Option<i64>) {
        warn!("start requested on a null sensor");
    }

    fn pause(&self) {}

    fn stop(&self) {}

    fn current_value(&self) -> i64 {
        0
    }

    fn state(&self) -> FlowState {
        FlowState::Idle
    }

    fn is_null(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct Intervals {
    collect_ms: i64,
    publish_ms: i64,
}

struct Inner {
    spec: SensorSpec,
    device_id: String,
    intervals: Mutex<Intervals>,
    last_value: AtomicI64,
    state: watch::Sender<FlowState>,
    loop_alive: AtomicBool,
    spawned_loops: AtomicUsize,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    tracker: Arc<RttTracker>,
    message_log: Option<BatchHandle<DataRecord>>,
}

/// Cheap-to-clone handle on a sensor runtime.
#[derive(Clone)]
pub struct Sensor {
    inner: Arc<Inner>,
}

impl Sensor {
    pub fn new(
        device_id: impl Into<String>,
        spec: SensorSpec,
        tracker: Arc<RttTracker>,
        message_log: Option<BatchHandle<DataRecord>>,
    ) -> Self {
        let initial = rand::thread_rng().gen_range(spec.min_value..=spec.max_value);
        let (state, _) = watch::channel(FlowState::Idle);
        Self {
            inner: Arc::new(Inner {
                intervals: Mutex::new(Intervals {
                    collect_ms: spec.collection_interval_ms,
                    publish_ms: spec.publish_interval_ms,
                }),
                spec,
                device_id: device_id.into(),
                last_value: AtomicI64::new(initial),
                state,
                loop_alive: AtomicBool::new(false),
                spawned_loops: AtomicUsize::new(0),
                connection: RwLock::new(None),
                tracker,
                message_log,
            }),
        }
    }

    pub fn spec(&self) -> &SensorSpec {
        &self.inner.spec
    }

    /// Connection the sampling loop publishes on.
    pub fn bind(&self, connection: Arc<dyn Connection>) {
        *self.inner.connection.write() = Some(connection);
    }

    /// `(collect_ms, publish_ms)` currently in effect.
    pub fn intervals(&self) -> (i64, i64) {
        let intervals = *self.inner.intervals.lock();
        (intervals.collect_ms, intervals.publish_ms)
    }

    pub fn last_value(&self) -> i64 {
        self.inner.last_value.load(Ordering::SeqCst)
    }

    /// Number of sampling tasks spawned over the sensor's lifetime.
    pub fn spawned_loops(&self) -> usize {
        self.inner.spawned_loops.load(Ordering::SeqCst)
    }

    pub fn is_loop_alive(&self) -> bool {
        self.inner.loop_alive.load(Ordering::SeqCst)
    }

    /// Paused → Running. A sensor stopped or restarted meanwhile is left
    /// alone; returns whether it resumed.
    pub fn resume(&self) -> bool {
        let resumed = self.inner.state.send_if_modified(|state| {
            if *state == FlowState::Paused {
                *state = FlowState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("sensor {} resumed", self.inner.spec.id);
            self.ensure_loop();
        }
        resumed
    }

    fn ensure_loop(&self) {
        if self.inner.loop_alive.swap(true, Ordering::SeqCst) {
            debug!("sensor {} reuses its sampling loop", self.inner.spec.id);
            return;
        }
        self.inner.spawned_loops.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                inner.run().await;
                inner.loop_alive.store(false, Ordering::SeqCst);
                // A start() racing with the exit saw the loop alive and did not spawn.
                if inner.flow_state() != FlowState::Running
                    || inner.loop_alive.swap(true, Ordering::SeqCst)
                {
                    break;
                }
            }
        });
    }
}

impl FlowControl for Sensor {
    fn id(&self) -> &str {
        &self.inner.spec.id
    }

    fn start(&self, collect_ms: Option<i64>, publish_ms: Option<i64>) {
        let inner = &self.inner;
        let (collect, publish) = {
            let mut intervals = inner.intervals.lock();
            if let Some(collect) = collect_ms.filter(|ms| *ms > 0) {
                intervals.collect_ms = collect;
            }
            if let Some(publish) = publish_ms.filter(|ms| *ms > 0) {
                intervals.publish_ms = publish;
            }
            (intervals.collect_ms, intervals.publish_ms)
        };

        if collect <= 0 || publish <= 0 {
            warn!(
                "sensor {} cannot flow with collect={} publish={}",
                inner.spec.id, collect, publish
            );
            inner.state.send_replace(FlowState::Stopped);
            return;
        }

        let previous = inner.state.send_replace(FlowState::Running);
        match previous {
            FlowState::Running => debug!("sensor {} already running", inner.spec.id),
            FlowState::Paused => info!("sensor {} resumed", inner.spec.id),
            FlowState::Idle | FlowState::Stopped => {
                info!(
                    "sensor {} starting flow (collect {} ms, publish {} ms)",
                    inner.spec.id, collect, publish
                );
                self.ensure_loop();
            }
        }
    }

    fn pause(&self) {
        let paused = self.inner.state.send_if_modified(|state| {
            if *state == FlowState::Running {
                *state = FlowState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            info!("sensor {} paused", self.inner.spec.id);
        }
    }

    fn stop(&self) {
        let stopped = self.inner.state.send_if_modified(|state| {
            if matches!(state, FlowState::Running | FlowState::Paused) {
                *state = FlowState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            info!("sensor {} stopped", self.inner.spec.id);
        }
    }

    fn current_value(&self) -> i64 {
        self.inner.next_value()
    }

    fn state(&self) -> FlowState {
        self.inner.flow_state()
    }
}

impl Inner {
    fn flow_state(&self) -> FlowState {
        *self.state.borrow()
    }

    /// One random-walk step of `delta`, clamped to `[min, max]`.
    fn next_value(&self) -> i64 {
        let step = if rand::thread_rng().gen_bool(0.5) {
            self.spec.delta
        } else {
            -self.spec.delta
        };
        let (min, max) = (self.spec.min_value, self.spec.max_value);
        let previous = self
            .last_value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.saturating_add(step).clamp(min, max))
            })
            .unwrap_or_else(|last| last);
        previous.saturating_add(step).clamp(min, max)
    }

    async fn run(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                FlowState::Running => {}
                FlowState::Paused => {
                    if rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                FlowState::Idle | FlowState::Stopped => break,
            }

            let Some((values, collect_ms, publish_ms)) = self.collect_window(&mut rx).await else {
                debug!("sensor {} window interrupted", self.spec.id);
                continue;
            };
            if let Err(e) = self.publish_window(values, collect_ms, publish_ms) {
                error!("sensor {} flow failed: {}", self.spec.id, e);
                self.state.send_replace(FlowState::Stopped);
                break;
            }
        }
        info!("sensor {} flow loop exited", self.spec.id);
    }

    /// Samples until the publish budget is spent. `None` if the flow left
    /// `Running` meanwhile.
    async fn collect_window(
        &self,
        rx: &mut watch::Receiver<FlowState>,
    ) -> Option<(Vec<i64>, i64, i64)> {
        let Intervals {
            collect_ms,
            publish_ms,
        } = *self.intervals.lock();

        let mut values = Vec::new();
        let mut budget = publish_ms;
        while budget >= 0 {
            values.push(self.next_value());
            let deadline = Instant::now() + Duration::from_millis(collect_ms.max(0) as u64);
            if !wait_while_running(rx, deadline).await {
                return None;
            }
            budget -= collect_ms;
        }
        Some((values, collect_ms, publish_ms))
    }

    fn publish_window(
        &self,
        values: Vec<i64>,
        collect_ms: i64,
        publish_ms: i64,
    ) -> Result<(), TransportError> {
        let Some(connection) = self.connection.read().clone() else {
            warn!("sensor {} has no connection, window dropped", self.spec.id);
            return Ok(());
        };

        let payload =
            build_flow_response(&self.device_id, &self.spec.id, publish_ms, collect_ms, &values);
        self.tracker.publish_and_track(
            connection.as_ref(),
            &topics::device_response(&self.device_id),
            &self.spec.id,
            &payload,
            QoS::ExactlyOnce,
        )?;

        if let Some(log) = &self.message_log {
            log.submit(DataRecord::new(&self.device_id, &self.spec.id, values));
        }
        Ok(())
    }
}

/// Sleeps until `deadline` unless the flow leaves `Running`.
async fn wait_while_running(rx: &mut watch::Receiver<FlowState>, deadline: Instant) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = rx.changed() => {
                if changed.is_err() || *rx.borrow_and_update() != FlowState::Running {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::LatencyContext;
    use crate::transport::{next_delivery_token, DeliveryToken};

    #[derive(Default)]
    struct Capture {
        published: Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
    }

    impl Connection for Capture {
        fn publish(&self, topic: &str, payload: &[u8], _qos: QoS) -> Result<DeliveryToken, TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.published
                .lock()
                .push((topic.to_string(), String::from_utf8_lossy(payload).into_owned()));
            Ok(next_delivery_token())
        }

        fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<(), TransportError> {
            Ok(())
        }

        fn unsubscribe(&self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn sensor(collect: i64, publish: i64, min: i64, max: i64, delta: i64) -> Sensor {
        let spec = SensorSpec::new("temp", "thermometer", collect, publish, min, max, delta).unwrap();
        let tracker = Arc::new(RttTracker::new(LatencyContext::default(), Vec::new()));
        Sensor::new("sc01", spec, tracker, None)
    }

    fn bound(sensor: &Sensor) -> Arc<Capture> {
        let capture = Arc::new(Capture::default());
        sensor.bind(capture.clone());
        capture
    }

    #[test]
    fn test_values_stay_within_bounds() {
        let sensor = sensor(10, 30, 0, 3, 2);
        for _ in 0..200 {
            let value = sensor.current_value();
            assert!((0..=3).contains(&value));
            assert_eq!(value, sensor.last_value());
        }
    }

    #[test]
    fn test_degenerate_range_is_constant() {
        let sensor = sensor(10, 30, 7, 7, 5);
        assert_eq!(sensor.last_value(), 7);
        assert_eq!(sensor.current_value(), 7);
    }

    #[tokio::test]
    async fn test_non_positive_intervals_stop() {
        let sensor = sensor(0, 100, 0, 10, 1);
        sensor.start(None, None);
        assert_eq!(sensor.state(), FlowState::Stopped);
        assert_eq!(sensor.spawned_loops(), 0);
    }

    #[tokio::test]
    async fn test_explicit_intervals_replace_stored() {
        let sensor = sensor(0, 0, 0, 10, 1);
        sensor.start(Some(50), Some(200));
        assert_eq!(sensor.intervals(), (50, 200));
        assert_eq!(sensor.state(), FlowState::Running);
        sensor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_a_full_window() {
        let sensor = sensor(100, 300, 0, 100, 1);
        let capture = bound(&sensor);
        sensor.start(None, None);

        tokio::time::sleep(Duration::from_millis(450)).await;
        sensor.stop();

        let published = capture.published.lock();
        assert_eq!(published.len(), 1);
        let (topic, payload) = &published[0];
        assert_eq!(topic, "dev/sc01/RES");
        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["BODY"]["temp"].as_array().unwrap().len(), 4);
        assert_eq!(json["BODY"]["FLOW"]["collect"], 100);
        assert_eq!(json["BODY"]["FLOW"]["publish"], 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_discards_window_and_resume_reuses_loop() {
        let sensor = sensor(100, 300, 0, 100, 1);
        let capture = bound(&sensor);
        sensor.start(None, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        sensor.pause();
        assert_eq!(sensor.state(), FlowState::Paused);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(capture.published.lock().is_empty());

        sensor.start(None, None);
        assert_eq!(sensor.state(), FlowState::Running);
        tokio::time::sleep(Duration::from_millis(450)).await;
        sensor.stop();

        assert_eq!(capture.published.lock().len(), 1);
        assert_eq!(sensor.spawned_loops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_loop_and_restart_spawns_again() {
        let sensor = sensor(100, 300, 0, 100, 1);
        bound(&sensor);
        sensor.start(None, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sensor.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sensor.is_loop_alive());

        sensor.start(None, None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sensor.is_loop_alive());
        assert_eq!(sensor.spawned_loops(), 2);
        sensor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_stops_sensor() {
        let sensor = sensor(100, 100, 0, 100, 1);
        let capture = bound(&sensor);
        capture.fail.store(true, Ordering::SeqCst);
        sensor.start(None, None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sensor.state(), FlowState::Stopped);
        assert!(!sensor.is_loop_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_only_leaves_paused() {
        let sensor = sensor(100, 300, 0, 100, 1);
        bound(&sensor);
        assert!(!sensor.resume());
        assert_eq!(sensor.state(), FlowState::Idle);

        sensor.start(None, None);
        sensor.pause();
        assert!(sensor.resume());
        assert_eq!(sensor.state(), FlowState::Running);

        sensor.pause();
        sensor.stop();
        assert!(!sensor.resume());
        assert_eq!(sensor.state(), FlowState::Stopped);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sensor.is_loop_alive());
        assert_eq!(sensor.spawned_loops(), 1);
    }

    #[test]
    fn test_pause_and_stop_ignored_when_idle() {
        let sensor = sensor(100, 300, 0, 100, 1);
        sensor.pause();
        assert_eq!(sensor.state(), FlowState::Idle);
        sensor.stop();
        assert_eq!(sensor.state(), FlowState::Idle);
    }

    #[test]
    fn test_null_sensor_is_inert() {
        NULL_SENSOR.start(Some(10), Some(10));
        NULL_SENSOR.stop();
        assert!(NULL_SENSOR.is_null());
        assert_eq!(NULL_SENSOR.state(), FlowState::Idle);
    }
}
