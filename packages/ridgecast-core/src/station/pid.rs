//! Adaptive decode pacing against the tower buffer.
//!
//! A PID loop polls `GET /tower/buffer` and turns the fill ratio into a
//! sleep *adjustment* added to the engine's base period, never a
//! replacement sleep. Buffer low (positive error) slows decode so the
//! tower catches up; buffer high speeds it up so the tower drains.
//!
//! Disabled is the default and means a hard zero adjustment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol_constants::{
    FRAME_DURATION, PID_FAILURE_RESET_THRESHOLD, PID_INTEGRAL_WINDUP_LIMIT, PID_QUERY_TIMEOUT,
    PID_UPDATE_INTERVAL,
};

/// Hard clamp on the derivative term to keep one noisy sample from
/// spiking the sleep.
const MAX_D_TERM: f64 = 0.1;

/// PID loop tuning and endpoints.
#[derive(Debug, Clone)]
pub struct PidConfig {
    pub enabled: bool,
    pub target_ratio: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Sleep bounds in seconds; the adjustment is clamped to
    /// `[min_sleep − base, max_sleep − base]`.
    pub min_sleep: f64,
    pub max_sleep: f64,
    pub integral_windup_limit: f64,
    pub update_interval: Duration,
    pub query_timeout: Duration,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_ratio: 0.5,
            kp: 0.1,
            ki: 0.01,
            kd: 0.05,
            min_sleep: 0.0,
            max_sleep: 0.1,
            integral_windup_limit: PID_INTEGRAL_WINDUP_LIMIT,
            update_interval: PID_UPDATE_INTERVAL,
            query_timeout: PID_QUERY_TIMEOUT,
        }
    }
}

/// Controller metrics for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidMetrics {
    pub query_count: u64,
    pub query_failures: u64,
    pub limit_hits: u64,
    pub windup_events: u64,
}

struct PidState {
    last_ratio: Option<f64>,
    integral_sum: f64,
    previous_error: f64,
    last_update: Instant,
    last_adjustment: f64,
    consecutive_failures: u32,
    metrics: PidMetrics,
}

/// The shape of `GET /tower/buffer`.
#[derive(Debug, Deserialize)]
struct BufferStatus {
    ratio: f64,
}

/// Buffer-driven pacing controller.
pub struct BufferPid {
    config: PidConfig,
    state: Mutex<PidState>,
}

impl BufferPid {
    pub fn new(config: PidConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PidState {
                last_ratio: None,
                integral_sum: 0.0,
                previous_error: 0.0,
                last_update: Instant::now(),
                last_adjustment: 0.0,
                consecutive_failures: 0,
                metrics: PidMetrics::default(),
            }),
        }
    }

    /// Whether the loop is active.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> PidMetrics {
        self.state.lock().metrics
    }

    /// Current integral sum (tests and diagnostics).
    pub fn integral_sum(&self) -> f64 {
        self.state.lock().integral_sum
    }

    /// Feeds a poll result in: `Some(ratio)` from a successful query,
    /// `None` for a failed one.
    ///
    /// On failure the last ratio is retained; three consecutive failures
    /// reset the integral so stale error cannot keep accumulating.
    pub fn update_ratio(&self, ratio: Option<f64>) {
        let mut state = self.state.lock();
        state.metrics.query_count += 1;
        match ratio {
            Some(ratio) => {
                state.consecutive_failures = 0;
                state.last_ratio = Some(ratio.clamp(0.0, 1.0));
            }
            None => {
                state.metrics.query_failures += 1;
                state.consecutive_failures += 1;
                if state.consecutive_failures == PID_FAILURE_RESET_THRESHOLD {
                    log::debug!(
                        "[Pid] {PID_FAILURE_RESET_THRESHOLD} consecutive query failures, \
                         resetting integral"
                    );
                    state.integral_sum = 0.0;
                }
            }
        }
    }

    /// Computes the sleep adjustment (seconds, signed) for this iteration.
    ///
    /// Returns exactly 0.0 when disabled or before the first ratio.
    pub fn adjustment(&self) -> f64 {
        self.adjustment_at(Instant::now())
    }

    fn adjustment_at(&self, now: Instant) -> f64 {
        if !self.config.enabled {
            return 0.0;
        }

        let mut state = self.state.lock();
        let Some(ratio) = state.last_ratio else {
            return 0.0;
        };

        let error = self.config.target_ratio - ratio;
        let p_term = self.config.kp * error;

        let dt = now
            .saturating_duration_since(state.last_update)
            .as_secs_f64();

        let (i_term, d_term) = if dt <= 0.0 {
            (0.0, 0.0)
        } else {
            state.integral_sum += error * dt;
            if state.integral_sum.abs() > self.config.integral_windup_limit {
                state.integral_sum = self
                    .config
                    .integral_windup_limit
                    .copysign(state.integral_sum);
                state.metrics.windup_events += 1;
            }
            let i_term = self.config.ki * state.integral_sum;

            // Below 1ms the derivative divides by almost nothing; skip it
            let d_term = if dt < 0.001 {
                0.0
            } else {
                let raw = self.config.kd * (error - state.previous_error) / dt;
                raw.clamp(-MAX_D_TERM, MAX_D_TERM)
            };
            (i_term, d_term)
        };

        let base = FRAME_DURATION.as_secs_f64();
        let min_adjustment = self.config.min_sleep - base;
        let max_adjustment = self.config.max_sleep - base;
        let adjustment = (p_term + i_term + d_term).clamp(min_adjustment, max_adjustment);

        if adjustment == min_adjustment || adjustment == max_adjustment {
            state.metrics.limit_hits += 1;
        }

        state.previous_error = error;
        state.last_update = now;
        state.last_adjustment = adjustment;
        adjustment
    }

    /// Spawns the poll task against the tower's buffer endpoint.
    ///
    /// A disabled controller spawns nothing and the engine sees zero
    /// adjustments forever.
    pub fn start_poller(
        self: &Arc<Self>,
        tower_base_url: String,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            return None;
        }

        let pid = Arc::clone(self);
        let client = reqwest::Client::builder()
            .timeout(self.config.query_timeout)
            .build()
            .expect("reqwest client");
        let url = format!("{}/tower/buffer", tower_base_url.trim_end_matches('/'));
        let interval = self.config.update_interval;

        Some(tokio::spawn(async move {
            log::info!("[Pid] polling {url} every {interval:?}");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let ratio = match client.get(&url).send().await {
                            Ok(response) => match response.json::<BufferStatus>().await {
                                Ok(status) => Some(status.ratio),
                                Err(e) => {
                                    log::debug!("[Pid] bad buffer response: {e}");
                                    None
                                }
                            },
                            Err(e) => {
                                log::debug!("[Pid] buffer query failed: {e}");
                                None
                            }
                        };
                        pid.update_ratio(ratio);
                    }
                }
            }
            log::debug!("[Pid] poller stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> PidConfig {
        PidConfig {
            enabled: true,
            ..PidConfig::default()
        }
    }

    #[test]
    fn disabled_controller_always_returns_zero() {
        let pid = BufferPid::new(PidConfig::default());
        pid.update_ratio(Some(0.0));
        assert_eq!(pid.adjustment(), 0.0);
        pid.update_ratio(Some(1.0));
        assert_eq!(pid.adjustment(), 0.0);
    }

    #[test]
    fn no_ratio_yet_means_zero_adjustment() {
        let pid = BufferPid::new(enabled_config());
        assert_eq!(pid.adjustment(), 0.0);
    }

    #[test]
    fn low_buffer_slows_decode() {
        let pid = BufferPid::new(enabled_config());
        pid.update_ratio(Some(0.1)); // below target 0.5: error positive
        let adjustment = pid.adjustment();
        assert!(adjustment > 0.0, "expected positive (slower), got {adjustment}");
    }

    #[test]
    fn high_buffer_speeds_decode() {
        let pid = BufferPid::new(enabled_config());
        pid.update_ratio(Some(0.9)); // above target: error negative
        let adjustment = pid.adjustment();
        assert!(adjustment < 0.0, "expected negative (faster), got {adjustment}");
    }

    #[test]
    fn adjustment_respects_sleep_bounds() {
        let config = enabled_config();
        let base = FRAME_DURATION.as_secs_f64();
        let pid = BufferPid::new(config.clone());

        // Hammer one extreme for a while; the clamp must hold throughout
        for _ in 0..1000 {
            pid.update_ratio(Some(0.0));
            let adjustment = pid.adjustment_at(Instant::now());
            assert!(adjustment >= config.min_sleep - base - 1e-12);
            assert!(adjustment <= config.max_sleep - base + 1e-12);
        }
        assert!(pid.metrics().limit_hits > 0 || base + pid.adjustment() <= config.max_sleep);
    }

    #[test]
    fn integral_windup_is_limited() {
        let config = enabled_config();
        let pid = BufferPid::new(config.clone());

        let mut now = Instant::now();
        for _ in 0..200 {
            pid.update_ratio(Some(0.0)); // persistent max error
            now += Duration::from_secs(2);
            let _ = pid.adjustment_at(now);
        }
        assert!(pid.integral_sum().abs() <= config.integral_windup_limit + 1e-12);
        assert!(pid.metrics().windup_events > 0);
    }

    #[test]
    fn failures_retain_last_ratio_then_reset_integral() {
        let pid = BufferPid::new(enabled_config());

        let mut now = Instant::now();
        pid.update_ratio(Some(0.1));
        now += Duration::from_millis(500);
        let _ = pid.adjustment_at(now);
        assert!(pid.integral_sum() != 0.0);

        // Two failures: last ratio retained, integral untouched
        pid.update_ratio(None);
        pid.update_ratio(None);
        assert!(pid.integral_sum() != 0.0);
        now += Duration::from_millis(500);
        assert!(pid.adjustment_at(now) != 0.0, "last ratio drives the output");

        // Third consecutive failure resets the integral
        pid.update_ratio(None);
        assert_eq!(pid.integral_sum(), 0.0);
        assert_eq!(pid.metrics().query_failures, 3);
    }

    #[test]
    fn derivative_suppressed_for_tiny_dt() {
        let config = PidConfig {
            kp: 0.0,
            ki: 0.0,
            kd: 100.0, // an unclamped derivative would dominate
            ..enabled_config()
        };
        let pid = BufferPid::new(config);

        let now = Instant::now();
        pid.update_ratio(Some(0.1));
        let _ = pid.adjustment_at(now + Duration::from_millis(500));
        // dt of 100µs: derivative must be suppressed, not exploded
        pid.update_ratio(Some(0.9));
        let adjustment = pid.adjustment_at(now + Duration::from_micros(100) + Duration::from_millis(500));
        assert_eq!(adjustment, 0.0);
    }

    #[test]
    fn ratio_is_clamped_to_unit_range() {
        let pid = BufferPid::new(enabled_config());
        pid.update_ratio(Some(7.5));
        assert_eq!(pid.state.lock().last_ratio, Some(1.0));
        pid.update_ratio(Some(-2.0));
        assert_eq!(pid.state.lock().last_ratio, Some(0.0));
    }
}
