use colored::*;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Method;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::client::GatewayClient;
use crate::metrics::Metrics;
use crate::scenarios::Scenario;
use crate::types::ConfigError;

/// Counter bumped for every arrival-rate tick that found no idle worker.
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";

/// How often the controller recomputes the ramp target and an idle unit
/// rechecks whether it should resume.
const CONTROL_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

#[derive(Debug, Clone)]
pub enum ExecutorProfile {
    /// Linearly interpolates the unit count between consecutive stage targets.
    Ramping { start: usize, stages: Vec<Stage> },
    /// Fixed pool of units looping for a fixed duration.
    ConstantVus { vus: usize, duration: Duration },
    /// Fixed number of iteration starts per second over a pre-allocated pool;
    /// ticks with no idle worker are dropped, not queued.
    ConstantArrivalRate {
        rate_per_sec: u32,
        duration: Duration,
        pool: usize,
    },
}

impl ExecutorProfile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ExecutorProfile::Ramping { stages, .. } => {
                if stages.is_empty() {
                    return Err(ConfigError::EmptySchedule);
                }
                for (index, stage) in stages.iter().enumerate() {
                    if stage.duration.is_zero() {
                        return Err(ConfigError::ZeroDurationStage(index));
                    }
                }
                Ok(())
            }
            ExecutorProfile::ConstantVus { duration, .. } => {
                if duration.is_zero() {
                    return Err(ConfigError::ZeroDurationStage(0));
                }
                Ok(())
            }
            ExecutorProfile::ConstantArrivalRate {
                rate_per_sec,
                duration,
                pool,
            } => {
                if *rate_per_sec == 0 || *pool == 0 {
                    return Err(ConfigError::InvalidArrivalRate);
                }
                if duration.is_zero() {
                    return Err(ConfigError::ZeroDurationStage(0));
                }
                Ok(())
            }
        }
    }

    pub fn total_duration(&self) -> Duration {
        match self {
            ExecutorProfile::Ramping { stages, .. } => {
                stages.iter().map(|stage| stage.duration).sum()
            }
            ExecutorProfile::ConstantVus { duration, .. } => *duration,
            ExecutorProfile::ConstantArrivalRate { duration, .. } => *duration,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExecutorProfile::Ramping { start, stages } => {
                let mut lines = vec![format!(
                    "ramping: {} stages over {:?}, starting at {} units",
                    stages.len(),
                    self.total_duration(),
                    start
                )];
                let mut from = *start;
                for stage in stages {
                    lines.push(format!(
                        "  {:?}: {} -> {} units",
                        stage.duration, from, stage.target
                    ));
                    from = stage.target;
                }
                lines.join("\n")
            }
            ExecutorProfile::ConstantVus { vus, duration } => {
                format!("constant concurrency: {} units for {:?}", vus, duration)
            }
            ExecutorProfile::ConstantArrivalRate {
                rate_per_sec,
                duration,
                pool,
            } => format!(
                "constant arrival rate: {}/s for {:?}, pool of {} workers",
                rate_per_sec, duration, pool
            ),
        }
    }
}

/// Target unit count at a point in the schedule. Pure function of elapsed
/// time so the ramp curve is testable without spawning anything.
pub fn target_at(start: usize, stages: &[Stage], elapsed: Duration) -> usize {
    let mut from = start as f64;
    let mut offset = Duration::ZERO;
    for stage in stages {
        let end = offset + stage.duration;
        if elapsed < end {
            let progress = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
            return (from + (stage.target as f64 - from) * progress).round() as usize;
        }
        from = stage.target as f64;
        offset = end;
    }
    stages.last().map(|stage| stage.target).unwrap_or(start)
}

#[derive(Debug, Clone, Copy)]
pub struct ThinkTime {
    pub min: Duration,
    pub max: Duration,
}

impl ThinkTime {
    pub const NONE: ThinkTime = ThinkTime {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn from_secs_f64(min: f64, max: f64) -> Self {
        Self {
            min: Duration::from_secs_f64(min),
            max: Duration::from_secs_f64(max),
        }
    }

    pub async fn pause(&self, rng: &mut impl Rng) {
        if self.max.is_zero() {
            return;
        }
        let span = (self.max - self.min).as_secs_f64();
        let secs = self.min.as_secs_f64() + rng.gen::<f64>() * span;
        sleep(Duration::from_secs_f64(secs)).await;
    }
}

/// Process-wide hard-stop flag. Every unit observes it at its next loop
/// boundary and before each flow step; once set, no new calls go out.
pub struct RunState {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // first reason wins
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Aborted(String),
}

/// Drives the configured executor profile: spawns virtual users, ramps their
/// count, and tears everything down when the schedule ends or the run aborts.
pub struct Scheduler {
    client: Arc<GatewayClient>,
    metrics: Arc<Metrics>,
    run: Arc<RunState>,
    seed: u64,
}

impl Scheduler {
    pub fn new(
        client: Arc<GatewayClient>,
        metrics: Arc<Metrics>,
        run: Arc<RunState>,
        seed: u64,
    ) -> Self {
        Self {
            client,
            metrics,
            run,
            seed,
        }
    }

    pub async fn execute(
        &self,
        scenario: Arc<Scenario>,
        profile: &ExecutorProfile,
    ) -> Result<RunStatus, ConfigError> {
        profile.validate()?;

        self.preflight().await;
        if self.run.is_aborted() {
            return Ok(self.status());
        }

        println!(
            "{}",
            format!("🎯 Starting {}: {}", scenario.name, profile.describe()).blue()
        );

        match profile {
            ExecutorProfile::Ramping { start, stages } => {
                self.run_staged(scenario, *start, stages.clone()).await;
            }
            ExecutorProfile::ConstantVus { vus, duration } => {
                let stages = vec![Stage {
                    duration: *duration,
                    target: *vus,
                }];
                self.run_staged(scenario, *vus, stages).await;
            }
            ExecutorProfile::ConstantArrivalRate {
                rate_per_sec,
                duration,
                pool,
            } => {
                self.run_arrival_rate(scenario, *rate_per_sec, *duration, *pool)
                    .await;
            }
        }

        Ok(self.status())
    }

    fn status(&self) -> RunStatus {
        match self.run.abort_reason() {
            Some(reason) => RunStatus::Aborted(reason),
            None => RunStatus::Completed,
        }
    }

    /// Acquires one credential and probes service health before any unit
    /// starts. A token failure here aborts the run with zero traffic sent.
    async fn preflight(&self) {
        match self.client.auth().acquire().await {
            Ok(credential) => {
                println!(
                    "{}",
                    format!(
                        "✅ Token obtained ({}s of validity remaining)",
                        credential.remaining().as_secs()
                    )
                    .green()
                );
            }
            Err(err) => {
                println!("{}", format!("❌ Authentication failed: {}", err).red());
                self.run.abort(format!("authentication failed: {}", err));
                return;
            }
        }

        println!("{}", "🔗 Checking initial service state...".blue());
        for (service, path) in [
            ("gateway", "health"),
            ("orders", "orders/health"),
            ("payments", "payments/health"),
            ("products", "products/health"),
        ] {
            match self.client.send(Method::GET, path, None).await {
                Ok(response) if response.is_success() => {
                    println!("{}", format!("  ✓ {} is up", service).green());
                }
                Ok(response) => {
                    println!(
                        "{}",
                        format!("  ⚠ {} answered {}", service, response.status).yellow()
                    );
                }
                Err(err) => {
                    println!("{}", format!("  ⚠ {} unreachable: {}", service, err).yellow());
                }
            }
        }
    }

    async fn run_staged(&self, scenario: Arc<Scenario>, start: usize, stages: Vec<Stage>) {
        let total: Duration = stages.iter().map(|stage| stage.duration).sum();
        let begun = Instant::now();
        let deadline = begun + total;
        let target = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        loop {
            if self.run.is_aborted() {
                break;
            }
            let elapsed = begun.elapsed();
            if elapsed >= total {
                break;
            }
            let want = target_at(start, &stages, elapsed);
            target.store(want, Ordering::Relaxed);
            while handles.len() < want {
                let index = handles.len();
                handles.push(tokio::spawn(unit_loop(
                    index,
                    scenario.clone(),
                    self.client.clone(),
                    self.metrics.clone(),
                    self.run.clone(),
                    target.clone(),
                    deadline,
                    self.seed.wrapping_add(index as u64),
                )));
            }
            sleep(CONTROL_TICK).await;
        }

        // in-flight iterations finish; no new ones start past the deadline
        let _ = join_all(handles).await;
    }

    async fn run_arrival_rate(
        &self,
        scenario: Arc<Scenario>,
        rate_per_sec: u32,
        duration: Duration,
        pool: usize,
    ) {
        let workers = Arc::new(Semaphore::new(pool));
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate_per_sec as f64));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let begun = Instant::now();
        let mut handles = Vec::new();
        let mut sequence: u64 = 0;

        loop {
            if self.run.is_aborted() || begun.elapsed() >= duration {
                break;
            }
            ticker.tick().await;
            if self.run.is_aborted() || begun.elapsed() >= duration {
                break;
            }
            sequence += 1;
            match workers.clone().try_acquire_owned() {
                Ok(permit) => {
                    let scenario = scenario.clone();
                    let client = self.client.clone();
                    let metrics = self.metrics.clone();
                    let run = self.run.clone();
                    let seed = self.seed.wrapping_add(sequence);
                    handles.push(tokio::spawn(async move {
                        let mut rng = StdRng::seed_from_u64(seed);
                        if let Err(err) = scenario
                            .run_iteration(&client, &metrics, &run, &mut rng)
                            .await
                        {
                            run.abort(format!("authentication failed: {}", err));
                        }
                        drop(permit);
                    }));
                }
                Err(_) => {
                    // pool saturated: the tick is dropped, not queued
                    self.metrics.add_count(DROPPED_ITERATIONS, 1);
                }
            }
        }

        let _ = join_all(handles).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn unit_loop(
    index: usize,
    scenario: Arc<Scenario>,
    client: Arc<GatewayClient>,
    metrics: Arc<Metrics>,
    run: Arc<RunState>,
    target: Arc<AtomicUsize>,
    deadline: Instant,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    loop {
        if run.is_aborted() || Instant::now() >= deadline {
            break;
        }
        // ramped down below this unit's index: idle until ramped back up
        if index >= target.load(Ordering::Relaxed) {
            sleep(CONTROL_TICK).await;
            continue;
        }
        match scenario
            .run_iteration(&client, &metrics, &run, &mut rng)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                run.abort(format!("authentication failed: {}", err));
                break;
            }
        }
        if run.is_aborted() {
            break;
        }
        scenario.think_time.pause(&mut rng).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_stages() -> Vec<Stage> {
        vec![
            Stage {
                duration: Duration::from_secs(30),
                target: 20,
            },
            Stage {
                duration: Duration::from_secs(60),
                target: 20,
            },
        ]
    }

    #[test]
    fn ramp_interpolates_linearly_between_targets() {
        let stages = ramp_stages();
        assert_eq!(target_at(0, &stages, Duration::ZERO), 0);
        assert_eq!(target_at(0, &stages, Duration::from_secs(15)), 10);
        assert_eq!(target_at(0, &stages, Duration::from_secs(30)), 20);
        assert_eq!(target_at(0, &stages, Duration::from_secs(60)), 20);
        assert_eq!(target_at(0, &stages, Duration::from_secs(89)), 20);
    }

    #[test]
    fn ramp_holds_last_target_past_the_schedule() {
        let stages = ramp_stages();
        assert_eq!(target_at(0, &stages, Duration::from_secs(90)), 20);
        assert_eq!(target_at(0, &stages, Duration::from_secs(900)), 20);
    }

    #[test]
    fn ramp_down_reaches_zero() {
        let stages = vec![Stage {
            duration: Duration::from_secs(120),
            target: 0,
        }];
        assert_eq!(target_at(80, &stages, Duration::ZERO), 80);
        assert_eq!(target_at(80, &stages, Duration::from_secs(60)), 40);
        assert_eq!(target_at(80, &stages, Duration::from_secs(119)), 1);
        assert_eq!(target_at(80, &stages, Duration::from_secs(120)), 0);
    }

    #[test]
    fn constant_stage_is_flat_from_the_start() {
        let stages = vec![Stage {
            duration: Duration::from_secs(480),
            target: 25,
        }];
        assert_eq!(target_at(25, &stages, Duration::ZERO), 25);
        assert_eq!(target_at(25, &stages, Duration::from_secs(240)), 25);
    }

    #[test]
    fn profiles_validate_their_schedules() {
        assert!(matches!(
            ExecutorProfile::Ramping {
                start: 0,
                stages: vec![]
            }
            .validate(),
            Err(ConfigError::EmptySchedule)
        ));
        assert!(matches!(
            ExecutorProfile::ConstantArrivalRate {
                rate_per_sec: 0,
                duration: Duration::from_secs(1),
                pool: 5
            }
            .validate(),
            Err(ConfigError::InvalidArrivalRate)
        ));
        assert!(ExecutorProfile::ConstantVus {
            vus: 10,
            duration: Duration::from_secs(60)
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn abort_keeps_the_first_reason() {
        let run = RunState::new();
        assert!(!run.is_aborted());
        run.abort("authentication failed");
        run.abort("second failure");
        assert!(run.is_aborted());
        assert_eq!(run.abort_reason().unwrap(), "authentication failed");
    }
}
