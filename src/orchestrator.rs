//! The Blackboard Orchestrator (§4.1): runs a detection policy's detectors
//! in parallel waves, sharing a per-request blackboard, honouring
//! priority, timeouts, and per-detector circuit-breaker state, with
//! quorum-based early exit.

use crate::blackboard::Blackboard;
use crate::detector::{Contribution, Detector, Verdict, Wave};
use crate::envelope::RequestEnvelope;
use crate::error::Result;
use crate::ledger::DetectionLedger;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Why the orchestrator stopped before every wave ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EarlyExitVerdict {
    VerifiedGoodBot,
    VerifiedBadBot,
    Whitelisted,
    QuorumReached,
    Timeout,
    /// A wave's deadline expired with detectors still outstanding and
    /// `continue_on_wave_failure` was `false` (§4.1).
    WaveFailure,
}

/// One wave's scheduling policy, supplied by the detection policy.
#[derive(Debug, Clone)]
pub struct WaveSpec {
    pub wave: Wave,
    pub timeout_ms: u64,
    pub continue_on_wave_failure: bool,
}

/// Orchestrator-wide knobs that are not policy-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Overall deadline for the whole `detect` call.
    pub global_timeout_ms: u64,
    /// Cap on detectors run concurrently within one wave.
    pub max_parallel_detectors: usize,
    /// Confidence at which further detectors cannot change the outcome.
    pub quorum_confidence_threshold: f64,
    pub enable_quorum_exit: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_timeout_ms: 150,
            max_parallel_detectors: 8,
            quorum_confidence_threshold: 0.9,
            enable_quorum_exit: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Builder mirroring the teacher's fluent `OrchestratorBuilder` convention.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn global_timeout_ms(mut self, ms: u64) -> Self {
        self.config.global_timeout_ms = ms;
        self
    }

    pub fn max_parallel_detectors(mut self, n: usize) -> Self {
        self.config.max_parallel_detectors = n;
        self
    }

    pub fn quorum_confidence_threshold(mut self, threshold: f64) -> Self {
        self.config.quorum_confidence_threshold = threshold;
        self
    }

    pub fn enable_quorum_exit(mut self, enabled: bool) -> Self {
        self.config.enable_quorum_exit = enabled;
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

/// Rolling-window failure-rate circuit breaker configuration (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub window_size: usize,
    pub failure_rate_threshold: f64,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_rate_threshold: 0.5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    /// Cooldown elapsed; the next call is a trial call.
    HalfOpen,
}

struct CircuitBreakerState {
    window: VecDeque<bool>,
    state: CircuitState,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            state: CircuitState::Closed,
            opened_at: None,
            config,
        }
    }

    fn record(&mut self, success: bool) {
        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);

        match self.state {
            CircuitState::HalfOpen if success => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                self.window.clear();
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
            }
            _ => {
                let failures = self.window.iter().filter(|ok| !**ok).count();
                let rate = failures as f64 / self.window.len().max(1) as f64;
                if self.window.len() >= 3 && rate > self.config.failure_rate_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }

    /// Returns true if the detector may be invoked right now.
    fn permits_call(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_millis(self.config.cooldown_ms) {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Read-only snapshot of a circuit breaker's state, for health surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub detector_name: String,
    pub open: bool,
    pub recent_failure_count: usize,
    pub recent_call_count: usize,
}

/// Owns per-detector circuit-breaker state across requests and runs a
/// detection policy's detectors wave by wave for one request.
pub struct Orchestrator {
    config: OrchestratorConfig,
    breakers: DashMap<String, Mutex<CircuitBreakerState>>,
}

/// Outcome of one `detect` call: the ledger plus why the pipeline stopped.
#[derive(Debug)]
pub struct DetectionOutcome {
    pub ledger: DetectionLedger,
    pub early_exit: bool,
    pub early_exit_verdict: Option<EarlyExitVerdict>,
    pub total_processing_time_ms: u64,
    /// The request's blackboard, handed back so the aggregator can pull
    /// "important" signals into `AggregatedEvidence::signals`.
    pub blackboard: Blackboard,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn circuit_snapshot(&self, detector_name: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.get(detector_name).map(|entry| {
            let guard = entry.lock();
            CircuitBreakerSnapshot {
                detector_name: detector_name.to_string(),
                open: guard.state != CircuitState::Closed,
                recent_failure_count: guard.window.iter().filter(|ok| !**ok).count(),
                recent_call_count: guard.window.len(),
            }
        })
    }

    fn ensure_breaker(&self, name: &str) {
        if !self.breakers.contains_key(name) {
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Mutex::new(CircuitBreakerState::new(self.config.circuit_breaker.clone())));
        }
    }

    /// Run `detectors` (already grouped into waves per `wave_specs`) against
    /// one request, returning a finalised ledger. Detector failures,
    /// timeouts, and cancellation are absorbed here and never propagate as
    /// an `Err`.
    #[instrument(skip(self, envelope, detectors, cancel), fields(request_id = %envelope.request_id))]
    pub async fn detect(
        &self,
        envelope: &RequestEnvelope,
        detectors: &[(WaveSpec, Vec<Arc<dyn Detector>>)],
        cancel: CancellationToken,
    ) -> Result<DetectionOutcome> {
        let started = Instant::now();
        let blackboard = Blackboard::new();
        let mut ledger = DetectionLedger::new(envelope.request_id);
        let global_deadline = Duration::from_millis(self.config.global_timeout_ms);

        let mut waves: Vec<&(WaveSpec, Vec<Arc<dyn Detector>>)> = detectors.iter().collect();
        waves.sort_by_key(|(spec, _)| spec.wave);

        let mut outcome_exit: Option<EarlyExitVerdict> = None;

        for (spec, wave_detectors) in waves {
            if cancel.is_cancelled() {
                outcome_exit = Some(EarlyExitVerdict::Timeout);
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= global_deadline {
                warn!(wave = spec.wave, "global detection deadline exceeded");
                outcome_exit = Some(EarlyExitVerdict::Timeout);
                break;
            }
            let remaining_global = global_deadline - elapsed;
            let wave_budget = Duration::from_millis(spec.timeout_ms).min(remaining_global);

            let (contributions, wave_expired) = self
                .run_wave(envelope, &blackboard, wave_detectors, wave_budget, &cancel)
                .await;

            if let Some(verdict) = Self::find_short_circuit(&contributions) {
                for c in contributions {
                    ledger.push(c);
                }
                outcome_exit = Some(verdict);
                break;
            }
            for c in contributions {
                ledger.push(c);
            }

            if wave_expired && !spec.continue_on_wave_failure {
                warn!(wave = spec.wave, "wave deadline expired with detectors still outstanding, stopping per continueOnWaveFailure=false");
                outcome_exit = Some(EarlyExitVerdict::WaveFailure);
                break;
            }

            if self.config.enable_quorum_exit {
                let running_p = quick_probability_estimate(ledger.entries());
                if running_p >= self.config.quorum_confidence_threshold {
                    info!(wave = spec.wave, p = running_p, "quorum threshold reached, exiting early");
                    outcome_exit = Some(EarlyExitVerdict::QuorumReached);
                    break;
                }
            }
        }

        let early_exit = outcome_exit.is_some();
        Ok(DetectionOutcome {
            ledger,
            early_exit,
            early_exit_verdict: outcome_exit,
            total_processing_time_ms: started.elapsed().as_millis() as u64,
            blackboard,
        })
    }

    /// Run one wave's detectors concurrently (capped by
    /// `max_parallel_detectors`), absorbing per-detector timeouts/failures,
    /// and stop collecting once `wave_budget` elapses — whatever has
    /// finished by then is what the wave contributes. Returns whether the
    /// wave's own deadline expired with detectors still outstanding (§4.1
    /// "on expiry, cancel the wave's outstanding detectors, emit a reason,
    /// optionally continue"), which `detect` uses to honor
    /// `WaveSpec::continue_on_wave_failure`.
    async fn run_wave<'a>(
        &self,
        envelope: &'a RequestEnvelope,
        blackboard: &'a Blackboard,
        wave_detectors: &'a [Arc<dyn Detector>],
        wave_budget: Duration,
        cancel: &CancellationToken,
    ) -> (Vec<Contribution>, bool) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_detectors.max(1)));
        let wave_cancel = cancel.child_token();

        let mut in_flight = FuturesUnordered::new();
        for detector in wave_detectors {
            let name = detector.meta().name.clone();
            self.ensure_breaker(&name);
            if !self.circuit_permits(&name) {
                warn!(detector = name, "circuit open, skipping");
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let cancel = wave_cancel.clone();
            let per_detector_timeout = detector
                .meta()
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(wave_budget);

            in_flight.push(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = tokio::time::timeout(
                    per_detector_timeout,
                    detector.contribute(envelope, blackboard, &cancel),
                )
                .await;
                (name, result)
            });
        }

        let mut contributions = Vec::new();
        let mut wave_expired = false;
        let deadline = tokio::time::sleep(wave_budget);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    wave_cancel.cancel();
                    wave_expired = !in_flight.is_empty();
                    break;
                }
                next = in_flight.next() => {
                    match next {
                        None => break,
                        Some((name, outcome)) => {
                            self.absorb_detector_outcome(&name, outcome, &mut contributions);
                        }
                    }
                }
            }
        }

        (contributions, wave_expired)
    }

    fn absorb_detector_outcome(
        &self,
        name: &str,
        outcome: std::result::Result<Result<Option<Contribution>>, tokio::time::error::Elapsed>,
        contributions: &mut Vec<Contribution>,
    ) {
        match outcome {
            Ok(Ok(Some(contribution))) => {
                debug!(detector = name, delta = contribution.confidence_delta, "contribution received");
                self.record_circuit_outcome(name, true);
                contributions.push(contribution);
            }
            Ok(Ok(None)) => {
                self.record_circuit_outcome(name, true);
            }
            Ok(Err(err)) => {
                warn!(detector = name, error = %err, "detector failed");
                self.record_circuit_outcome(name, false);
            }
            Err(_elapsed) => {
                warn!(detector = name, "detector timed out");
                self.record_circuit_outcome(name, false);
            }
        }
    }

    fn circuit_permits(&self, name: &str) -> bool {
        self.breakers
            .get(name)
            .map(|entry| entry.lock().permits_call())
            .unwrap_or(true)
    }

    fn record_circuit_outcome(&self, name: &str, success: bool) {
        if let Some(entry) = self.breakers.get(name) {
            entry.lock().record(success);
        }
    }

    fn find_short_circuit(contributions: &[Contribution]) -> Option<EarlyExitVerdict> {
        contributions.iter().find_map(|c| match c.verdict {
            Some(Verdict::VerifiedGoodBot) => Some(EarlyExitVerdict::VerifiedGoodBot),
            Some(Verdict::VerifiedBadBot) => Some(EarlyExitVerdict::VerifiedBadBot),
            Some(Verdict::Whitelisted) => Some(EarlyExitVerdict::Whitelisted),
            None => None,
        })
    }
}

/// Cheap probability estimate used only for the quorum early-exit check;
/// the real calculation (with policy weight overrides) lives in
/// `crate::aggregator`.
fn quick_probability_estimate(contributions: &[Contribution]) -> f64 {
    let mut total_weight = 0.0;
    let mut weighted_sum = 0.0;
    for c in contributions {
        total_weight += c.weight;
        weighted_sum += c.weight * c.confidence_delta;
    }
    if total_weight <= 0.0 {
        return 0.0;
    }
    let s = weighted_sum / total_weight;
    0.5 + 0.5 * (3.0_f64 * s).tanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Category, DetectorMeta};
    use crate::error::Error;

    struct StaticDetector {
        meta: DetectorMeta,
        delta: f64,
        verdict: Option<Verdict>,
        sleep_ms: u64,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Detector for StaticDetector {
        fn meta(&self) -> &DetectorMeta {
            &self.meta
        }

        async fn contribute(
            &self,
            _envelope: &RequestEnvelope,
            _blackboard: &Blackboard,
            _cancel: &CancellationToken,
        ) -> Result<Option<Contribution>> {
            if self.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            }
            if self.fail {
                return Err(Error::detector_failure(&self.meta.name, "boom"));
            }
            let mut c = Contribution::new(&self.meta.name, self.meta.category.clone(), self.delta, 1.0, "test");
            if let Some(v) = self.verdict {
                c = c.with_verdict(v);
            }
            Ok(Some(c))
        }
    }

    fn envelope() -> RequestEnvelope {
        RequestEnvelope::new("GET", "/", "203.0.113.10")
    }

    fn meta(name: &str, category: Category, wave: Wave) -> DetectorMeta {
        DetectorMeta {
            name: name.to_string(),
            category,
            wave,
            default_weight: 1.0,
            expected_latency_ms: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn single_wave_collects_all_contributions() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let d1: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: meta("ua", Category::UserAgent, 1),
            delta: -0.4,
            verdict: None,
            sleep_ms: 0,
            fail: false,
        });
        let waves = vec![(WaveSpec { wave: 1, timeout_ms: 50, continue_on_wave_failure: true }, vec![d1])];
        let outcome = orchestrator.detect(&envelope(), &waves, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.ledger.len(), 1);
        assert!(!outcome.early_exit);
    }

    #[tokio::test]
    async fn verified_bad_bot_short_circuits() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let d1: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: meta("ua", Category::UserAgent, 1),
            delta: 0.9,
            verdict: Some(Verdict::VerifiedBadBot),
            sleep_ms: 0,
            fail: false,
        });
        let d2: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: meta("ip", Category::IpReputation, 2),
            delta: 0.1,
            verdict: None,
            sleep_ms: 0,
            fail: false,
        });
        let waves = vec![
            (WaveSpec { wave: 1, timeout_ms: 50, continue_on_wave_failure: true }, vec![d1]),
            (WaveSpec { wave: 2, timeout_ms: 50, continue_on_wave_failure: true }, vec![d2]),
        ];
        let outcome = orchestrator.detect(&envelope(), &waves, CancellationToken::new()).await.unwrap();
        assert!(outcome.early_exit);
        assert_eq!(outcome.early_exit_verdict, Some(EarlyExitVerdict::VerifiedBadBot));
        assert_eq!(outcome.ledger.len(), 1, "wave 2 must not run after short-circuit");
    }

    #[tokio::test]
    async fn wave_timeout_finalises_partial_ledger() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let slow: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: meta("slow", Category::Behavioral, 1),
            delta: 0.5,
            verdict: None,
            sleep_ms: 200,
            fail: false,
        });
        let waves = vec![(WaveSpec { wave: 1, timeout_ms: 10, continue_on_wave_failure: true }, vec![slow])];
        let outcome = orchestrator.detect(&envelope(), &waves, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.ledger.len(), 0, "slow detector must not contribute after its wave times out");
    }

    #[tokio::test]
    async fn wave_timeout_with_continue_on_wave_failure_false_stops_further_waves() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let mut slow_meta = meta("slow", Category::Behavioral, 1);
        slow_meta.timeout_ms = Some(1_000);
        let slow: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: slow_meta,
            delta: 0.5,
            verdict: None,
            sleep_ms: 200,
            fail: false,
        });
        let d2: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: meta("ip", Category::IpReputation, 2),
            delta: 0.1,
            verdict: None,
            sleep_ms: 0,
            fail: false,
        });
        let waves = vec![
            (WaveSpec { wave: 1, timeout_ms: 10, continue_on_wave_failure: false }, vec![slow]),
            (WaveSpec { wave: 2, timeout_ms: 50, continue_on_wave_failure: true }, vec![d2]),
        ];
        let outcome = orchestrator.detect(&envelope(), &waves, CancellationToken::new()).await.unwrap();
        assert!(outcome.early_exit);
        assert_eq!(outcome.early_exit_verdict, Some(EarlyExitVerdict::WaveFailure));
        assert_eq!(outcome.ledger.len(), 0, "wave 2 must not run after wave 1's deadline expired");
    }

    #[tokio::test]
    async fn detector_failure_is_absorbed_not_propagated() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let failing: Arc<dyn Detector> = Arc::new(StaticDetector {
            meta: meta("broken", Category::UserAgent, 1),
            delta: 0.0,
            verdict: None,
            sleep_ms: 0,
            fail: true,
        });
        let waves = vec![(WaveSpec { wave: 1, timeout_ms: 50, continue_on_wave_failure: true }, vec![failing])];
        let outcome = orchestrator.detect(&envelope(), &waves, CancellationToken::new()).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.unwrap().ledger.len(), 0);
    }

    #[test]
    fn circuit_breaker_opens_after_failure_rate_exceeded() {
        let mut state = CircuitBreakerState::new(CircuitBreakerConfig {
            window_size: 10,
            failure_rate_threshold: 0.5,
            cooldown_ms: 10_000,
        });
        for _ in 0..3 {
            state.record(false);
        }
        assert_eq!(state.state, CircuitState::Open);
        assert!(!state.permits_call());
    }
}
