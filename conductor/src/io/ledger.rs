//! Daily cost-budget ledger gating run admission.
//!
//! The budget is a soft gate on starting new runs, not a kill switch on
//! runs already admitted; the emergency brake is the only mechanism that
//! forcibly stops active runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::stats::{StageEstimate, gated_median};
use crate::core::types::{Event, STAGE_TEMPLATE};
use crate::io::state_store::write_atomic;

/// Admission was denied because the reservation would exceed the daily
/// limit. A deferral, not a fatal operator-facing error.
#[derive(Debug)]
pub struct BudgetExceededError {
    pub estimated_usd: f64,
}

impl std::fmt::Display for BudgetExceededError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "daily budget exceeded: estimate ${:.2} does not fit the remaining budget",
            self.estimated_usd
        )
    }
}

impl std::error::Error for BudgetExceededError {}

/// Fallbacks and gating for historical estimates.
#[derive(Debug, Clone, Copy)]
pub struct EstimateConfig {
    /// Below this sample count, configured defaults are used instead of
    /// a measured median.
    pub min_samples: usize,
    pub default_duration_s: f64,
    pub default_cost_usd: f64,
}

/// Persisted ledger state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// Day the running spend belongs to; spend resets on rollover.
    pub day: NaiveDate,
    pub spent_today_usd: f64,
    /// Outstanding admission reservations by run id, not yet spent.
    pub reservations: BTreeMap<String, f64>,
    pub per_run_spend_usd: BTreeMap<String, f64>,
}

/// Read-only budget view for dashboards and dry-run output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSummary {
    pub daily_limit_usd: f64,
    pub spent_today_usd: f64,
    pub reserved_usd: f64,
    pub remaining_usd: f64,
}

/// Process-wide spend tracker with a serialized reserve step.
///
/// `reserve` is a compare-and-increment under one mutex, then an atomic
/// persist, so two concurrent admissions can never both pass a stale
/// check. The daemon is the single admission writer per leader.
pub struct CostLedger {
    path: PathBuf,
    daily_limit_usd: f64,
    state: Mutex<BudgetState>,
}

impl CostLedger {
    /// Open the ledger, loading persisted state when present.
    pub fn open(path: impl Into<PathBuf>, daily_limit_usd: f64, now: DateTime<Utc>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("read ledger {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse ledger {}", path.display()))?
        } else {
            BudgetState {
                day: now.date_naive(),
                spent_today_usd: 0.0,
                reservations: BTreeMap::new(),
                per_run_spend_usd: BTreeMap::new(),
            }
        };
        Ok(Self {
            path,
            daily_limit_usd,
            state: Mutex::new(state),
        })
    }

    /// Admission check: optimistically reserve an estimated spend.
    ///
    /// Succeeds only if spend plus all outstanding reservations plus the
    /// new amount fit the daily limit. Returns `false` when the budget
    /// would be exceeded; the candidate is deferred, not failed.
    #[instrument(skip(self), fields(run_id, amount_usd))]
    pub fn reserve(&self, run_id: &str, amount_usd: f64, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock()?;
        roll_over_if_needed(&mut state, now);
        let reserved: f64 = state.reservations.values().sum();
        if state.spent_today_usd + reserved + amount_usd > self.daily_limit_usd {
            debug!(
                spent = state.spent_today_usd,
                reserved,
                amount_usd,
                limit = self.daily_limit_usd,
                "reservation refused"
            );
            return Ok(false);
        }
        state.reservations.insert(run_id.to_string(), amount_usd);
        self.persist(&state)?;
        info!(run_id, amount_usd, "reserved");
        Ok(true)
    }

    /// Reconcile a reservation to the true spend when a run completes or
    /// fails.
    #[instrument(skip(self), fields(run_id, actual_usd))]
    pub fn record(&self, run_id: &str, actual_usd: f64, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        roll_over_if_needed(&mut state, now);
        if state.reservations.remove(run_id).is_none() {
            warn!(run_id, "recording spend with no outstanding reservation");
        }
        state.spent_today_usd += actual_usd;
        *state
            .per_run_spend_usd
            .entry(run_id.to_string())
            .or_insert(0.0) += actual_usd;
        self.persist(&state)?;
        Ok(())
    }

    /// Drop a reservation without recording spend (admission was rolled
    /// back before the run started any billable work).
    pub fn release(&self, run_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.reservations.remove(run_id);
        self.persist(&state)?;
        Ok(())
    }

    /// Estimate duration and cost for one template stage.
    ///
    /// Duration is the median of that stage's `stage.completed` events.
    /// No per-stage cost events exist, so stage cost is the median of
    /// pipeline-level `pipeline.cost` events divided evenly across the
    /// template — a known approximation carried over from the original
    /// behavior. Below `min_samples` the configured defaults apply,
    /// flagged as a distinct source (a measured zero is still measured).
    pub fn estimate(&self, stage: &str, events: &[Event], cfg: &EstimateConfig) -> StageEstimate {
        let durations: Vec<f64> = events
            .iter()
            .filter(|e| e.event_type == "stage.completed")
            .filter(|e| e.payload.get("stage").is_some_and(|s| s == stage))
            .filter_map(|e| e.payload.get("duration_s")?.parse().ok())
            .collect();
        let pipeline_costs: Vec<f64> = events
            .iter()
            .filter(|e| e.event_type == "pipeline.cost")
            .filter_map(|e| e.payload.get("cost_usd")?.parse().ok())
            .collect();
        let stage_costs: Vec<f64> = pipeline_costs
            .iter()
            .map(|c| c / STAGE_TEMPLATE.len() as f64)
            .collect();

        let (duration_s, duration_source) =
            gated_median(&durations, cfg.min_samples, cfg.default_duration_s);
        let (cost_usd, cost_source) =
            gated_median(&stage_costs, cfg.min_samples, cfg.default_cost_usd);
        StageEstimate {
            duration_s,
            cost_usd,
            duration_source,
            cost_source,
            duration_samples: durations.len(),
            cost_samples: stage_costs.len(),
        }
    }

    /// Current budget view.
    pub fn summary(&self, now: DateTime<Utc>) -> Result<BudgetSummary> {
        let mut state = self.lock()?;
        roll_over_if_needed(&mut state, now);
        let reserved: f64 = state.reservations.values().sum();
        Ok(BudgetSummary {
            daily_limit_usd: self.daily_limit_usd,
            spent_today_usd: state.spent_today_usd,
            reserved_usd: reserved,
            remaining_usd: (self.daily_limit_usd - state.spent_today_usd - reserved).max(0.0),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BudgetState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("ledger mutex poisoned"))
    }

    fn persist(&self, state: &BudgetState) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(state).context("serialize ledger")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn roll_over_if_needed(state: &mut BudgetState, now: DateTime<Utc>) {
    let today = now.date_naive();
    if state.day != today {
        info!(from = %state.day, to = %today, "budget day rollover");
        state.day = today;
        state.spent_today_usd = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::EstimateSource;
    use chrono::TimeZone;

    fn cfg() -> EstimateConfig {
        EstimateConfig {
            min_samples: 3,
            default_duration_s: 300.0,
            default_cost_usd: 1.5,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, hour, 0, 0).unwrap()
    }

    fn ledger(temp: &tempfile::TempDir, limit: f64) -> CostLedger {
        CostLedger::open(temp.path().join("ledger.json"), limit, at(1, 0)).expect("open")
    }

    fn completed(stage: &str, duration_s: f64) -> Event {
        Event::new("stage.completed", Some("42"), at(1, 0))
            .with("stage", stage)
            .with("duration_s", duration_s)
    }

    fn cost(cost_usd: f64) -> Event {
        Event::new("pipeline.cost", Some("42"), at(1, 0)).with("cost_usd", cost_usd)
    }

    #[test]
    fn reserve_within_budget_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        assert!(ledger.reserve("1", 4.0, at(1, 1)).expect("reserve"));
        assert!(ledger.reserve("2", 4.0, at(1, 1)).expect("reserve"));
        assert!(!ledger.reserve("3", 4.0, at(1, 1)).expect("reserve"));
    }

    #[test]
    fn reserve_counts_outstanding_reservations() {
        // Scenario C: $10 limit, $9.50 spent, $1.00 estimate is refused.
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        assert!(ledger.reserve("1", 9.5, at(1, 1)).expect("reserve"));
        ledger.record("1", 9.5, at(1, 2)).expect("record");
        assert!(!ledger.reserve("2", 1.0, at(1, 3)).expect("reserve"));
    }

    #[test]
    fn record_trues_up_reservation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        assert!(ledger.reserve("1", 5.0, at(1, 1)).expect("reserve"));
        ledger.record("1", 2.5, at(1, 2)).expect("record");

        let summary = ledger.summary(at(1, 3)).expect("summary");
        assert_eq!(summary.spent_today_usd, 2.5);
        assert_eq!(summary.reserved_usd, 0.0);
        assert_eq!(summary.remaining_usd, 7.5);
    }

    #[test]
    fn spend_resets_on_day_rollover() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        assert!(ledger.reserve("1", 9.0, at(1, 1)).expect("reserve"));
        ledger.record("1", 9.0, at(1, 2)).expect("record");
        assert!(!ledger.reserve("2", 5.0, at(1, 3)).expect("reserve"));
        assert!(ledger.reserve("2", 5.0, at(2, 0)).expect("reserve"));
    }

    #[test]
    fn concurrent_reserves_never_exceed_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = std::sync::Arc::new(ledger(&temp, 10.0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger
                        .reserve(&format!("run-{i}"), 3.0, at(1, 1))
                        .expect("reserve")
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 3);
    }

    #[test]
    fn estimate_uses_median_durations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        let events = vec![
            completed("build", 100.0),
            completed("build", 300.0),
            completed("build", 200.0),
            completed("plan", 5.0),
        ];
        let estimate = ledger.estimate("build", &events, &cfg());
        assert_eq!(estimate.duration_s, 200.0);
        assert_eq!(estimate.duration_source, EstimateSource::Measured);
        assert_eq!(estimate.duration_samples, 3);
    }

    #[test]
    fn estimate_below_min_samples_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        let events = vec![completed("build", 100.0)];
        let estimate = ledger.estimate("build", &events, &cfg());
        assert_eq!(estimate.duration_s, 300.0);
        assert_eq!(estimate.duration_source, EstimateSource::Default);
    }

    #[test]
    fn estimate_divides_pipeline_cost_across_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(&temp, 10.0);
        let events = vec![cost(8.0), cost(8.0), cost(8.0)];
        let estimate = ledger.estimate("review", &events, &cfg());
        assert_eq!(estimate.cost_usd, 1.0);
        assert_eq!(estimate.cost_source, EstimateSource::Measured);
    }

    #[test]
    fn ledger_state_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.json");
        {
            let ledger = CostLedger::open(&path, 10.0, at(1, 0)).expect("open");
            assert!(ledger.reserve("1", 2.0, at(1, 1)).expect("reserve"));
            ledger.record("1", 2.0, at(1, 2)).expect("record");
        }
        let reopened = CostLedger::open(&path, 10.0, at(1, 3)).expect("reopen");
        let summary = reopened.summary(at(1, 3)).expect("summary");
        assert_eq!(summary.spent_today_usd, 2.0);
    }
}
