//! Fleet coordination: machine registry, heartbeats, placement.
//!
//! Cross-machine state is weakly consistent and reconciled by periodic
//! heartbeats, not by a quorum protocol. The registry is a single
//! state-store record; every operation loads, mutates and atomically
//! rewrites it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::placement::{any_capacity, least_loaded};
use crate::core::types::{Event, MachineNode, MachineRole, MachineStatus};
use crate::io::config::ConductorConfig;
use crate::io::state_store::{NotFoundError, StateStore};

const REGISTRY_KEY: &str = "fleet";

/// Join-token lifetime.
const TOKEN_TTL_MINUTES: i64 = 15;

/// A join attempt presented a missing, expired or already-used token.
#[derive(Debug)]
pub struct InvalidJoinTokenError;

impl fmt::Display for InvalidJoinTokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "join token is missing, expired or already used")
    }
}

impl std::error::Error for InvalidJoinTokenError {}

/// No eligible machine (or insufficient host headroom) for admission.
/// A deferral, not a fatal operator-facing error.
#[derive(Debug)]
pub struct CapacityUnavailableError;

impl fmt::Display for CapacityUnavailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no fleet capacity: no eligible machine or host headroom too low")
    }
}

impl std::error::Error for CapacityUnavailableError {}

/// Outstanding short-lived join token, stored as a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    pub digest: String,
    pub expires_at: DateTime<Utc>,
}

/// Persisted fleet registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetRegistry {
    #[serde(default)]
    pub nodes: BTreeMap<String, MachineNode>,
    #[serde(default)]
    pub join_tokens: Vec<JoinToken>,
}

/// Host CPU/memory headroom, in percent free.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Headroom {
    pub cpu_free_pct: f64,
    pub mem_free_pct: f64,
}

/// Source of local headroom telemetry.
///
/// `None` means the platform exposes no telemetry; admission treats that
/// as sufficient headroom rather than deadlocking on missing data.
pub trait HeadroomProbe {
    fn headroom(&self) -> Option<Headroom>;
}

/// Probe backed by `/proc/loadavg` and `/proc/meminfo`.
pub struct ProcHeadroomProbe;

impl HeadroomProbe for ProcHeadroomProbe {
    fn headroom(&self) -> Option<Headroom> {
        let cpu_free_pct = read_cpu_free_pct()?;
        let mem_free_pct = read_mem_free_pct()?;
        Some(Headroom {
            cpu_free_pct,
            mem_free_pct,
        })
    }
}

fn read_cpu_free_pct() -> Option<f64> {
    let loadavg = fs::read_to_string("/proc/loadavg").ok()?;
    let load: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cpus = std::thread::available_parallelism().ok()?.get() as f64;
    Some(((1.0 - load / cpus) * 100.0).clamp(0.0, 100.0))
}

fn read_mem_free_pct() -> Option<f64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    Some((available? / total? * 100.0).clamp(0.0, 100.0))
}

/// Fixed-headroom probe for tests and platforms without `/proc`.
pub struct StaticHeadroomProbe(pub Option<Headroom>);

impl HeadroomProbe for StaticHeadroomProbe {
    fn headroom(&self) -> Option<Headroom> {
        self.0
    }
}

/// Registry operations plus capacity/placement decisions.
pub struct FleetCoordinator<'a> {
    pub config: &'a ConductorConfig,
    pub store: &'a StateStore,
    pub probe: &'a dyn HeadroomProbe,
}

impl<'a> FleetCoordinator<'a> {
    pub fn registry(&self) -> Result<FleetRegistry> {
        match self.store.get(REGISTRY_KEY) {
            Ok(registry) => Ok(registry),
            Err(err) if err.downcast_ref::<NotFoundError>().is_some() => {
                Ok(FleetRegistry::default())
            }
            Err(err) => Err(err),
        }
    }

    fn save(&self, registry: &FleetRegistry) -> Result<()> {
        self.store.put(REGISTRY_KEY, registry)
    }

    /// Register the local machine as fleet leader if absent.
    pub fn ensure_local_node(&self, now: DateTime<Utc>) -> Result<()> {
        let mut registry = self.registry()?;
        if registry.nodes.contains_key(&self.config.machine_name) {
            return Ok(());
        }
        registry.nodes.insert(
            self.config.machine_name.clone(),
            MachineNode {
                name: self.config.machine_name.clone(),
                host: "localhost".to_string(),
                role: MachineRole::Leader,
                max_workers: self.config.max_workers,
                active_workers: 0,
                last_heartbeat_at: now,
                status: MachineStatus::Online,
            },
        );
        self.save(&registry)?;
        info!(name = %self.config.machine_name, "local leader registered");
        Ok(())
    }

    /// Mint a short-lived join token; returns the plaintext once.
    pub fn mint_join_token(&self, now: DateTime<Utc>) -> Result<String> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let mut registry = self.registry()?;
        registry.join_tokens.push(JoinToken {
            digest: digest(&token),
            expires_at: now + ChronoDuration::minutes(TOKEN_TTL_MINUTES),
        });
        self.save(&registry)?;
        Ok(token)
    }

    /// Join flow: a new node presents a token and a declared worker cap.
    #[instrument(skip_all, fields(name, host))]
    pub fn join(
        &self,
        name: &str,
        host: &str,
        max_workers: u32,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut registry = self.registry()?;
        let presented = digest(token);
        let position = registry
            .join_tokens
            .iter()
            .position(|t| t.digest == presented && t.expires_at > now)
            .ok_or_else(|| anyhow!(InvalidJoinTokenError))?;
        // Tokens are single-use.
        registry.join_tokens.remove(position);
        registry.join_tokens.retain(|t| t.expires_at > now);

        registry.nodes.insert(
            name.to_string(),
            MachineNode {
                name: name.to_string(),
                host: host.to_string(),
                role: MachineRole::Worker,
                max_workers,
                active_workers: 0,
                last_heartbeat_at: now,
                status: MachineStatus::Online,
            },
        );
        self.save(&registry)?;
        self.store.append_event(
            &Event::new("fleet.joined", None, now)
                .with("machine", name)
                .with("max_workers", max_workers),
        )?;
        info!(name, "machine joined fleet");
        Ok(())
    }

    pub fn leave(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut registry = self.registry()?;
        if registry.nodes.remove(name).is_none() {
            return Err(anyhow!("unknown machine {name:?}"));
        }
        self.save(&registry)?;
        self.store
            .append_event(&Event::new("fleet.left", None, now).with("machine", name))?;
        Ok(())
    }

    /// Record a heartbeat: `(active_workers, timestamp)` push.
    pub fn heartbeat(&self, name: &str, active_workers: u32, now: DateTime<Utc>) -> Result<()> {
        let mut registry = self.registry()?;
        let node = registry
            .nodes
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown machine {name:?}"))?;
        node.active_workers = active_workers;
        node.last_heartbeat_at = now;
        node.status = MachineStatus::Online;
        self.save(&registry)?;
        debug!(name, active_workers, "heartbeat");
        Ok(())
    }

    /// Re-derive node statuses from heartbeat age.
    ///
    /// Returns the names of nodes that just went offline; their in-flight
    /// runs are orphans for the daemon to reconcile.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut registry = self.registry()?;
        let timeout = ChronoDuration::seconds(self.config.heartbeat_timeout_secs as i64);
        let degraded_after =
            ChronoDuration::seconds(2 * self.config.heartbeat_interval_secs as i64);
        let mut newly_offline = Vec::new();
        for node in registry.nodes.values_mut() {
            let age = now - node.last_heartbeat_at;
            let next = if age > timeout {
                MachineStatus::Offline
            } else if age > degraded_after {
                MachineStatus::Degraded
            } else {
                MachineStatus::Online
            };
            if next == MachineStatus::Offline && node.status != MachineStatus::Offline {
                warn!(name = %node.name, age_secs = age.num_seconds(), "machine offline");
                newly_offline.push(node.name.clone());
                self.store.append_event(
                    &Event::new("fleet.offline", None, now).with("machine", &node.name),
                )?;
            }
            node.status = next;
        }
        self.save(&registry)?;
        Ok(newly_offline)
    }

    /// Capacity gate for admission: some eligible node AND local host
    /// headroom above the safety margins.
    pub fn has_capacity(&self, now: DateTime<Utc>) -> Result<bool> {
        self.refresh(now)?;
        let registry = self.registry()?;
        let nodes: Vec<MachineNode> = registry.nodes.values().cloned().collect();
        if !any_capacity(&nodes) {
            return Ok(false);
        }
        Ok(self.headroom_ok())
    }

    fn headroom_ok(&self) -> bool {
        match self.probe.headroom() {
            Some(headroom) => {
                headroom.cpu_free_pct >= self.config.min_cpu_headroom_pct
                    && headroom.mem_free_pct >= self.config.min_mem_headroom_pct
            }
            // Missing telemetry never blocks admission.
            None => true,
        }
    }

    /// Place a run on the least-loaded eligible machine, occupying one
    /// worker slot for the run's lifetime.
    pub fn place(&self, run_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let mut registry = self.registry()?;
        let nodes: Vec<MachineNode> = registry.nodes.values().cloned().collect();
        let Some(chosen) = least_loaded(&nodes).map(|n| n.name.clone()) else {
            return Ok(None);
        };
        if let Some(node) = registry.nodes.get_mut(&chosen) {
            node.active_workers += 1;
        }
        self.save(&registry)?;
        self.store.append_event(
            &Event::new("run.placed", Some(run_id), now).with("machine", &chosen),
        )?;
        info!(run_id, machine = %chosen, "run placed");
        Ok(Some(chosen))
    }

    /// Release a worker slot when a run reaches a terminal status.
    pub fn release_slot(&self, machine: &str) -> Result<()> {
        let mut registry = self.registry()?;
        if let Some(node) = registry.nodes.get_mut(machine) {
            node.active_workers = node.active_workers.saturating_sub(1);
        }
        self.save(&registry)?;
        Ok(())
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0).unwrap()
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        config: ConductorConfig,
        store: StateStore,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let store = StateStore::new(
                temp.path().join("state"),
                temp.path().join("events.jsonl"),
            );
            Self {
                _temp: temp,
                config: ConductorConfig::default(),
                store,
            }
        }

        fn coordinator<'a>(&'a self, probe: &'a dyn HeadroomProbe) -> FleetCoordinator<'a> {
            FleetCoordinator {
                config: &self.config,
                store: &self.store,
                probe,
            }
        }
    }

    const NO_PROBE: StaticHeadroomProbe = StaticHeadroomProbe(None);

    #[test]
    fn join_requires_valid_token() {
        let fixture = Fixture::new();
        let fleet = fixture.coordinator(&NO_PROBE);

        let err = fleet
            .join("worker-1", "w1.local", 4, "bogus", at(0))
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidJoinTokenError>().is_some());

        let token = fleet.mint_join_token(at(0)).expect("mint");
        fleet
            .join("worker-1", "w1.local", 4, &token, at(10))
            .expect("join");
        let registry = fleet.registry().expect("registry");
        assert!(registry.nodes.contains_key("worker-1"));
    }

    #[test]
    fn join_tokens_are_single_use_and_expire() {
        let fixture = Fixture::new();
        let fleet = fixture.coordinator(&NO_PROBE);

        let token = fleet.mint_join_token(at(0)).expect("mint");
        fleet
            .join("worker-1", "w1.local", 4, &token, at(10))
            .expect("join");
        let err = fleet
            .join("worker-2", "w2.local", 4, &token, at(20))
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidJoinTokenError>().is_some());

        let expired = fleet.mint_join_token(at(0)).expect("mint");
        let err = fleet
            .join("worker-3", "w3.local", 4, &expired, at(16 * 60))
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidJoinTokenError>().is_some());
    }

    #[test]
    fn missed_heartbeats_mark_node_offline() {
        // Scenario D precondition: three missed intervals exceed the
        // 90 s timeout with the default 30 s interval.
        let fixture = Fixture::new();
        let fleet = fixture.coordinator(&NO_PROBE);

        let token = fleet.mint_join_token(at(0)).expect("mint");
        fleet
            .join("worker-1", "w1.local", 2, &token, at(0))
            .expect("join");
        fleet.heartbeat("worker-1", 1, at(0)).expect("beat");

        let offline = fleet.refresh(at(91)).expect("refresh");
        assert_eq!(offline, vec!["worker-1".to_string()]);
        let registry = fleet.registry().expect("registry");
        assert_eq!(
            registry.nodes["worker-1"].status,
            MachineStatus::Offline
        );
        // Already-offline nodes are not reported twice.
        let again = fleet.refresh(at(120)).expect("refresh");
        assert!(again.is_empty());
    }

    #[test]
    fn capacity_requires_an_eligible_node() {
        let fixture = Fixture::new();
        let fleet = fixture.coordinator(&NO_PROBE);
        assert!(!fleet.has_capacity(at(0)).expect("capacity"));

        fleet.ensure_local_node(at(0)).expect("local");
        assert!(fleet.has_capacity(at(1)).expect("capacity"));
    }

    #[test]
    fn capacity_respects_headroom_margins() {
        let fixture = Fixture::new();
        let starved = StaticHeadroomProbe(Some(Headroom {
            cpu_free_pct: 5.0,
            mem_free_pct: 50.0,
        }));
        let fleet = fixture.coordinator(&starved);
        fleet.ensure_local_node(at(0)).expect("local");
        assert!(!fleet.has_capacity(at(1)).expect("capacity"));
    }

    #[test]
    fn place_occupies_a_slot_on_least_loaded_node() {
        let fixture = Fixture::new();
        let fleet = fixture.coordinator(&NO_PROBE);
        fleet.ensure_local_node(at(0)).expect("local");
        let token = fleet.mint_join_token(at(0)).expect("mint");
        fleet
            .join("worker-1", "w1.local", 4, &token, at(0))
            .expect("join");
        fleet.heartbeat("worker-1", 0, at(1)).expect("beat");
        fleet
            .heartbeat(&fixture.config.machine_name, 2, at(1))
            .expect("beat");

        let placed = fleet.place("42", at(2)).expect("place");
        assert_eq!(placed.as_deref(), Some("worker-1"));
        let registry = fleet.registry().expect("registry");
        assert_eq!(registry.nodes["worker-1"].active_workers, 1);

        fleet.release_slot("worker-1").expect("release");
        let registry = fleet.registry().expect("registry");
        assert_eq!(registry.nodes["worker-1"].active_workers, 0);
    }
}
