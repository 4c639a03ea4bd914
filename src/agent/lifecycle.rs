//! Agent lifecycle as a pure state machine.
//!
//! Each handler maps `(state, event)` to the next state plus a list of side
//! effects for the agent service to execute. Nothing in here touches storage
//! or the network, so every transition can be tested directly.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

/// Lifecycle of one agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
  /// Constructed, install not started
  Parsed,
  Installing,
  /// Installed, waiting for clients of an older version to go away
  Waiting,
  Activating,
  Active,
  /// Superseded by a newer version, or lost an activation race
  Redundant,
}

impl fmt::Display for AgentState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      AgentState::Parsed => "parsed",
      AgentState::Installing => "installing",
      AgentState::Waiting => "waiting",
      AgentState::Activating => "activating",
      AgentState::Active => "active",
      AgentState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Inputs to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
  Install,
  /// Manifest pre-caching finished
  Installed,
  /// `SKIP_WAITING` from the control channel
  SkipWaiting,
  /// No open client is controlled by an older version any more
  ClientsReleased,
  /// Activation effects finished
  Activated,
  /// Another version became active
  Superseded,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
  /// Fetch the static manifest into the static partition
  PrecacheManifest,
  /// Check whether old clients are gone; emits `ClientsReleased` if so
  CheckClients,
  /// Delete partitions that do not belong to this version
  DeleteStalePartitions,
  /// Opportunistic eviction sweep
  SweepExpired,
  /// Take control of every open client
  ClaimClients,
  /// Publish this version as the active one
  PublishActive,
  /// Feed another event back into the machine
  Emit(LifecycleEvent),
}

/// Knobs that change which transitions are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecyclePolicy {
  /// Go straight from installed to activating
  pub skip_waiting: bool,
}

/// Result of a handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
  pub next: AgentState,
  pub effects: Vec<Effect>,
}

impl Transition {
  fn to(next: AgentState, effects: Vec<Effect>) -> Self {
    Self { next, effects }
  }
}

type Handler = fn(AgentState, LifecyclePolicy) -> Option<Transition>;

/// Which handler runs for each event.
const DISPATCH: [(LifecycleEvent, Handler); 6] = [
  (LifecycleEvent::Install, on_install),
  (LifecycleEvent::Installed, on_installed),
  (LifecycleEvent::SkipWaiting, on_skip_waiting),
  (LifecycleEvent::ClientsReleased, on_clients_released),
  (LifecycleEvent::Activated, on_activated),
  (LifecycleEvent::Superseded, on_superseded),
];

/// Apply `event` to `state`. `None` means the event is not accepted in that
/// state and must be ignored.
pub fn transition(
  state: AgentState,
  event: LifecycleEvent,
  policy: LifecyclePolicy,
) -> Option<Transition> {
  DISPATCH
    .iter()
    .find(|(kind, _)| *kind == event)
    .and_then(|(_, handler)| handler(state, policy))
}

fn activation_effects() -> Vec<Effect> {
  vec![
    Effect::DeleteStalePartitions,
    Effect::SweepExpired,
    Effect::ClaimClients,
    Effect::PublishActive,
    Effect::Emit(LifecycleEvent::Activated),
  ]
}

fn on_install(state: AgentState, _: LifecyclePolicy) -> Option<Transition> {
  match state {
    AgentState::Parsed => Some(Transition::to(
      AgentState::Installing,
      vec![
        Effect::PrecacheManifest,
        Effect::Emit(LifecycleEvent::Installed),
      ],
    )),
    _ => None,
  }
}

fn on_installed(state: AgentState, policy: LifecyclePolicy) -> Option<Transition> {
  match state {
    AgentState::Installing if policy.skip_waiting => {
      Some(Transition::to(AgentState::Activating, activation_effects()))
    }
    AgentState::Installing => Some(Transition::to(
      AgentState::Waiting,
      vec![Effect::CheckClients],
    )),
    _ => None,
  }
}

fn on_skip_waiting(state: AgentState, _: LifecyclePolicy) -> Option<Transition> {
  match state {
    AgentState::Waiting => Some(Transition::to(AgentState::Activating, activation_effects())),
    _ => None,
  }
}

fn on_clients_released(state: AgentState, policy: LifecyclePolicy) -> Option<Transition> {
  on_skip_waiting(state, policy)
}

fn on_activated(state: AgentState, _: LifecyclePolicy) -> Option<Transition> {
  match state {
    AgentState::Activating => Some(Transition::to(AgentState::Active, Vec::new())),
    _ => None,
  }
}

fn on_superseded(state: AgentState, _: LifecyclePolicy) -> Option<Transition> {
  match state {
    AgentState::Redundant => None,
    _ => Some(Transition::to(AgentState::Redundant, Vec::new())),
  }
}

/// The version currently allowed to be active, shared by every agent
/// instance of one origin.
///
/// Agents register their version when built; a later registration is a newer
/// version. Activation runs under [`ActiveVersion::lock_activation`], and a
/// version never replaces a newer one that already published. An agent that
/// sees a different version here is redundant.
#[derive(Clone)]
pub struct ActiveVersion {
  inner: Arc<Shared>,
}

struct Shared {
  tx: watch::Sender<Option<String>>,
  activation: Mutex<()>,
  registered: std::sync::Mutex<Vec<String>>,
}

impl ActiveVersion {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(None);
    Self {
      inner: Arc::new(Shared {
        tx,
        activation: Mutex::new(()),
        registered: std::sync::Mutex::new(Vec::new()),
      }),
    }
  }

  fn registered(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
    self
      .inner
      .registered
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  /// Record `version` as the newest known version. Registering a version
  /// twice keeps its first position.
  pub fn register(&self, version: &str) {
    let mut registered = self.registered();
    if !registered.iter().any(|v| v == version) {
      registered.push(version.to_string());
    }
  }

  /// Whether `version` was registered after `than`. Unregistered versions
  /// are never newer than anything.
  pub fn is_newer(&self, version: &str, than: &str) -> bool {
    let registered = self.registered();
    let position = |v: &str| registered.iter().position(|r| r == v);
    match (position(version), position(than)) {
      (Some(a), Some(b)) => a > b,
      (Some(_), None) => true,
      _ => false,
    }
  }

  pub fn current(&self) -> Option<String> {
    self.inner.tx.borrow().clone()
  }

  /// Whether the published version is newer than `version`.
  pub fn outranks(&self, version: &str) -> bool {
    self
      .current()
      .is_some_and(|current| self.is_newer(&current, version))
  }

  /// Serializes activation across every agent sharing this cell.
  pub async fn lock_activation(&self) -> MutexGuard<'_, ()> {
    self.inner.activation.lock().await
  }

  /// Publish `version` as active. Refused, returning `false`, when a newer
  /// version already published.
  pub fn publish(&self, version: &str) -> bool {
    if self.outranks(version) {
      return false;
    }
    self.inner.tx.send_replace(Some(version.to_string()));
    true
  }
}

impl Default for ActiveVersion {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const WAIT: LifecyclePolicy = LifecyclePolicy {
    skip_waiting: false,
  };
  const SKIP: LifecyclePolicy = LifecyclePolicy { skip_waiting: true };

  #[test]
  fn test_install_precaches_then_reports_installed() {
    let t = transition(AgentState::Parsed, LifecycleEvent::Install, WAIT).unwrap();
    assert_eq!(t.next, AgentState::Installing);
    assert_eq!(
      t.effects,
      vec![
        Effect::PrecacheManifest,
        Effect::Emit(LifecycleEvent::Installed)
      ]
    );
  }

  #[test]
  fn test_installed_waits_unless_skipping() {
    let waiting = transition(AgentState::Installing, LifecycleEvent::Installed, WAIT).unwrap();
    assert_eq!(waiting.next, AgentState::Waiting);

    let skipping = transition(AgentState::Installing, LifecycleEvent::Installed, SKIP).unwrap();
    assert_eq!(skipping.next, AgentState::Activating);
    assert_eq!(skipping.effects[0], Effect::DeleteStalePartitions);
  }

  #[test]
  fn test_skip_waiting_only_from_waiting() {
    let t = transition(AgentState::Waiting, LifecycleEvent::SkipWaiting, WAIT).unwrap();
    assert_eq!(t.next, AgentState::Activating);
    assert_eq!(
      t.effects.last(),
      Some(&Effect::Emit(LifecycleEvent::Activated))
    );

    assert!(transition(AgentState::Active, LifecycleEvent::SkipWaiting, WAIT).is_none());
    assert!(transition(AgentState::Installing, LifecycleEvent::SkipWaiting, WAIT).is_none());
  }

  #[test]
  fn test_full_path_reaches_active() {
    let mut state = AgentState::Parsed;
    let mut queue = vec![LifecycleEvent::Install];
    while let Some(event) = queue.pop() {
      let t = transition(state, event, SKIP).unwrap();
      state = t.next;
      for effect in t.effects {
        if let Effect::Emit(next) = effect {
          queue.push(next);
        }
      }
    }
    assert_eq!(state, AgentState::Active);
  }

  #[test]
  fn test_second_activation_is_ignored() {
    assert!(transition(AgentState::Active, LifecycleEvent::Activated, WAIT).is_none());
    assert!(transition(AgentState::Redundant, LifecycleEvent::ClientsReleased, WAIT).is_none());
  }

  #[test]
  fn test_superseded_from_any_live_state() {
    for state in [
      AgentState::Parsed,
      AgentState::Waiting,
      AgentState::Active,
    ] {
      let t = transition(state, LifecycleEvent::Superseded, WAIT).unwrap();
      assert_eq!(t.next, AgentState::Redundant);
    }
    assert!(transition(AgentState::Redundant, LifecycleEvent::Superseded, WAIT).is_none());
  }

  #[test]
  fn test_active_version_last_publish_wins() {
    let active = ActiveVersion::new();
    assert_eq!(active.current(), None);
    active.publish("v1");
    active.publish("v2");
    assert_eq!(active.current(), Some("v2".to_string()));
  }

  #[test]
  fn test_active_version_refuses_older_publish() {
    let active = ActiveVersion::new();
    active.register("v1");
    active.register("v2");
    active.register("v1");
    assert!(active.is_newer("v2", "v1"));
    assert!(!active.is_newer("v1", "v2"));
    assert!(active.is_newer("v2", "unknown"));

    assert!(active.publish("v2"));
    assert!(active.outranks("v1"));
    assert!(!active.publish("v1"));
    assert_eq!(active.current(), Some("v2".to_string()));
  }

  #[tokio::test]
  async fn test_activation_lock_is_shared_between_clones() {
    let active = ActiveVersion::new();
    let other = active.clone();
    let _held = active.lock_activation().await;
    assert!(other.inner.activation.try_lock().is_err());
  }
}
