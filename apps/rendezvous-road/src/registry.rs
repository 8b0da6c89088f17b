use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConfigError;
use rendezvous_proto::{ReadinessStatus, Role};

/// Identifies one accepted channel for its whole lifetime.
pub type ConnectionId = Uuid;

pub fn generate_connection_id() -> ConnectionId {
    Uuid::new_v4()
}

/// Work item for a channel's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Status(ReadinessStatus),
    /// Frame text forwarded exactly as received from another peer.
    Relay(String),
    /// Close the channel. `announce` sends the close sentinel first.
    Shutdown { announce: bool },
}

/// A registered channel.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub connection: ConnectionId,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

impl Endpoint {
    pub fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { connection, tx }
    }

    /// False once the writer task behind this endpoint has gone away.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Roles that must all be present, and the subset of them told "ready".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRule {
    required: BTreeSet<Role>,
    notify: BTreeSet<Role>,
}

impl PairingRule {
    /// Returns `None` unless both sets are non-empty and `notify` is a
    /// subset of `required`.
    pub fn new(
        required: impl IntoIterator<Item = Role>,
        notify: impl IntoIterator<Item = Role>,
    ) -> Option<Self> {
        let required: BTreeSet<Role> = required.into_iter().collect();
        let notify: BTreeSet<Role> = notify.into_iter().collect();
        if required.is_empty() || notify.is_empty() || !notify.is_subset(&required) {
            return None;
        }
        Some(Self { required, notify })
    }

    /// Rule that notifies every role it requires.
    pub fn symmetric(roles: impl IntoIterator<Item = Role>) -> Self {
        let required: BTreeSet<Role> = roles.into_iter().collect();
        Self {
            notify: required.clone(),
            required,
        }
    }

    pub fn requires(&self, role: &Role) -> bool {
        self.required.contains(role)
    }

    pub fn notifies(&self, role: &Role) -> bool {
        self.notify.contains(role)
    }

    fn missing<'a>(&'a self, present: &HashMap<Role, Endpoint>) -> Vec<&'a Role> {
        self.required
            .iter()
            .filter(|role| !present.contains_key(*role))
            .collect()
    }
}

/// What happens when a role is claimed while another channel holds it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The newer channel wins; the older one is told to close.
    #[default]
    Replace,
    /// The claim is refused while the holder's channel is still open.
    Reject,
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ConflictPolicy::Replace),
            "reject" => Ok(ConflictPolicy::Reject),
            _ => Err(ConfigError::ConflictPolicy(value.to_string())),
        }
    }
}

/// Why a role claim was refused.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("role {0} is not part of any pairing rule")]
    UnknownRole(Role),
    #[error("role {0} is already held by an open channel")]
    RoleConflict(Role),
}

/// Outcome of a successful [`Registry::register`].
#[derive(Debug)]
pub enum Registration {
    Inserted,
    /// The same channel announced the same role again.
    Refreshed,
    /// Another channel held the role; it is returned so it can be closed.
    Replaced(Endpoint),
}

/// A message bound for one registered channel.
#[derive(Debug)]
pub struct Delivery {
    pub role: Role,
    pub connection: ConnectionId,
    pub message: Outbound,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Delivery {
    pub(crate) fn new(role: &Role, endpoint: &Endpoint, message: Outbound) -> Self {
        Self {
            role: role.clone(),
            connection: endpoint.connection,
            message,
            tx: endpoint.tx.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&self.message, Outbound::Status(status) if status.is_ready())
    }

    /// Queues the message; a closed channel is logged, never an error.
    pub fn send(self) -> bool {
        let Delivery {
            role,
            connection,
            message,
            tx,
        } = self;
        match tx.send(message) {
            Ok(()) => true,
            Err(_) => {
                warn!(role = %role, %connection, "channel closed; message dropped");
                false
            }
        }
    }
}

/// Sends every delivery, returning how many were queued.
pub fn deliver_all(deliveries: Vec<Delivery>) -> usize {
    deliveries
        .into_iter()
        .map(Delivery::send)
        .filter(|sent| *sent)
        .count()
}

/// Role → channel map plus the pairing rules evaluated over it.
#[derive(Debug)]
pub struct Registry {
    rules: Vec<PairingRule>,
    policy: ConflictPolicy,
    endpoints: HashMap<Role, Endpoint>,
}

enum Claim {
    Insert,
    Refresh,
    Replace,
    Conflict,
}

impl Registry {
    pub fn new(rules: Vec<PairingRule>, policy: ConflictPolicy) -> Self {
        Self {
            rules,
            policy,
            endpoints: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &[PairingRule] {
        &self.rules
    }

    pub fn is_known_role(&self, role: &Role) -> bool {
        self.rules.iter().any(|rule| rule.requires(role))
    }

    pub fn register(
        &mut self,
        role: Role,
        endpoint: Endpoint,
    ) -> Result<Registration, RegistryError> {
        if !self.is_known_role(&role) {
            return Err(RegistryError::UnknownRole(role));
        }

        let claim = match self.endpoints.get(&role) {
            None => Claim::Insert,
            Some(current) if current.connection == endpoint.connection => Claim::Refresh,
            Some(current) if current.is_open() && self.policy == ConflictPolicy::Reject => {
                Claim::Conflict
            }
            Some(_) => Claim::Replace,
        };

        match claim {
            Claim::Conflict => Err(RegistryError::RoleConflict(role)),
            Claim::Insert => {
                debug!(role = %role, connection = %endpoint.connection, "role registered");
                self.endpoints.insert(role, endpoint);
                Ok(Registration::Inserted)
            }
            Claim::Refresh => {
                self.endpoints.insert(role, endpoint);
                Ok(Registration::Refreshed)
            }
            Claim::Replace => {
                debug!(role = %role, connection = %endpoint.connection, "role re-registered");
                match self.endpoints.insert(role, endpoint) {
                    Some(previous) => Ok(Registration::Replaced(previous)),
                    None => Ok(Registration::Inserted),
                }
            }
        }
    }

    /// Removes `role` only while it is still owned by `connection`.
    pub fn unregister(&mut self, role: &Role, connection: ConnectionId) -> bool {
        if self.owner(role) != Some(connection) {
            return false;
        }
        self.endpoints.remove(role).is_some()
    }

    pub fn owner(&self, role: &Role) -> Option<ConnectionId> {
        self.endpoints.get(role).map(|endpoint| endpoint.connection)
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.endpoints.contains_key(role)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Registered roles in sorted order.
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.endpoints.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub(crate) fn endpoints(&self) -> impl Iterator<Item = (&Role, &Endpoint)> {
        self.endpoints.iter()
    }

    /// Status messages for the current membership.
    ///
    /// Satisfied rules are visited first, in order, and send `ready` to their
    /// notify roles. Rules short by exactly one role are visited next and send
    /// `waiting for <role>` to the roles of that rule that are present. A role
    /// is addressed at most once per evaluation.
    pub fn compute_readiness(&self) -> Vec<Delivery> {
        let mut addressed: HashSet<&Role> = HashSet::new();
        let mut deliveries = Vec::new();

        for rule in &self.rules {
            if !rule.missing(&self.endpoints).is_empty() {
                continue;
            }
            for role in &rule.notify {
                if addressed.contains(role) {
                    continue;
                }
                if let Some(endpoint) = self.endpoints.get(role) {
                    addressed.insert(role);
                    deliveries.push(Delivery::new(
                        role,
                        endpoint,
                        Outbound::Status(ReadinessStatus::Ready),
                    ));
                }
            }
        }

        for rule in &self.rules {
            let missing = rule.missing(&self.endpoints);
            let [absent] = missing.as_slice() else {
                continue;
            };
            let status = ReadinessStatus::WaitingFor((*absent).clone());
            for role in &rule.required {
                if addressed.contains(role) {
                    continue;
                }
                if let Some(endpoint) = self.endpoints.get(role) {
                    addressed.insert(role);
                    deliveries.push(Delivery::new(
                        role,
                        endpoint,
                        Outbound::Status(status.clone()),
                    ));
                }
            }
        }

        deliveries
    }

    /// The `waiting for` half of [`Registry::compute_readiness`]; sent after a
    /// departure so that nobody is told "ready" twice.
    pub fn waiting_notices(&self) -> Vec<Delivery> {
        self.compute_readiness()
            .into_iter()
            .filter(|delivery| !delivery.is_ready())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Peer {
        endpoint: Endpoint,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn peer() -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        Peer {
            endpoint: Endpoint::new(generate_connection_id(), tx),
            rx,
        }
    }

    fn role(name: &str) -> Role {
        Role::new(name)
    }

    fn pair_registry(policy: ConflictPolicy) -> Registry {
        Registry::new(vec![PairingRule::symmetric([role("a"), role("b")])], policy)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn statuses(deliveries: &[Delivery]) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = deliveries
            .iter()
            .map(|d| match &d.message {
                Outbound::Status(status) => (d.role.to_string(), status.to_string()),
                other => panic!("unexpected delivery {other:?}"),
            })
            .collect();
        out.sort();
        out
    }

    #[test_timeout::timeout]
    fn complete_rule_sends_one_ready_to_each_role() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let mut a = peer();
        let mut b = peer();
        registry.register(role("a"), a.endpoint.clone()).unwrap();
        registry.register(role("b"), b.endpoint.clone()).unwrap();

        let deliveries = registry.compute_readiness();
        assert_eq!(
            statuses(&deliveries),
            vec![("a".into(), "ready".into()), ("b".into(), "ready".into())]
        );
        assert_eq!(deliver_all(deliveries), 2);
        assert_eq!(drain(&mut a.rx), vec![Outbound::Status(ReadinessStatus::Ready)]);
        assert_eq!(drain(&mut b.rx), vec![Outbound::Status(ReadinessStatus::Ready)]);
    }

    #[test_timeout::timeout]
    fn lone_role_is_told_who_is_missing() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let a = peer();
        registry.register(role("a"), a.endpoint.clone()).unwrap();

        let deliveries = registry.compute_readiness();
        assert_eq!(
            statuses(&deliveries),
            vec![("a".into(), "waiting for b".into())]
        );
    }

    #[test_timeout::timeout]
    fn satisfied_rule_outranks_earlier_partial_rule() {
        let mut registry = Registry::new(
            vec![
                PairingRule::symmetric([role("browser"), role("robotino")]),
                PairingRule::symmetric([role("answerClient"), role("robotino")]),
            ],
            ConflictPolicy::Replace,
        );
        registry.register(role("robotino"), peer().endpoint).unwrap();
        assert_eq!(
            statuses(&registry.compute_readiness()),
            vec![("robotino".into(), "waiting for browser".into())]
        );

        registry.register(role("answerClient"), peer().endpoint).unwrap();
        assert_eq!(
            statuses(&registry.compute_readiness()),
            vec![
                ("answerClient".into(), "ready".into()),
                ("robotino".into(), "ready".into())
            ]
        );
    }

    #[test_timeout::timeout]
    fn notify_set_limits_ready_recipients() {
        let rule = PairingRule::new([role("cam"), role("viewer")], [role("viewer")]).unwrap();
        let mut registry = Registry::new(vec![rule], ConflictPolicy::Replace);
        registry.register(role("cam"), peer().endpoint).unwrap();
        registry.register(role("viewer"), peer().endpoint).unwrap();

        assert_eq!(
            statuses(&registry.compute_readiness()),
            vec![("viewer".into(), "ready".into())]
        );
    }

    #[test_timeout::timeout]
    fn unknown_roles_are_refused() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let err = registry.register(role("mallory"), peer().endpoint).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownRole(r) if r == role("mallory")));
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn last_registration_wins_under_replace() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let first = peer();
        let second = peer();
        registry.register(role("a"), first.endpoint.clone()).unwrap();
        let outcome = registry.register(role("a"), second.endpoint.clone()).unwrap();

        match outcome {
            Registration::Replaced(previous) => {
                assert_eq!(previous.connection, first.endpoint.connection)
            }
            other => panic!("expected replacement, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.owner(&role("a")), Some(second.endpoint.connection));
    }

    #[test_timeout::timeout]
    fn reject_policy_only_yields_to_closed_channels() {
        let mut registry = pair_registry(ConflictPolicy::Reject);
        let first = peer();
        let second = peer();
        registry.register(role("a"), first.endpoint.clone()).unwrap();

        let err = registry.register(role("a"), second.endpoint.clone()).unwrap_err();
        assert!(matches!(err, RegistryError::RoleConflict(_)));
        assert_eq!(registry.owner(&role("a")), Some(first.endpoint.connection));

        drop(first.rx);
        assert!(matches!(
            registry.register(role("a"), second.endpoint.clone()),
            Ok(Registration::Replaced(_))
        ));
        assert_eq!(registry.owner(&role("a")), Some(second.endpoint.connection));
    }

    #[test_timeout::timeout]
    fn same_channel_may_announce_twice() {
        let mut registry = pair_registry(ConflictPolicy::Reject);
        let a = peer();
        registry.register(role("a"), a.endpoint.clone()).unwrap();
        assert!(matches!(
            registry.register(role("a"), a.endpoint.clone()),
            Ok(Registration::Refreshed)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn stale_connection_cannot_unregister_successor() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let first = peer();
        let second = peer();
        registry.register(role("a"), first.endpoint.clone()).unwrap();
        registry.register(role("a"), second.endpoint.clone()).unwrap();

        assert!(!registry.unregister(&role("a"), first.endpoint.connection));
        assert!(registry.contains(&role("a")));
        assert!(registry.unregister(&role("a"), second.endpoint.connection));
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn membership_never_holds_two_channels_per_role() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let peers: Vec<Peer> = (0..6).map(|_| peer()).collect();
        let names = ["a", "b", "a", "a", "b", "a"];

        for (peer, name) in peers.iter().zip(names) {
            registry.register(role(name), peer.endpoint.clone()).unwrap();
            assert!(registry.len() <= 2);
            assert_eq!(registry.owner(&role(name)), Some(peer.endpoint.connection));
        }
        registry.unregister(&role("a"), peers[5].endpoint.connection);
        assert_eq!(registry.roles(), vec![role("b")]);
    }

    #[test_timeout::timeout]
    fn departure_only_produces_waiting_notices() {
        let mut registry = Registry::new(
            vec![
                PairingRule::symmetric([role("browser"), role("robotino")]),
                PairingRule::symmetric([role("answerClient"), role("robotino")]),
            ],
            ConflictPolicy::Replace,
        );
        let robot = peer();
        let browser = peer();
        let recorder = peer();
        registry.register(role("robotino"), robot.endpoint.clone()).unwrap();
        registry.register(role("browser"), browser.endpoint.clone()).unwrap();
        registry.register(role("answerClient"), recorder.endpoint.clone()).unwrap();

        registry.unregister(&role("browser"), browser.endpoint.connection);
        // robotino and answerClient still satisfy the second rule.
        assert!(registry.waiting_notices().is_empty());

        registry.unregister(&role("robotino"), robot.endpoint.connection);
        assert_eq!(
            statuses(&registry.waiting_notices()),
            vec![("answerClient".into(), "waiting for robotino".into())]
        );
    }

    #[test_timeout::timeout]
    fn failed_send_does_not_stop_other_deliveries() {
        let mut registry = pair_registry(ConflictPolicy::Replace);
        let a = peer();
        let mut b = peer();
        registry.register(role("a"), a.endpoint.clone()).unwrap();
        registry.register(role("b"), b.endpoint.clone()).unwrap();
        drop(a.rx);

        assert_eq!(deliver_all(registry.compute_readiness()), 1);
        assert_eq!(drain(&mut b.rx), vec![Outbound::Status(ReadinessStatus::Ready)]);
    }

    #[test_timeout::timeout]
    fn conflict_policy_parses_case_insensitively() {
        assert_eq!("Reject".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Reject);
        assert_eq!(" replace".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Replace);
        assert!("evict".parse::<ConflictPolicy>().is_err());
    }
}
