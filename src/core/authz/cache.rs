// src/core/authz/cache.rs

//! The cache itself: a plain struct with explicit index maps and pure
//! mutation functions that return deltas, per the design notes — there's no
//! need for transactions here, only for the index maps to stay consistent.

use crate::core::ids::{GroupId, MembershipId, PolicyId, ResourceId};
use crate::core::model::{evaluate_all, Policy, Resource, Subject, ViolatedProperty};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};

/// A resource the client is currently authorized to connect to.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectableEntry {
    pub resource_id: ResourceId,
    pub policy_id: PolicyId,
    pub membership_id: Option<MembershipId>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a cache mutation: resources to push as deleted, and resources
/// (in their current form) to push as created-or-updated. Per §4.6 and
/// Invariant 3, callers must emit every `removed` before any `added`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDelta {
    pub added: Vec<Resource>,
    pub removed: Vec<ResourceId>,
}

impl CacheDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn merge(&mut self, other: CacheDelta) {
        self.removed.extend(other.removed);
        self.added.extend(other.added);
    }
}

/// Why `authorize_resource` refused a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    NotFound,
    Forbidden(Vec<ViolatedProperty>),
}

/// Per-client materialized authorization state (§4.5). One instance lives
/// inside each Session Actor.
#[derive(Debug, Clone)]
pub struct AuthorizationCache {
    /// `group_id -> membership_id` for the actor's current group memberships.
    memberships: HashMap<GroupId, MembershipId>,
    policies: HashMap<PolicyId, Policy>,
    policies_by_group: HashMap<GroupId, HashSet<PolicyId>>,
    policies_by_resource: HashMap<ResourceId, HashSet<PolicyId>>,
    resources: HashMap<ResourceId, Resource>,
    connectable: HashMap<ResourceId, ConnectableEntry>,
    credential_expires_at: DateTime<Utc>,
    max_expiry_horizon: ChronoDuration,
}

impl AuthorizationCache {
    pub fn new(credential_expires_at: DateTime<Utc>, max_expiry_horizon: ChronoDuration) -> Self {
        Self {
            memberships: HashMap::new(),
            policies: HashMap::new(),
            policies_by_group: HashMap::new(),
            policies_by_resource: HashMap::new(),
            resources: HashMap::new(),
            connectable: HashMap::new(),
            credential_expires_at,
            max_expiry_horizon,
        }
    }

    pub fn set_credential_expiry(&mut self, expires_at: DateTime<Utc>) {
        self.credential_expires_at = expires_at;
    }

    pub fn connectable_resource_ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.connectable.keys()
    }

    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    // -- Seeding (used at session init, before any incremental event) -----

    pub fn seed_resource(&mut self, resource: Resource) {
        self.resources.insert(resource.id, resource);
    }

    pub fn seed_policy(&mut self, policy: Policy) {
        self.index_policy(&policy);
        self.policies.insert(policy.id, policy);
    }

    pub fn seed_membership(&mut self, group_id: GroupId, membership_id: MembershipId) {
        self.memberships.insert(group_id, membership_id);
    }

    // -- Mutation primitives, each returning an (added, removed) delta -----

    pub fn add_membership(
        &mut self,
        group_id: GroupId,
        membership_id: MembershipId,
        subject: &Subject,
    ) -> CacheDelta {
        self.memberships.insert(group_id, membership_id);
        self.recompute_group(group_id, subject)
    }

    pub fn remove_membership(&mut self, group_id: GroupId, subject: &Subject) -> CacheDelta {
        self.memberships.remove(&group_id);
        self.recompute_group(group_id, subject)
    }

    pub fn add_policy(&mut self, policy: Policy, subject: &Subject) -> CacheDelta {
        let resource_id = policy.resource_id;
        self.index_policy(&policy);
        self.policies.insert(policy.id, policy);
        self.recompute_resource(resource_id, subject)
    }

    /// §4.6: a policy update that changes `resource_id`, `group_id` or
    /// `conditions` is treated as delete-then-insert (only if still
    /// enabled); any other field change is an in-place update.
    pub fn update_policy(&mut self, policy: Policy, subject: &Subject) -> CacheDelta {
        let Some(previous) = self.policies.get(&policy.id).cloned() else {
            return self.add_policy(policy, subject);
        };

        let retargeted = previous.resource_id != policy.resource_id
            || previous.group_id != policy.group_id
            || previous.conditions != policy.conditions;

        if !retargeted {
            self.policies.insert(policy.id, policy.clone());
            return self.recompute_resource(policy.resource_id, subject);
        }

        let mut delta = self.delete_policy(previous, subject);
        if policy.is_enabled() {
            delta.merge(self.add_policy(policy, subject));
        }
        delta
    }

    pub fn delete_policy(&mut self, policy: Policy, subject: &Subject) -> CacheDelta {
        self.deindex_policy(&policy);
        self.policies.remove(&policy.id);
        self.recompute_resource(policy.resource_id, subject)
    }

    /// §4.6: a resource update that changes `site_id` must be surfaced to
    /// the wire as a delete followed by a create, because the client side
    /// can't move a resource between sites in place.
    pub fn update_resource(&mut self, resource: Resource, subject: &Subject) -> CacheDelta {
        let site_changed = self
            .resources
            .get(&resource.id)
            .is_some_and(|previous| previous.site_id != resource.site_id);

        let resource_id = resource.id;
        self.resources.insert(resource_id, resource);

        if site_changed {
            let was_connectable = self.connectable.remove(&resource_id).is_some();
            let mut delta = CacheDelta::default();
            if was_connectable {
                delta.removed.push(resource_id);
            }
            delta.merge(self.recompute_resource(resource_id, subject));
            delta
        } else {
            self.recompute_resource(resource_id, subject)
        }
    }

    pub fn remove_resource(&mut self, resource_id: ResourceId) -> CacheDelta {
        self.resources.remove(&resource_id);
        let mut delta = CacheDelta::default();
        if self.connectable.remove(&resource_id).is_some() {
            delta.removed.push(resource_id);
        }
        delta
    }

    /// Cascade a site rename onto every resource bound to that site. Site
    /// name isn't stored on `Resource` itself (the model keeps only
    /// `site_id`), so this is a no-op against the cache's own state — the
    /// caller is responsible for re-pushing any resource views that embed
    /// the site's display name.
    pub fn update_resources_with_site_name(&self, _site_id: crate::core::ids::SiteId) -> CacheDelta {
        CacheDelta::default()
    }

    /// Full re-evaluation of every cached resource, used at init and by the
    /// periodic recompute tick (time-window conditions can flip without any
    /// Change Bus event).
    pub fn recompute_connectable_resources(&mut self, subject: &Subject) -> CacheDelta {
        let resource_ids: Vec<ResourceId> = self.resources.keys().copied().collect();
        let mut delta = CacheDelta::default();
        for resource_id in resource_ids {
            delta.merge(self.recompute_resource(resource_id, subject));
        }
        delta
    }

    /// Evaluates current access to a single resource against `subject`,
    /// without mutating the cache. Used by the flow handshake (§4.8 step 1).
    pub fn authorize_resource(
        &self,
        resource_id: ResourceId,
        subject: &Subject,
    ) -> Result<ConnectableEntry, Denial> {
        let Some(resource) = self.resources.get(&resource_id) else {
            return Err(Denial::NotFound);
        };
        if resource.deleted_at.is_some() {
            return Err(Denial::NotFound);
        }
        match self.best_candidate(resource_id, subject) {
            Some(Ok(entry)) => Ok(entry),
            Some(Err(violated)) => Err(Denial::Forbidden(violated)),
            None => Err(Denial::NotFound),
        }
    }

    // -- Internals ----------------------------------------------------

    fn index_policy(&mut self, policy: &Policy) {
        self.policies_by_group
            .entry(policy.group_id)
            .or_default()
            .insert(policy.id);
        self.policies_by_resource
            .entry(policy.resource_id)
            .or_default()
            .insert(policy.id);
    }

    fn deindex_policy(&mut self, policy: &Policy) {
        if let Some(set) = self.policies_by_group.get_mut(&policy.group_id) {
            set.remove(&policy.id);
        }
        if let Some(set) = self.policies_by_resource.get_mut(&policy.resource_id) {
            set.remove(&policy.id);
        }
    }

    fn recompute_group(&mut self, group_id: GroupId, subject: &Subject) -> CacheDelta {
        let resource_ids: Vec<ResourceId> = self
            .policies_by_group
            .get(&group_id)
            .into_iter()
            .flatten()
            .filter_map(|policy_id| self.policies.get(policy_id))
            .map(|policy| policy.resource_id)
            .collect();
        let mut delta = CacheDelta::default();
        for resource_id in resource_ids {
            delta.merge(self.recompute_resource(resource_id, subject));
        }
        delta
    }

    /// Recomputes whether one resource belongs in `connectable`, diffing
    /// against its previous entry to produce a delta of at most one
    /// add/remove pair.
    fn recompute_resource(&mut self, resource_id: ResourceId, subject: &Subject) -> CacheDelta {
        let mut delta = CacheDelta::default();
        let Some(resource) = self.resources.get(&resource_id).cloned() else {
            if self.connectable.remove(&resource_id).is_some() {
                delta.removed.push(resource_id);
            }
            return delta;
        };
        if resource.deleted_at.is_some() {
            if self.connectable.remove(&resource_id).is_some() {
                delta.removed.push(resource_id);
            }
            return delta;
        }

        match self.best_candidate(resource_id, subject) {
            Some(Ok(entry)) => {
                let previous = self.connectable.insert(resource_id, entry.clone());
                if previous.as_ref() != Some(&entry) {
                    if previous.is_some() {
                        delta.removed.push(resource_id);
                    }
                    delta.added.push(resource);
                }
            }
            _ => {
                if self.connectable.remove(&resource_id).is_some() {
                    delta.removed.push(resource_id);
                }
            }
        }
        delta
    }

    /// Picks the best policy granting `resource_id`, if any of the client's
    /// current memberships target it. "Best" is the grant with the
    /// soonest expiry — the most conservative choice when several groups
    /// grant the same resource under different conditions.
    ///
    /// Returns `None` if no policy via any current membership targets this
    /// resource at all (cache-miss, surfaces as `not_found`); `Some(Err(_))`
    /// if at least one targeting policy exists but all are currently
    /// blocked by a condition (`forbidden`); `Some(Ok(_))` otherwise.
    fn best_candidate(
        &self,
        resource_id: ResourceId,
        subject: &Subject,
    ) -> Option<Result<ConnectableEntry, Vec<ViolatedProperty>>> {
        let policy_ids = self.policies_by_resource.get(&resource_id)?;
        let mut candidates = policy_ids
            .iter()
            .filter_map(|id| self.policies.get(id))
            .filter(|p| p.is_enabled() && self.memberships.contains_key(&p.group_id));

        let mut best: Option<ConnectableEntry> = None;
        let mut violations = Vec::new();
        let mut saw_any = false;
        for policy in candidates.by_ref() {
            saw_any = true;
            let violated = evaluate_all(&policy.conditions, subject);
            if !violated.is_empty() {
                violations.extend(violated);
                continue;
            }
            let expires_at = self.expiry_for(&policy.conditions, subject.now);
            let membership_id = self.memberships.get(&policy.group_id).copied();
            let candidate = ConnectableEntry {
                resource_id,
                policy_id: policy.id,
                membership_id,
                expires_at,
            };
            best = Some(match best {
                Some(current) if current.expires_at <= candidate.expires_at => current,
                _ => candidate,
            });
        }

        if !saw_any {
            return None;
        }
        match best {
            Some(entry) => Some(Ok(entry)),
            None => {
                violations.sort_by_key(|v| *v as u8);
                violations.dedup();
                Some(Err(violations))
            }
        }
    }

    fn expiry_for(&self, conditions: &[crate::core::model::Condition], now: DateTime<Utc>) -> DateTime<Utc> {
        let mut expiry = self.credential_expires_at.min(now + self.max_expiry_horizon);
        for condition in conditions {
            if let Some(boundary) = condition.next_boundary(now) {
                expiry = expiry.min(boundary);
            }
        }
        expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{AccountId, GroupId, MembershipId, PolicyId, ResourceId};
    use crate::core::model::{Condition, IpStack, ResourceType};
    use uuid::Uuid;

    fn account() -> AccountId {
        AccountId::from(Uuid::new_v4())
    }

    fn resource(account_id: AccountId) -> Resource {
        Resource {
            id: ResourceId::from(Uuid::new_v4()),
            account_id,
            site_id: None,
            name: "db".into(),
            resource_type: ResourceType::Cidr,
            ip_stack: Some(IpStack::DualStack),
            filters: vec![],
            address: "10.0.0.0/24".into(),
            deleted_at: None,
        }
    }

    fn policy(account_id: AccountId, group_id: GroupId, resource_id: ResourceId) -> Policy {
        Policy {
            id: PolicyId::from(Uuid::new_v4()),
            account_id,
            group_id,
            resource_id,
            conditions: vec![],
            disabled_at: None,
        }
    }

    fn subject() -> Subject {
        Subject {
            remote_ip: None,
            geo: None,
            posture: crate::core::model::Posture { tags: Default::default() },
            now: Utc::now(),
        }
    }

    fn cache() -> AuthorizationCache {
        AuthorizationCache::new(Utc::now() + ChronoDuration::days(1), ChronoDuration::days(30))
    }

    #[test]
    fn membership_grants_access_to_resource() {
        let account_id = account();
        let group_id = GroupId::from(Uuid::new_v4());
        let r = resource(account_id);
        let p = policy(account_id, group_id, r.id);
        let mut c = cache();
        c.seed_resource(r.clone());
        c.seed_policy(p);

        let subject = subject();
        let delta = c.add_membership(group_id, MembershipId::from(Uuid::new_v4()), &subject);
        assert_eq!(delta.added, vec![r]);
        assert!(delta.removed.is_empty());
        assert!(c.authorize_resource(delta_resource_id(&delta), &subject).is_ok());
    }

    fn delta_resource_id(delta: &CacheDelta) -> ResourceId {
        delta.added[0].id
    }

    #[test]
    fn removing_membership_revokes_access() {
        let account_id = account();
        let group_id = GroupId::from(Uuid::new_v4());
        let r = resource(account_id);
        let p = policy(account_id, group_id, r.id);
        let mut c = cache();
        c.seed_resource(r.clone());
        c.seed_policy(p);
        let subject = subject();
        c.add_membership(group_id, MembershipId::from(Uuid::new_v4()), &subject);

        let delta = c.remove_membership(group_id, &subject);
        assert_eq!(delta.removed, vec![r.id]);
        assert_eq!(c.authorize_resource(r.id, &subject), Err(Denial::NotFound));
    }

    #[test]
    fn disabled_policy_is_treated_as_absent() {
        let account_id = account();
        let group_id = GroupId::from(Uuid::new_v4());
        let r = resource(account_id);
        let mut p = policy(account_id, group_id, r.id);
        p.disabled_at = Some(Utc::now());
        let mut c = cache();
        c.seed_resource(r.clone());
        c.seed_policy(p);
        let subject = subject();
        c.add_membership(group_id, MembershipId::from(Uuid::new_v4()), &subject);
        assert_eq!(c.authorize_resource(r.id, &subject), Err(Denial::NotFound));
    }

    #[test]
    fn unknown_resource_is_not_found() {
        let c = cache();
        assert_eq!(
            c.authorize_resource(ResourceId::from(Uuid::new_v4()), &subject()),
            Err(Denial::NotFound)
        );
    }

    #[test]
    fn condition_violation_is_forbidden_not_not_found() {
        let account_id = account();
        let group_id = GroupId::from(Uuid::new_v4());
        let r = resource(account_id);
        let mut p = policy(account_id, group_id, r.id);
        p.conditions = vec![Condition::IpAllowlist {
            cidrs: vec!["192.168.0.0/24".parse().unwrap()],
        }];
        let mut c = cache();
        c.seed_resource(r.clone());
        c.seed_policy(p);
        let mut subject = subject();
        subject.remote_ip = Some("10.0.0.1".parse().unwrap());
        c.add_membership(group_id, MembershipId::from(Uuid::new_v4()), &subject);

        match c.authorize_resource(r.id, &subject) {
            Err(Denial::Forbidden(violated)) => assert!(!violated.is_empty()),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[test]
    fn site_change_on_update_emits_delete_then_create() {
        let account_id = account();
        let group_id = GroupId::from(Uuid::new_v4());
        let r = resource(account_id);
        let p = policy(account_id, group_id, r.id);
        let mut c = cache();
        c.seed_resource(r.clone());
        c.seed_policy(p);
        let subject = subject();
        c.add_membership(group_id, MembershipId::from(Uuid::new_v4()), &subject);

        let mut moved = r.clone();
        moved.site_id = Some(crate::core::ids::SiteId::from(Uuid::new_v4()));
        let delta = c.update_resource(moved.clone(), &subject);
        assert_eq!(delta.removed, vec![r.id]);
        assert_eq!(delta.added, vec![moved]);
    }

    #[test]
    fn retargeting_policy_deletes_then_recreates() {
        let account_id = account();
        let group_id = GroupId::from(Uuid::new_v4());
        let r1 = resource(account_id);
        let r2 = resource(account_id);
        let p = policy(account_id, group_id, r1.id);
        let mut c = cache();
        c.seed_resource(r1.clone());
        c.seed_resource(r2.clone());
        c.seed_policy(p.clone());
        let subject = subject();
        c.add_membership(group_id, MembershipId::from(Uuid::new_v4()), &subject);

        let mut retargeted = p.clone();
        retargeted.resource_id = r2.id;
        let delta = c.update_policy(retargeted, &subject);
        assert_eq!(delta.removed, vec![r1.id]);
        assert_eq!(delta.added, vec![r2]);
    }
}
