// tests/property/cache_test.rs
//
// The Authorization Cache's incrementally-maintained `connectable` index
// must never drift from what a direct, from-scratch authorization check
// would say for the same resource. Every mutation primitive recomputes
// through the same `best_candidate` logic `authorize_resource` itself uses,
// so across any sequence of adds/removes/updates the two must agree.

use chrono::{Duration as ChronoDuration, Utc};
use perimeterd::core::authz::AuthorizationCache;
use perimeterd::core::ids::{AccountId, GroupId, MembershipId, PolicyId, ResourceId, SiteId};
use perimeterd::core::model::{IpStack, Policy, Posture, Resource, ResourceType, Subject};
use proptest::prelude::*;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Action {
    AddMembership(usize),
    RemoveMembership(usize),
    EnablePolicy(usize),
    DisablePolicy(usize),
    RemoveResource(usize),
    RestoreResource(usize),
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0usize..2).prop_map(Action::AddMembership),
        (0usize..2).prop_map(Action::RemoveMembership),
        (0usize..3).prop_map(Action::EnablePolicy),
        (0usize..3).prop_map(Action::DisablePolicy),
        (0usize..3).prop_map(Action::RemoveResource),
        (0usize..3).prop_map(Action::RestoreResource),
    ]
}

struct Fixture {
    account_id: AccountId,
    groups: Vec<GroupId>,
    resources: Vec<Resource>,
    // policy index -> (group index, resource index)
    policy_targets: Vec<(usize, usize)>,
    policies: Vec<Policy>,
}

fn build_fixture() -> Fixture {
    let account_id = AccountId::from(Uuid::new_v4());
    let site_id = SiteId::from(Uuid::new_v4());
    let groups: Vec<GroupId> = (0..2).map(|_| GroupId::from(Uuid::new_v4())).collect();
    let resources: Vec<Resource> = (0..3)
        .map(|i| Resource {
            id: ResourceId::from(Uuid::new_v4()),
            account_id,
            site_id: Some(site_id),
            name: format!("resource-{i}"),
            resource_type: ResourceType::Cidr,
            ip_stack: Some(IpStack::DualStack),
            filters: vec![],
            address: "10.0.0.0/24".into(),
            deleted_at: None,
        })
        .collect();
    // Policy i grants group (i % 2) access to resource i, so resource 2 is
    // shared with group 0's policy for resource 0 via index wraparound below.
    let policy_targets = vec![(0, 0), (1, 1), (0, 2)];
    let policies: Vec<Policy> = policy_targets
        .iter()
        .map(|(g, r)| Policy {
            id: PolicyId::from(Uuid::new_v4()),
            account_id,
            group_id: groups[*g],
            resource_id: resources[*r].id,
            conditions: vec![],
            disabled_at: None,
        })
        .collect();

    Fixture {
        account_id,
        groups,
        resources,
        policy_targets,
        policies,
    }
}

fn subject() -> Subject {
    Subject {
        remote_ip: None,
        geo: None,
        posture: Posture::default(),
        now: Utc::now(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn connectable_index_never_drifts_from_a_direct_check(actions in prop::collection::vec(action_strategy(), 0..40)) {
        let fx = build_fixture();
        let mut cache = AuthorizationCache::new(Utc::now() + ChronoDuration::days(1), ChronoDuration::days(30));
        for r in &fx.resources {
            cache.seed_resource(r.clone());
        }
        for p in &fx.policies {
            cache.seed_policy(p.clone());
        }
        let subject = subject();
        let membership_ids: Vec<MembershipId> = fx.groups.iter().map(|_| MembershipId::from(Uuid::new_v4())).collect();

        for action in actions {
            match action {
                Action::AddMembership(i) => {
                    cache.add_membership(fx.groups[i], membership_ids[i], &subject);
                }
                Action::RemoveMembership(i) => {
                    cache.remove_membership(fx.groups[i], &subject);
                }
                Action::EnablePolicy(i) => {
                    let mut p = fx.policies[i].clone();
                    p.disabled_at = None;
                    cache.update_policy(p, &subject);
                }
                Action::DisablePolicy(i) => {
                    let mut p = fx.policies[i].clone();
                    p.disabled_at = Some(Utc::now());
                    cache.update_policy(p, &subject);
                }
                Action::RemoveResource(i) => {
                    cache.remove_resource(fx.resources[i].id);
                }
                Action::RestoreResource(i) => {
                    cache.update_resource(fx.resources[i].clone(), &subject);
                }
            }

            let incremental: HashSet<ResourceId> = cache.connectable_resource_ids().copied().collect();
            let direct: HashSet<ResourceId> = fx
                .resources
                .iter()
                .filter(|r| cache.authorize_resource(r.id, &subject).is_ok())
                .map(|r| r.id)
                .collect();
            prop_assert_eq!(incremental, direct);
        }

        let _ = fx.account_id;
        let _ = fx.policy_targets;
    }
}
