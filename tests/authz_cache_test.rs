// tests/authz_cache_test.rs
//
// Authorization Cache behavior that spans several mutation primitives in
// sequence — a membership join, a conditioned policy, a resource site
// change — rather than any one method in isolation.

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use perimeterd::core::authz::{AuthorizationCache, Denial};
use perimeterd::core::ids::{AccountId, GroupId, MembershipId, PolicyId, ResourceId, SiteId};
use perimeterd::core::model::{Condition, IpStack, Policy, Posture, Resource, ResourceType, Subject};
use uuid::Uuid;

fn subject_at(now: chrono::DateTime<Utc>) -> Subject {
    Subject {
        remote_ip: Some("198.51.100.9".parse().unwrap()),
        geo: None,
        posture: Posture::default(),
        now,
    }
}

fn resource(account_id: AccountId, site_id: SiteId) -> Resource {
    Resource {
        id: ResourceId::from(Uuid::new_v4()),
        account_id,
        site_id: Some(site_id),
        name: "internal-wiki".into(),
        resource_type: ResourceType::Cidr,
        ip_stack: Some(IpStack::DualStack),
        filters: vec![],
        address: "10.1.0.0/24".into(),
        deleted_at: None,
    }
}

fn policy(account_id: AccountId, group_id: GroupId, resource_id: ResourceId, conditions: Vec<Condition>) -> Policy {
    Policy {
        id: PolicyId::from(Uuid::new_v4()),
        account_id,
        group_id,
        resource_id,
        conditions,
        disabled_at: None,
    }
}

#[test]
fn a_resource_only_becomes_connectable_once_a_membership_grants_it() {
    let account = AccountId::from(Uuid::new_v4());
    let site = SiteId::from(Uuid::new_v4());
    let group = GroupId::from(Uuid::new_v4());
    let r = resource(account, site);
    let p = policy(account, group, r.id, vec![]);

    let mut cache = AuthorizationCache::new(Utc::now() + ChronoDuration::days(1), ChronoDuration::days(30));
    cache.seed_resource(r.clone());
    cache.seed_policy(p.clone());

    let subject = subject_at(Utc::now());
    assert_eq!(cache.authorize_resource(r.id, &subject), Err(Denial::NotFound));
    assert_eq!(cache.connectable_resource_ids().count(), 0);

    let membership_id = MembershipId::from(Uuid::new_v4());
    let delta = cache.add_membership(group, membership_id, &subject);
    assert_eq!(delta.added.len(), 1);
    assert_eq!(delta.added[0].id, r.id);
    assert!(cache.authorize_resource(r.id, &subject).is_ok());

    let delta = cache.remove_membership(group, &subject);
    assert_eq!(delta.removed, vec![r.id]);
    assert_eq!(cache.authorize_resource(r.id, &subject), Err(Denial::NotFound));
}

#[test]
fn a_time_window_condition_denies_forbidden_not_not_found() {
    let account = AccountId::from(Uuid::new_v4());
    let site = SiteId::from(Uuid::new_v4());
    let group = GroupId::from(Uuid::new_v4());
    let r = resource(account, site);
    let unreachable_window = Condition::TimeWindow {
        weekdays: vec![], // never matches any day, so always forbidden
        start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(0, 1, 0).unwrap(),
    };
    let p = policy(account, group, r.id, vec![unreachable_window]);

    let mut cache = AuthorizationCache::new(Utc::now() + ChronoDuration::days(1), ChronoDuration::days(30));
    cache.seed_resource(r.clone());
    cache.seed_policy(p);
    cache.seed_membership(group, MembershipId::from(Uuid::new_v4()));

    let noon = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
    let subject = subject_at(noon);

    match cache.authorize_resource(r.id, &subject) {
        Err(Denial::Forbidden(violations)) => assert!(!violations.is_empty()),
        other => panic!("expected Forbidden, got {other:?}"),
    }
    assert_eq!(cache.connectable_resource_ids().count(), 0);
}

#[test]
fn moving_a_resource_to_a_new_site_surfaces_as_a_delete_then_recompute() {
    let account = AccountId::from(Uuid::new_v4());
    let site_a = SiteId::from(Uuid::new_v4());
    let site_b = SiteId::from(Uuid::new_v4());
    let group = GroupId::from(Uuid::new_v4());
    let r = resource(account, site_a);
    let p = policy(account, group, r.id, vec![]);

    let mut cache = AuthorizationCache::new(Utc::now() + ChronoDuration::days(1), ChronoDuration::days(30));
    cache.seed_resource(r.clone());
    cache.seed_policy(p);
    let subject = subject_at(Utc::now());
    cache.add_membership(group, MembershipId::from(Uuid::new_v4()), &subject);
    assert!(cache.authorize_resource(r.id, &subject).is_ok());

    let mut moved = r.clone();
    moved.site_id = Some(site_b);
    let delta = cache.update_resource(moved, &subject);

    // The move is represented as (at least) a removal of the stale entry
    // followed by the resource reappearing once recompute_resource reruns
    // against its new site.
    assert!(delta.removed.contains(&r.id));
    assert!(cache.authorize_resource(r.id, &subject).is_ok());
}

#[test]
fn recompute_from_scratch_agrees_with_the_incrementally_built_state() {
    let account = AccountId::from(Uuid::new_v4());
    let site = SiteId::from(Uuid::new_v4());
    let group = GroupId::from(Uuid::new_v4());
    let r1 = resource(account, site);
    let r2 = resource(account, site);
    let p1 = policy(account, group, r1.id, vec![]);

    let mut cache = AuthorizationCache::new(Utc::now() + ChronoDuration::days(1), ChronoDuration::days(30));
    cache.seed_resource(r1.clone());
    cache.seed_resource(r2.clone());
    cache.seed_policy(p1);
    let subject = subject_at(Utc::now());
    cache.add_membership(group, MembershipId::from(Uuid::new_v4()), &subject);

    let before: std::collections::HashSet<_> = cache.connectable_resource_ids().copied().collect();
    let delta = cache.recompute_connectable_resources(&subject);
    let after: std::collections::HashSet<_> = cache.connectable_resource_ids().copied().collect();

    // A recompute against unchanged state is idempotent: it produces no
    // delta and leaves the connectable set exactly as it was.
    assert!(delta.is_empty());
    assert_eq!(before, after);
    assert!(before.contains(&r1.id));
    assert!(!before.contains(&r2.id));
}
