//! 资源校验规则测试

use authz_controller::models::{
    Cluster, ClusterPhase, MultiClusterRoleBinding, Policy, PolicyRule, Role, Scope,
};

fn binding(clusters: &[&str]) -> MultiClusterRoleBinding {
    MultiClusterRoleBinding::new("tenant-a", "b1", "alice", "tenant-a/r1", clusters)
}

#[test]
fn test_binding_clusters() {
    assert!(binding(&[]).validate().is_err());
    assert!(binding(&["*", "a"]).validate().is_err());
    assert!(binding(&["a", " "]).validate().is_err());
    assert!(binding(&["a", "b"]).validate().is_ok());

    let wildcard = binding(&["*"]);
    assert!(wildcard.validate().is_ok());
    assert!(wildcard.dispatches_all_clusters());
    assert!(!binding(&["a"]).dispatches_all_clusters());
}

#[test]
fn test_binding_requires_user_and_role_reference() {
    let mut anonymous = binding(&["a"]);
    anonymous.spec.username.clear();
    assert!(anonymous.validate().is_err());

    for reference in ["r1", "tenant-a/", "a/b/c", "Tenant/r1"] {
        let mut invalid = binding(&["a"]);
        invalid.spec.role_name = reference.to_string();
        assert!(invalid.validate().is_err(), "{} should be rejected", reference);
    }
}

#[test]
fn test_binding_derived_labels() {
    let mut wildcard = binding(&["*"]);
    wildcard
        .metadata
        .labels
        .insert("authz.tkestack.io/role-name".to_string(), "forged".to_string());
    wildcard.apply_derived_labels();

    let labels = &wildcard.metadata.labels;
    assert_eq!(labels["authz.tkestack.io/role-namespace"], "tenant-a");
    assert_eq!(labels["authz.tkestack.io/role-name"], "r1");
    assert_eq!(labels["authz.tkestack.io/username"], "alice");
    assert_eq!(labels["authz.tkestack.io/dispatch-all-clusters"], "true");
}

#[test]
fn test_policy_rules_need_verbs() {
    let valid = Policy::new(
        "tenant-a",
        "p1",
        Scope::MultiCluster,
        vec![PolicyRule::new(&["get"], &[""], &["pods"])],
    );
    assert!(valid.validate().is_ok());

    let invalid = Policy::new(
        "tenant-a",
        "p1",
        Scope::MultiCluster,
        vec![PolicyRule::new(&[], &[""], &["pods"])],
    );
    assert!(invalid.validate().is_err());

    let badly_named = Policy::new("tenant-a", "P_1", Scope::MultiCluster, vec![]);
    assert!(badly_named.validate().is_err());
}

#[test]
fn test_role_policy_references() {
    let role = Role::new("tenant-a", "r1", Scope::MultiCluster, &["tenant-a/p1", "shared/p2"]);
    assert!(role.validate().is_ok());
    assert!(role.references("shared/p2"));
    assert!(!role.references("tenant-a/p2"));

    let dangling_format = Role::new("tenant-a", "r1", Scope::MultiCluster, &["p1"]);
    assert!(dangling_format.validate().is_err());
}

#[test]
fn test_cluster_dispatchability() {
    assert!(Cluster::new("c1", "tenant-a", ClusterPhase::Running).is_dispatchable());
    assert!(Cluster::new("c1", "tenant-a", ClusterPhase::Failed).is_dispatchable());
    assert!(!Cluster::new("c1", "tenant-a", ClusterPhase::Initializing).is_dispatchable());
    assert!(!Cluster::new("global", "tenant-a", ClusterPhase::Running).is_dispatchable());
    assert!(Cluster::new("c1", "", ClusterPhase::Running).validate().is_err());
}
