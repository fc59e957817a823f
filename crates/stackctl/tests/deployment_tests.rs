//! End-to-end deployment scenarios against the in-memory provider.

use stack_common::{DeploymentSummary, ErrorClass, ProjectContext, ProviderError, ResourceKind};
use stackctl::provider::{CloudProvider, FakeCloud};
use stackctl::sequencer::Sequencer;
use stackctl::{teardown, verify};

fn ctx() -> ProjectContext {
    ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_deploy_names_every_resource_by_convention() {
    let cloud = FakeCloud::new();
    let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();

    assert_eq!(summary.bucket, "storage-for-es-us-123456789012-us-west-2");
    for (kind, name) in [
        (ResourceKind::Bucket, "storage-for-es-us-123456789012-us-west-2"),
        (ResourceKind::Role, "role-knowledge-base-for-es-us-us-west-2"),
        (ResourceKind::Secret, "openweathermap-es-us"),
        (ResourceKind::Secret, "tavilyapikey-es-us"),
        (ResourceKind::SearchPolicy, "encryption-es-us-us-west-2"),
        (ResourceKind::SearchPolicy, "data-es-us"),
        (ResourceKind::Collection, "es-us"),
        (ResourceKind::KnowledgeBase, "kb-for-es-us"),
        (ResourceKind::Vpc, "vpc-for-es-us"),
        (ResourceKind::Subnet, "public-subnet-for-es-us-1"),
        (ResourceKind::Subnet, "private-subnet-for-es-us-2"),
        (ResourceKind::SecurityGroup, "alb-sg-for-es-us"),
        (ResourceKind::SecurityGroup, "ec2-sg-for-es-us"),
        (ResourceKind::LoadBalancer, "alb-for-es-us"),
        (ResourceKind::TargetGroup, "tg-for-es-us"),
        (ResourceKind::Distribution, "distribution-for-es-us"),
        (ResourceKind::Instance, "app-for-es-us"),
    ] {
        assert!(
            cloud.lookup(kind, name).await.unwrap().is_some(),
            "{kind} {name} was not provisioned"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_summary_artifact_roundtrips_through_disk() {
    let cloud = FakeCloud::new();
    let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.json");
    summary.write(&path).unwrap();
    let restored = DeploymentSummary::read(&path).unwrap();
    assert_eq!(restored, summary);
    assert_eq!(restored.sharing_url(), summary.sharing_url());
}

#[tokio::test(start_paused = true)]
async fn test_converged_stack_rerun_is_read_only() {
    let cloud = FakeCloud::new();
    Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
    let mutations = cloud.mutation_count();
    let second = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
    assert_eq!(cloud.mutation_count(), mutations);
    assert_eq!(second.bucket, "storage-for-es-us-123456789012-us-west-2");
}

#[tokio::test(start_paused = true)]
async fn test_stage_failure_names_the_stage_in_the_error() {
    let cloud = FakeCloud::new();
    cloud.inject_error("create_load_balancer", ProviderError::other("api down"));
    let err = Sequencer::new(&cloud, ctx()).deploy().await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("load-balancer"), "unexpected error text: {text}");
    assert!(err.source.is(ErrorClass::Other));
}

#[tokio::test(start_paused = true)]
async fn test_audit_is_clean_after_deploy_and_fails_after_teardown() {
    let cloud = FakeCloud::new();
    Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
    assert!(verify::audit_subnets(&cloud, &ctx()).await.unwrap().is_clean());

    teardown::run(&cloud, &ctx()).await.unwrap();
    let err = verify::audit_subnets(&cloud, &ctx()).await.unwrap_err();
    assert!(err.is(ErrorClass::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_only_reruns_setup_on_the_recorded_instance() {
    let cloud = FakeCloud::new();
    let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
    let before = cloud.mutation_count();

    let sequencer = Sequencer::new(&cloud, ctx());
    let bootstrapped = sequencer.bootstrap_only(None, Some(&summary)).await.unwrap();
    assert_eq!(bootstrapped, summary.instance_id);
    let log = cloud.mutation_log();
    assert_eq!(cloud.mutation_count(), before + 1);
    assert!(log
        .iter()
        .any(|m| m == &format!("send_command {}", summary.instance_id)));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_releases_the_nat_gateway_address() {
    let cloud = FakeCloud::new();
    Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
    teardown::run(&cloud, &ctx()).await.unwrap();
    assert!(cloud
        .mutation_log()
        .iter()
        .any(|m| m.starts_with("release_address")));
    assert!(cloud
        .lookup(ResourceKind::RouteTable, "private-rt-es-us")
        .await
        .unwrap()
        .is_none());
}
