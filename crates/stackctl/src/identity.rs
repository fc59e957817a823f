//! Identity and secrets stages: service roles, the instance profile, and
//! the API-key secrets the application reads at runtime.

use crate::conflict::{create_or_reuse, Provenance};
use crate::provider::CloudProvider;
use serde_json::{json, Value};
use stack_common::{ProjectContext, ResourceHandle, ResourceKind, StageError, StageId};
use tracing::info;

pub struct IdentityOutputs {
    pub knowledge_base_role: ResourceHandle,
    pub agent_role: ResourceHandle,
    pub compute_role: ResourceHandle,
    pub log_pipeline_role: ResourceHandle,
    pub memory_role: ResourceHandle,
}

pub struct SecretsOutputs {
    pub weather: ResourceHandle,
    pub search: ResourceHandle,
}

struct RoleSpec {
    logical: &'static str,
    trust_services: &'static [&'static str],
    managed_policies: &'static [&'static str],
}

const ROLE_SPECS: [RoleSpec; 5] = [
    RoleSpec {
        logical: "knowledge-base",
        trust_services: &["bedrock.amazonaws.com"],
        managed_policies: &[],
    },
    RoleSpec {
        logical: "agent",
        trust_services: &["bedrock.amazonaws.com"],
        managed_policies: &[],
    },
    RoleSpec {
        logical: "compute",
        trust_services: &["ec2.amazonaws.com"],
        managed_policies: &["arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"],
    },
    RoleSpec {
        logical: "log-pipeline",
        trust_services: &["firehose.amazonaws.com"],
        managed_policies: &[],
    },
    RoleSpec {
        logical: "memory",
        trust_services: &["bedrock.amazonaws.com"],
        managed_policies: &[],
    },
];

/// Create or adopt one service role. On reuse the inline policy and, for
/// the compute role, the instance profile are checked for and backfilled
/// when missing, so an interrupted run converges without making a
/// converged re-run write anything.
async fn ensure_role(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
    spec: &RoleSpec,
) -> Result<ResourceHandle, StageError> {
    let wrap = |e| StageError::new(StageId::Identity, ResourceKind::Role, e);
    let name = ctx.role_name(spec.logical);
    let trust: Vec<String> = spec.trust_services.iter().map(|s| s.to_string()).collect();
    let managed: Vec<String> = spec.managed_policies.iter().map(|s| s.to_string()).collect();
    let (role, provenance) = create_or_reuse(provider, ResourceKind::Role, &name, || {
        provider.create_role(&name, &trust, &managed)
    })
    .await
    .map_err(wrap)?;

    let needs_policy = provenance == Provenance::Created
        || !provider
            .role_has_inline_policy(&name, "stack-access")
            .await
            .map_err(wrap)?;
    if needs_policy {
        provider
            .put_inline_policy(&name, "stack-access", inline_policy(spec.logical, ctx))
            .await
            .map_err(wrap)?;
    }
    if spec.logical == "compute" {
        let profile = ctx.instance_profile_name();
        let needs_profile = provenance == Provenance::Created
            || !provider.instance_profile_exists(&profile).await.map_err(wrap)?;
        if needs_profile {
            provider
                .create_instance_profile(&profile, &name)
                .await
                .map_err(wrap)?;
        }
    }
    Ok(role)
}

/// Create or adopt the five service roles.
pub async fn provision(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
) -> Result<IdentityOutputs, StageError> {
    let outputs = IdentityOutputs {
        knowledge_base_role: ensure_role(provider, ctx, &ROLE_SPECS[0]).await?,
        agent_role: ensure_role(provider, ctx, &ROLE_SPECS[1]).await?,
        compute_role: ensure_role(provider, ctx, &ROLE_SPECS[2]).await?,
        log_pipeline_role: ensure_role(provider, ctx, &ROLE_SPECS[3]).await?,
        memory_role: ensure_role(provider, ctx, &ROLE_SPECS[4]).await?,
    };
    info!("identity stage complete");
    Ok(outputs)
}

/// Create or adopt the two API-key secrets. Values are placeholders that an
/// operator replaces out of band; real keys never pass through this tool.
pub async fn provision_secrets(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
) -> Result<SecretsOutputs, StageError> {
    let wrap = |e| StageError::new(StageId::Secrets, ResourceKind::Secret, e);
    let placeholder = json!({ "api_key": "replace-me" });

    let weather_name = ctx.weather_secret_name();
    let (weather, _) = create_or_reuse(provider, ResourceKind::Secret, &weather_name, || {
        provider.create_secret(
            &weather_name,
            "Weather API key for the chat application",
            placeholder.clone(),
        )
    })
    .await
    .map_err(wrap)?;

    let search_name = ctx.search_secret_name();
    let (search, _) = create_or_reuse(provider, ResourceKind::Secret, &search_name, || {
        provider.create_secret(
            &search_name,
            "Web search API key for the chat application",
            placeholder.clone(),
        )
    })
    .await
    .map_err(wrap)?;

    info!("secrets stage complete");
    Ok(SecretsOutputs { weather, search })
}

fn inline_policy(logical: &str, ctx: &ProjectContext) -> Value {
    let bucket = ctx.bucket_name();
    let bucket_arn = format!("arn:aws:s3:::{bucket}");
    let objects_arn = format!("arn:aws:s3:::{bucket}/*");
    match logical {
        "knowledge-base" => json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": "aoss:APIAccessAll",
                    "Resource": format!(
                        "arn:aws:aoss:{}:{}:collection/*",
                        ctx.region, ctx.account_id
                    )
                },
                {
                    "Effect": "Allow",
                    "Action": ["s3:GetObject", "s3:ListBucket"],
                    "Resource": [bucket_arn, objects_arn]
                },
                {
                    "Effect": "Allow",
                    "Action": "bedrock:InvokeModel",
                    "Resource": format!(
                        "arn:aws:bedrock:{}::foundation-model/*",
                        ctx.region
                    )
                }
            ]
        }),
        "agent" => json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["bedrock:InvokeModel", "bedrock:Retrieve", "bedrock:RetrieveAndGenerate"],
                    "Resource": "*"
                }
            ]
        }),
        "compute" => json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["s3:GetObject", "s3:PutObject", "s3:ListBucket"],
                    "Resource": [bucket_arn, objects_arn]
                },
                {
                    "Effect": "Allow",
                    "Action": "secretsmanager:GetSecretValue",
                    "Resource": [
                        format!(
                            "arn:aws:secretsmanager:{}:{}:secret:{}*",
                            ctx.region, ctx.account_id, ctx.weather_secret_name()
                        ),
                        format!(
                            "arn:aws:secretsmanager:{}:{}:secret:{}*",
                            ctx.region, ctx.account_id, ctx.search_secret_name()
                        )
                    ]
                },
                {
                    "Effect": "Allow",
                    "Action": ["bedrock:InvokeModel", "bedrock:InvokeAgent", "bedrock:Retrieve"],
                    "Resource": "*"
                },
                {
                    "Effect": "Allow",
                    "Action": "aoss:APIAccessAll",
                    "Resource": format!(
                        "arn:aws:aoss:{}:{}:collection/*",
                        ctx.region, ctx.account_id
                    )
                }
            ]
        }),
        "log-pipeline" => json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["s3:PutObject", "s3:GetBucketLocation"],
                    "Resource": [bucket_arn, format!("arn:aws:s3:::{bucket}/logs/*")]
                },
                {
                    "Effect": "Allow",
                    "Action": ["logs:PutLogEvents", "logs:CreateLogStream"],
                    "Resource": "*"
                }
            ]
        }),
        // memory
        _ => json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["s3:GetObject", "s3:PutObject"],
                    "Resource": objects_arn
                }
            ]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test]
    async fn test_all_five_roles_and_the_profile_are_created() {
        let cloud = FakeCloud::new();
        let outputs = provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(
            outputs.knowledge_base_role.name,
            "role-knowledge-base-for-es-us-us-west-2"
        );
        assert_eq!(outputs.compute_role.name, "role-compute-for-es-us-us-west-2");
        let log = cloud.mutation_log();
        assert_eq!(log.iter().filter(|m| m.starts_with("create_role")).count(), 5);
        assert!(log
            .iter()
            .any(|m| m.starts_with("create_instance_profile instance-profile-es-us-us-west-2")));
    }

    #[tokio::test]
    async fn test_identity_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        provision(&cloud, &ctx()).await.unwrap();
        let before = cloud.mutation_count();
        provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_adopted_role_without_policy_is_backfilled() {
        let cloud = FakeCloud::new();
        // Roles left behind by a run that died before the policy writes.
        for logical in ["knowledge-base", "agent", "compute", "log-pipeline", "memory"] {
            let name = ctx().role_name(logical);
            cloud.preload(ResourceHandle::ready(
                ResourceKind::Role,
                &name,
                format!("arn:fake:iam::role/{name}"),
            ));
        }
        provision(&cloud, &ctx()).await.unwrap();
        let log = cloud.mutation_log();
        assert_eq!(log.iter().filter(|m| m.starts_with("create_role")).count(), 0);
        assert_eq!(
            log.iter().filter(|m| m.starts_with("put_inline_policy")).count(),
            5
        );
        assert!(log
            .iter()
            .any(|m| m.starts_with("create_instance_profile instance-profile-es-us-us-west-2")));
    }

    #[tokio::test]
    async fn test_secrets_use_derived_names() {
        let cloud = FakeCloud::new();
        let outputs = provision_secrets(&cloud, &ctx()).await.unwrap();
        assert_eq!(outputs.weather.name, "openweathermap-es-us");
        assert_eq!(outputs.search.name, "tavilyapikey-es-us");
    }

    #[tokio::test]
    async fn test_secrets_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        provision_secrets(&cloud, &ctx()).await.unwrap();
        let before = cloud.mutation_count();
        provision_secrets(&cloud, &ctx()).await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }
}
