//! Maps requested scopes onto userinfo claims: subject, cluster, and the
//! impersonation groups granted by role and declarative access policy.

use std::{collections::HashSet, sync::Arc};

use siderolink_common::{
    ObjectStore,
    model::{AccessPolicy, Identity, Role, ACCESS_POLICY_ID, OPERATOR_DEFAULT_GROUP},
};

const IDENTITY_NAMESPACE: &str = "default";
const POLICY_NAMESPACE: &str = "default";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub subject: Option<String>,
    pub cluster: Option<String>,
    pub groups: Vec<String>,
}

/// Passes through `ValidateJWTProfileScopes` only for scopes the claims
/// assembler actually understands.
#[must_use]
pub fn is_recognized_scope(scope: &str) -> bool {
    scope == "openid" || scope.starts_with("cluster:")
}

pub struct ClaimsBuilder {
    identities: Arc<dyn ObjectStore<Identity>>,
    policies: Arc<dyn ObjectStore<AccessPolicy>>,
}

impl ClaimsBuilder {
    #[must_use]
    pub fn new(identities: Arc<dyn ObjectStore<Identity>>, policies: Arc<dyn ObjectStore<AccessPolicy>>) -> Self {
        Self { identities, policies }
    }

    /// Assembles userinfo for `user_id` from `scopes`. Unrecognized scopes
    /// are ignored rather than rejected.
    pub async fn assemble(&self, user_id: &str, scopes: &[String]) -> UserInfo {
        let mut info = UserInfo::default();
        for scope in scopes {
            if scope == "openid" {
                info.subject = Some(user_id.to_string());
            } else if let Some(cluster) = scope.strip_prefix("cluster:") {
                info.cluster = Some(cluster.to_string());
                info.groups = self.impersonation_groups(user_id, cluster).await;
            }
        }
        info
    }

    async fn impersonation_groups(&self, user_id: &str, cluster: &str) -> Vec<String> {
        let mut groups = HashSet::new();

        if let Ok(identity) = self.identities.get(IDENTITY_NAMESPACE, user_id).await {
            if identity.spec.role == Role::Operator {
                groups.insert(OPERATOR_DEFAULT_GROUP.to_string());
            }
        }

        if let Ok(policy) = self.policies.get(POLICY_NAMESPACE, ACCESS_POLICY_ID).await {
            for rule in &policy.spec.rules {
                let user_matches = rule.user == "*" || rule.user == user_id;
                let cluster_matches = rule.cluster == "*" || rule.cluster == cluster;
                if user_matches && cluster_matches {
                    groups.extend(rule.groups.iter().cloned());
                }
            }
        }

        groups.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siderolink_common::{Metadata, model::AccessPolicyRule, store::memory::InMemoryStore};

    #[tokio::test]
    async fn operator_role_and_policy_groups_are_merged_and_deduplicated() {
        let identities: Arc<InMemoryStore<Identity>> = Arc::new(InMemoryStore::new());
        identities
            .create(Metadata::new("default", "alice"), Identity { role: Role::Operator })
            .await
            .unwrap();

        let policies: Arc<InMemoryStore<AccessPolicy>> = Arc::new(InMemoryStore::new());
        policies
            .create(
                Metadata::new("default", "singleton"),
                AccessPolicy {
                    rules: vec![
                        AccessPolicyRule {
                            user: "alice".to_string(),
                            cluster: "prod".to_string(),
                            groups: vec!["system:masters".to_string(), "readers".to_string()],
                        },
                        AccessPolicyRule {
                            user: "*".to_string(),
                            cluster: "prod".to_string(),
                            groups: vec!["everyone".to_string()],
                        },
                    ],
                },
            )
            .await
            .unwrap();

        let builder = ClaimsBuilder::new(identities, policies);
        let info = builder.assemble("alice", &["openid".to_string(), "cluster:prod".to_string()]).await;

        assert_eq!(info.subject.as_deref(), Some("alice"));
        assert_eq!(info.cluster.as_deref(), Some("prod"));
        let mut groups = info.groups.clone();
        groups.sort();
        assert_eq!(groups, vec!["everyone", "readers", "system:masters"]);
    }

    #[test]
    fn only_openid_and_cluster_scopes_are_recognized() {
        assert!(is_recognized_scope("openid"));
        assert!(is_recognized_scope("cluster:prod"));
        assert!(!is_recognized_scope("profile"));
    }
}
