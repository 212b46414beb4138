//! Zero Trust Access API
//!
//! Self-hosted applications with reusable policies. Each application owns
//! the policies labelgate creates for it; replacing a template swaps in a
//! fresh policy set and deletes the old one.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::client::CloudflareClient;
use super::error::ApiError;
use super::{AccessApi, AccessApplication};
use crate::types::{AccessPolicy, AccessPolicyDef, AccessRule, Selector};

/// Access client scoped to one account
#[derive(Clone)]
pub struct AccessClient {
    client: Arc<CloudflareClient>,
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct ListedApplication {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    self_hosted_domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AppPolicy {
    id: String,
    #[serde(default)]
    reusable: bool,
}

impl AccessClient {
    pub fn new(client: Arc<CloudflareClient>, account_id: &str) -> Self {
        Self {
            client,
            account_id: account_id.to_string(),
        }
    }

    fn apps_path(&self) -> String {
        format!("/accounts/{}/access/apps", self.account_id)
    }

    fn policies_path(&self) -> String {
        format!("/accounts/{}/access/policies", self.account_id)
    }

    /// Create one reusable policy per template policy, in precedence order
    async fn create_policies(&self, def: &AccessPolicyDef) -> Result<Vec<String>, ApiError> {
        let mut ids = Vec::with_capacity(def.policies.len());
        for (i, policy) in def.policies.iter().enumerate() {
            let body = policy_body(def, policy, i);
            let created: CreatedObject = self
                .client
                .execute(self.client.post(&self.policies_path()).json(&body))
                .await?;
            debug!(policy_id = %created.id, name = %body["name"], "Created access policy");
            ids.push(created.id);
        }
        Ok(ids)
    }

    /// Reusable policies currently attached to an application
    async fn app_policy_ids(&self, app_id: &str) -> Result<Vec<String>, ApiError> {
        let path = format!("{}/{}/policies", self.apps_path(), app_id);
        let policies: Vec<AppPolicy> = self.client.execute(self.client.get(&path)).await?;
        Ok(policies
            .into_iter()
            .filter(|p| p.reusable)
            .map(|p| p.id)
            .collect())
    }

    async fn delete_policies(&self, policy_ids: &[String]) {
        for id in policy_ids {
            let path = format!("{}/{}", self.policies_path(), id);
            match self.client.execute_unit(self.client.delete(&path)).await {
                Ok(()) => debug!(policy_id = %id, "Deleted access policy"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(policy_id = %id, error = %e, "Failed to delete access policy"),
            }
        }
    }
}

fn application_body(hostname: &str, def: &AccessPolicyDef, policy_ids: &[String]) -> Value {
    let policies: Vec<Value> = policy_ids
        .iter()
        .enumerate()
        .map(|(i, id)| json!({ "id": id, "precedence": i + 1 }))
        .collect();

    json!({
        "name": def.application_name(),
        "domain": hostname,
        "type": "self_hosted",
        "session_duration": def.session_duration,
        "policies": policies,
    })
}

fn policy_body(def: &AccessPolicyDef, policy: &AccessPolicy, index: usize) -> Value {
    let name = policy
        .name
        .clone()
        .unwrap_or_else(|| format!("labelgate-{}-{}", policy.decision, index + 1));

    json!({
        "name": name,
        "decision": policy.decision.api_value(),
        "include": rules_to_api(&policy.include),
        "require": rules_to_api(&policy.require),
        "exclude": rules_to_api(&policy.exclude),
        "session_duration": def.session_duration,
    })
}

/// Expand selector rules into the API's one-object-per-value rule list
fn rules_to_api(rules: &[AccessRule]) -> Vec<Value> {
    let mut out = Vec::new();
    for rule in rules {
        match rule.selector {
            Selector::Everyone => out.push(json!({ "everyone": {} })),
            Selector::Certificate => out.push(json!({ "certificate": {} })),
            Selector::ServiceToken if rule.values.is_empty() => {
                out.push(json!({ "any_valid_service_token": {} }))
            }
            selector => {
                for value in &rule.values {
                    out.push(match selector {
                        Selector::Emails => json!({ "email": { "email": value } }),
                        Selector::EmailsEndingIn => json!({
                            "email_domain": { "domain": value.trim_start_matches('@') }
                        }),
                        Selector::IpRanges => json!({ "ip": { "ip": value } }),
                        Selector::Country => json!({ "geo": { "country_code": value } }),
                        Selector::ServiceToken => json!({ "service_token": { "token_id": value } }),
                        Selector::AccessGroups => json!({ "group": { "id": value } }),
                        Selector::LoginMethods => json!({ "login_method": { "id": value } }),
                        Selector::Everyone | Selector::Certificate => continue,
                    });
                }
            }
        }
    }
    out
}

#[async_trait]
impl AccessApi for AccessClient {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn find_existing_application(
        &self,
        hostname: &str,
    ) -> Result<Option<AccessApplication>, ApiError> {
        let apps: Vec<ListedApplication> = self.client.execute_paged(&self.apps_path(), &[]).await?;
        Ok(apps
            .into_iter()
            .find(|app| {
                app.domain.eq_ignore_ascii_case(hostname)
                    || app
                        .self_hosted_domains
                        .iter()
                        .any(|d| d.eq_ignore_ascii_case(hostname))
            })
            .map(|app| AccessApplication {
                id: app.id,
                name: app.name,
                domain: app.domain,
            }))
    }

    async fn ensure_application_for_hostname(
        &self,
        hostname: &str,
        policy: &AccessPolicyDef,
        existing_app_id: Option<&str>,
    ) -> Result<String, ApiError> {
        let stale = match existing_app_id {
            Some(app_id) => match self.app_policy_ids(app_id).await {
                Ok(ids) => ids,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e),
            },
            None => Vec::new(),
        };

        let policy_ids = self.create_policies(policy).await?;
        let body = application_body(hostname, policy, &policy_ids);

        if let Some(app_id) = existing_app_id {
            let path = format!("{}/{}", self.apps_path(), app_id);
            match self.client.execute_unit(self.client.put(&path).json(&body)).await {
                Ok(()) => {
                    self.delete_policies(&stale).await;
                    info!(hostname, app_id, "Updated access application");
                    return Ok(app_id.to_string());
                }
                Err(e) if e.is_not_found() => {
                    warn!(hostname, app_id, "Access application vanished, recreating");
                }
                Err(e) => {
                    self.delete_policies(&policy_ids).await;
                    return Err(e);
                }
            }
        }

        match self
            .client
            .execute::<CreatedObject>(self.client.post(&self.apps_path()).json(&body))
            .await
        {
            Ok(created) => {
                info!(hostname, app_id = %created.id, "Created access application");
                Ok(created.id)
            }
            Err(e) => {
                self.delete_policies(&policy_ids).await;
                Err(e)
            }
        }
    }

    async fn delete_application(&self, app_id: &str) -> Result<(), ApiError> {
        let policy_ids = match self.app_policy_ids(app_id).await {
            Ok(ids) => ids,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let path = format!("{}/{}", self.apps_path(), app_id);
        self.client.execute_unit(self.client.delete(&path)).await?;
        self.delete_policies(&policy_ids).await;
        Ok(())
    }

    async fn check_permissions(&self) -> Result<(), ApiError> {
        self.client
            .execute_unit(self.client.get(&self.apps_path()).query(&[("per_page", "1")]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Decision;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": result
        }))
    }

    fn client(server: &MockServer) -> AccessClient {
        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url(&server.uri());
        AccessClient::new(Arc::new(client), "acc-1")
    }

    #[test]
    fn test_rules_expand_per_value() {
        let rules = vec![
            AccessRule {
                selector: Selector::Emails,
                values: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            },
            AccessRule {
                selector: Selector::EmailsEndingIn,
                values: vec!["@example.com".to_string()],
            },
            AccessRule {
                selector: Selector::Everyone,
                values: vec![],
            },
        ];
        let api = rules_to_api(&rules);
        assert_eq!(api.len(), 4);
        assert_eq!(api[1]["email"]["email"], "b@example.com");
        assert_eq!(api[2]["email_domain"]["domain"], "example.com");
        assert_eq!(api[3], json!({"everyone": {}}));
    }

    #[test]
    fn test_policy_body_defaults() {
        let mut def = AccessPolicyDef::new("internal");
        def.policies[0].decision = Decision::ServiceAuth;
        let body = policy_body(&def, &def.policies[0], 0);
        assert_eq!(body["name"], "labelgate-service_auth-1");
        assert_eq!(body["decision"], "non_identity");
        assert_eq!(body["session_duration"], "24h");
    }

    #[tokio::test]
    async fn test_find_existing_application_by_domain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acc-1/access/apps"))
            .respond_with(ok(json!([
                {"id": "app-1", "name": "other", "domain": "other.example.com"},
                {"id": "app-2", "name": "admin panel", "domain": "admin.example.com"}
            ])))
            .mount(&server)
            .await;

        let found = client(&server)
            .find_existing_application("admin.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "app-2");
        assert_eq!(found.name, "admin panel");
    }

    #[tokio::test]
    async fn test_create_application_with_reusable_policy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/acc-1/access/policies"))
            .and(body_partial_json(json!({"decision": "allow"})))
            .respond_with(ok(json!({"id": "pol-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/acc-1/access/apps"))
            .and(body_partial_json(json!({
                "name": "labelgate-internal",
                "domain": "admin.example.com",
                "type": "self_hosted",
                "policies": [{"id": "pol-1", "precedence": 1}]
            })))
            .respond_with(ok(json!({"id": "app-9"})))
            .expect(1)
            .mount(&server)
            .await;

        let policy = AccessPolicyDef::new("internal");
        let app_id = client(&server)
            .ensure_application_for_hostname("admin.example.com", &policy, None)
            .await
            .unwrap();
        assert_eq!(app_id, "app-9");
    }

    #[tokio::test]
    async fn test_update_replaces_policy_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acc-1/access/apps/app-1/policies"))
            .respond_with(ok(json!([{"id": "old-1", "reusable": true}])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/acc-1/access/policies"))
            .respond_with(ok(json!({"id": "new-1"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/accounts/acc-1/access/apps/app-1"))
            .and(body_partial_json(json!({"policies": [{"id": "new-1", "precedence": 1}]})))
            .respond_with(ok(json!({"id": "app-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/accounts/acc-1/access/policies/old-1"))
            .respond_with(ok(json!({"id": "old-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let app_id = client(&server)
            .ensure_application_for_hostname(
                "admin.example.com",
                &AccessPolicyDef::new("internal"),
                Some("app-1"),
            )
            .await
            .unwrap();
        assert_eq!(app_id, "app-1");
    }
}
