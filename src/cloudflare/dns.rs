//! DNS records API

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::client::CloudflareClient;
use super::error::ApiError;
use super::{DnsApi, DnsRecord};
use crate::types::RecordType;

/// DNS client over a shared [`CloudflareClient`]
#[derive(Clone)]
pub struct DnsClient {
    client: Arc<CloudflareClient>,
}

impl DnsClient {
    pub fn new(client: Arc<CloudflareClient>) -> Self {
        Self { client }
    }
}

/// Request body for create and update
fn record_body(record: &DnsRecord) -> Value {
    let ttl = if record.ttl == 0 { 1 } else { record.ttl };
    let mut body = json!({
        "type": record.record_type.as_str(),
        "name": record.name,
        "ttl": ttl,
    });

    match record.record_type {
        RecordType::Caa => {
            body["data"] = json!({ "flags": 0, "tag": "issue", "value": record.content });
        }
        RecordType::Mx => {
            body["content"] = json!(record.content);
            body["priority"] = json!(record.priority.unwrap_or(10));
        }
        RecordType::A | RecordType::Aaaa | RecordType::Cname => {
            body["content"] = json!(record.content);
            body["proxied"] = json!(record.proxied);
        }
        RecordType::Txt => {
            body["content"] = json!(record.content);
        }
    }

    if let Some(comment) = &record.comment {
        body["comment"] = json!(comment);
    }
    body
}

fn with_zone(mut record: DnsRecord, zone_id: &str) -> DnsRecord {
    if record.zone_id.is_empty() {
        record.zone_id = zone_id.to_string();
    }
    record
}

#[async_trait]
impl DnsApi for DnsClient {
    async fn zone_id(&self, hostname: &str) -> Result<String, ApiError> {
        self.client.zone_id(hostname).await
    }

    async fn create_record(&self, record: &DnsRecord) -> Result<DnsRecord, ApiError> {
        debug!(name = %record.name, record_type = %record.record_type, "Creating DNS record");
        let path = format!("/zones/{}/dns_records", record.zone_id);
        let created: DnsRecord = self
            .client
            .execute(self.client.post(&path).json(&record_body(record)))
            .await?;
        Ok(with_zone(created, &record.zone_id))
    }

    async fn update_record(&self, record: &DnsRecord) -> Result<DnsRecord, ApiError> {
        debug!(name = %record.name, id = %record.id, "Updating DNS record");
        let path = format!("/zones/{}/dns_records/{}", record.zone_id, record.id);
        let updated: DnsRecord = self
            .client
            .execute(self.client.put(&path).json(&record_body(record)))
            .await?;
        Ok(with_zone(updated, &record.zone_id))
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), ApiError> {
        let path = format!("/zones/{}/dns_records/{}", zone_id, record_id);
        self.client.execute_unit(self.client.delete(&path)).await
    }

    async fn get_record_by_name(
        &self,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Option<DnsRecord>, ApiError> {
        let zone_id = self.client.zone_id(hostname).await?;
        let path = format!("/zones/{}/dns_records", zone_id);
        let records: Vec<DnsRecord> = self
            .client
            .execute(
                self.client
                    .get(&path)
                    .query(&[("name", hostname), ("type", record_type.as_str())]),
            )
            .await?;

        Ok(records.into_iter().next().map(|r| with_zone(r, &zone_id)))
    }
}
