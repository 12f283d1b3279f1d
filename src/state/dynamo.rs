//! DynamoDB-backed record table
//!
//! Table layout (shared by every service and entity):
//! - partition key `S3Object` (string): the object key
//! - `Time` (string): RFC3339 time the object was marked
//! - `TTL` (number): unix seconds after which DynamoDB may expire the row

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info};

use super::error::{Result, StateError};
use super::table::{ProcessedRecord, PutOutcome, RecordTable};

const ATTR_OBJECT: &str = "S3Object";
const ATTR_TIME: &str = "Time";
const ATTR_TTL: &str = "TTL";

pub struct DynamoTable {
    client: Client,
    table_name: String,
}

impl DynamoTable {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Build a client from the default AWS credential chain
    pub async fn from_env(
        table_name: impl Into<String>,
        region: Option<&str>,
        endpoint: Option<&str>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config), table_name)
    }

    fn table_error(&self, message: impl std::fmt::Display) -> StateError {
        StateError::Table {
            table: self.table_name.clone(),
            message: message.to_string(),
        }
    }

    fn decode(&self, item: &HashMap<String, AttributeValue>) -> Result<ProcessedRecord> {
        let object = item
            .get(ATTR_OBJECT)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StateError::InvalidRecord(format!("missing {}", ATTR_OBJECT)))?;

        let time = item
            .get(ATTR_TIME)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StateError::InvalidRecord(format!("{}: missing {}", object, ATTR_TIME)))?;
        let time = DateTime::parse_from_rfc3339(time)
            .map_err(|e| StateError::InvalidRecord(format!("{}: bad {}: {}", object, ATTR_TIME, e)))?
            .with_timezone(&Utc);

        let ttl = item
            .get(ATTR_TTL)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .unwrap_or_default();

        Ok(ProcessedRecord {
            object: object.clone(),
            time,
            ttl,
        })
    }
}

#[async_trait]
impl RecordTable for DynamoTable {
    fn name(&self) -> &str {
        &self.table_name
    }

    async fn describe(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(|e| self.table_error(aws_sdk_dynamodb::error::DisplayErrorContext(e)))?;
        info!(table = %self.table_name, "DynamoDB state table reachable");
        Ok(())
    }

    async fn put_if_absent(&self, record: ProcessedRecord) -> Result<PutOutcome> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(ATTR_OBJECT, AttributeValue::S(record.object.clone()))
            .item(
                ATTR_TIME,
                AttributeValue::S(record.time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            )
            .item(ATTR_TTL, AttributeValue::N(record.ttl.to_string()))
            .condition_expression("attribute_not_exists(S3Object)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(PutOutcome::Inserted),
            Err(e) => {
                let already_exists = e
                    .as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if already_exists {
                    Ok(PutOutcome::AlreadyExists)
                } else {
                    Err(self.table_error(aws_sdk_dynamodb::error::DisplayErrorContext(e)))
                }
            }
        }
    }

    async fn scan_since(&self, since: DateTime<Utc>) -> Result<Vec<ProcessedRecord>> {
        let mut pages = self
            .client
            .scan()
            .table_name(&self.table_name)
            .into_paginator()
            .send();

        let mut records = Vec::new();
        let mut skipped = 0usize;

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| self.table_error(aws_sdk_dynamodb::error::DisplayErrorContext(e)))?;
            for item in page.items() {
                match self.decode(item) {
                    Ok(record) if record.time >= since => records.push(record),
                    Ok(_) => {}
                    Err(e) => {
                        skipped += 1;
                        debug!(error = %e, "Skipping undecodable state record");
                    }
                }
            }
        }

        debug!(
            table = %self.table_name,
            records = records.len(),
            skipped,
            "Scanned state table"
        );
        Ok(records)
    }
}
