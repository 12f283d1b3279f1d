use super::models::{Config, EntityConfig, StorageProvider};
use crate::source::ServiceKind;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

pub const MIN_BACKFILL_HOURS: u32 = 1;
pub const MAX_BACKFILL_HOURS: u32 = 168;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("backfill_hours must be between 1 and 168, got {0}")]
    InvalidBackfillHours(u32),

    #[error("{field} must be positive")]
    MustBePositive { field: &'static str },

    #[error("State directory {0} does not exist (create it, or enable high availability)")]
    MissingStateDir(PathBuf),

    #[error("No write key: set LOGBUCKET_WRITE_KEY or pass --write-key")]
    MissingWriteKey,

    #[error("Storage provider is local but local_root {0} does not exist")]
    MissingLocalRoot(PathBuf),

    #[error("Entity '{entity}' ({kind}) is missing {field}")]
    MissingEntityField {
        entity: String,
        kind: ServiceKind,
        field: &'static str,
    },

    #[error("Entity '{name}' ({kind}) is configured more than once")]
    DuplicateEntity { name: String, kind: ServiceKind },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_ingest(config)?;
    validate_storage(config)?;
    validate_telemetry(config)?;
    validate_entities(config)?;
    Ok(())
}

/// Extra checks that only matter when the pipeline is about to run
pub fn validate_for_ingest(config: &Config) -> Result<(), ValidationError> {
    validate(config)?;

    let has_key = config
        .telemetry
        .write_key
        .as_deref()
        .is_some_and(|key| !key.is_empty());
    if !has_key {
        return Err(ValidationError::MissingWriteKey);
    }

    if !config.ingest.high_availability && !config.ingest.state_dir.is_dir() {
        return Err(ValidationError::MissingStateDir(config.ingest.state_dir.clone()));
    }

    Ok(())
}

fn validate_ingest(config: &Config) -> Result<(), ValidationError> {
    let ingest = &config.ingest;

    if !(MIN_BACKFILL_HOURS..=MAX_BACKFILL_HOURS).contains(&ingest.backfill_hours) {
        return Err(ValidationError::InvalidBackfillHours(ingest.backfill_hours));
    }

    let positive = [
        ("ingest.workers", ingest.workers as u64),
        ("ingest.poll_interval_secs", ingest.poll_interval_secs),
        ("ingest.page_size", ingest.page_size as u64),
        ("ingest.queue_size", ingest.queue_size as u64),
        ("ingest.output_buffer", ingest.output_buffer as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(ValidationError::MustBePositive { field });
        }
    }

    if ingest.concurrency == Some(0) {
        return Err(ValidationError::MustBePositive {
            field: "ingest.concurrency",
        });
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.provider == StorageProvider::Local && !config.storage.local_root.is_dir() {
        return Err(ValidationError::MissingLocalRoot(config.storage.local_root.clone()));
    }
    Ok(())
}

fn validate_telemetry(config: &Config) -> Result<(), ValidationError> {
    let telemetry = &config.telemetry;

    if telemetry.sample_rate == 0 {
        return Err(ValidationError::MustBePositive {
            field: "telemetry.sample_rate",
        });
    }
    if telemetry.batch_size == 0 {
        return Err(ValidationError::MustBePositive {
            field: "telemetry.batch_size",
        });
    }
    if telemetry.sampler_interval_secs == 0 {
        return Err(ValidationError::MustBePositive {
            field: "telemetry.sampler_interval_secs",
        });
    }

    Ok(())
}

fn validate_entities(config: &Config) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for entity in &config.entities {
        if !seen.insert((entity.kind, entity.name.as_str())) {
            return Err(ValidationError::DuplicateEntity {
                name: entity.name.clone(),
                kind: entity.kind,
            });
        }
        validate_entity(entity)?;
    }

    Ok(())
}

/// Each service needs different pieces to build its key prefix
fn validate_entity(entity: &EntityConfig) -> Result<(), ValidationError> {
    let missing = |field| ValidationError::MissingEntityField {
        entity: entity.name.clone(),
        kind: entity.kind,
        field,
    };

    if entity.name.is_empty() {
        return Err(missing("name"));
    }
    if entity.bucket.is_empty() {
        return Err(missing("bucket"));
    }

    match entity.kind {
        ServiceKind::Elb | ServiceKind::Alb | ServiceKind::CloudTrail => {
            if entity.account_id.as_deref().unwrap_or_default().is_empty() {
                return Err(missing("account_id"));
            }
            if entity.region.as_deref().unwrap_or_default().is_empty() {
                return Err(missing("region"));
            }
        }
        ServiceKind::CloudFront => {}
    }

    Ok(())
}
