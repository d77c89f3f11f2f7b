//! Schema installation and version checks.
//!
//! There is one schema version. [`Migrator::install`] creates it on a database
//! that has none and verifies it on a database that does; upgrading between
//! versions is not supported.

use crate::{
    Result,
    db::Executor,
    error::RowQueueError,
    plans::{Plans, SCHEMA_VERSION},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Migrator {
    executor: Arc<dyn Executor>,
    plans: Arc<Plans>,
}

impl Migrator {
    pub fn new(executor: Arc<dyn Executor>, plans: Arc<Plans>) -> Self {
        Self { executor, plans }
    }

    pub async fn is_installed(&self) -> Result<bool> {
        let result = self
            .executor
            .execute(&self.plans.version_table_exists, Vec::new())
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("name"))
            .is_some_and(|name| !name.is_null()))
    }

    /// The recorded schema version, if the schema is installed.
    pub async fn version(&self) -> Result<Option<String>> {
        if !self.is_installed().await? {
            return Ok(None);
        }
        let result = self.executor.execute(&self.plans.get_version, Vec::new()).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Creates the schema in one transaction, or verifies an existing one.
    pub async fn install(&self) -> Result<()> {
        if self.is_installed().await? {
            debug!("Schema {} already installed", self.plans.schema());
            return self.check().await;
        }

        let mut statements = self.plans.create();
        statements.push(self.plans.insert_version.clone());
        self.executor.execute_batch(&statements).await?;

        info!(
            "Installed schema {} at version {}",
            self.plans.schema(),
            SCHEMA_VERSION
        );
        Ok(())
    }

    /// Fails unless the schema is installed at [`SCHEMA_VERSION`].
    pub async fn check(&self) -> Result<()> {
        match self.version().await? {
            Some(version) if version == SCHEMA_VERSION => Ok(()),
            Some(version) => Err(RowQueueError::SchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                found: version,
            }),
            None => Err(RowQueueError::SchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                found: "not installed".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("schema", &self.plans.schema())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryExecutor;

    fn migrator() -> Migrator {
        Migrator::new(
            Arc::new(MemoryExecutor::new()),
            Arc::new(Plans::new("rowqueue").unwrap()),
        )
    }

    #[tokio::test]
    async fn test_install_records_version() {
        let migrator = migrator();
        assert!(!migrator.is_installed().await.unwrap());
        assert_eq!(migrator.version().await.unwrap(), None);

        migrator.install().await.unwrap();
        assert!(migrator.is_installed().await.unwrap());
        assert_eq!(migrator.version().await.unwrap().as_deref(), Some(SCHEMA_VERSION));
        assert!(migrator.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let migrator = migrator();
        migrator.install().await.unwrap();
        migrator.install().await.unwrap();
        assert!(migrator.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_check_fails_before_install() {
        let err = migrator().check().await.unwrap_err();
        assert!(matches!(err, RowQueueError::SchemaVersion { .. }));
    }
}
