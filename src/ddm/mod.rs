//! Data catalog and data-movement interface.
//!
//! The orchestration core only needs two things from the remote catalog:
//! registering a subscription that moves a dataset to a location, and
//! tagging a dataset with a metadata key. Everything else about the service
//! is out of reach of this crate.

pub mod naming;

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CatalogError;

/// Activity used when subscribing production outputs.
pub const PRODUCTION_OUTPUT_ACTIVITY: &str = "Production Output";

/// Metadata key marking a dataset as transient.
pub const TRANSIENT_METADATA_KEY: &str = "transient";

/// Remote catalog operations consumed by the refiner and the watchdog.
#[async_trait]
pub trait DataCatalog: Send + Sync {
    /// Ask the service to replicate `dataset` to `location`.
    ///
    /// `Ok(false)` means the service refused the request without an error.
    async fn register_dataset_subscription(
        &self,
        dataset: &str,
        location: &str,
        activity: &str,
        asynchronous: bool,
    ) -> Result<bool, CatalogError>;

    /// Set a metadata key on a dataset.
    async fn set_dataset_metadata(
        &self,
        dataset: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), CatalogError>;
}

/// A call issued against a catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogCall {
    Subscription {
        dataset: String,
        location: String,
        activity: String,
        asynchronous: bool,
    },
    Metadata {
        dataset: String,
        key: String,
        value: Value,
    },
}

/// Catalog that accepts every request, logging and recording it.
#[derive(Debug, Default)]
pub struct DryRunCatalog {
    calls: Mutex<Vec<CatalogCall>>,
}

impl DryRunCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<CatalogCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, call: CatalogCall) -> Result<(), CatalogError> {
        let mut calls = self
            .calls
            .lock()
            .map_err(|_| CatalogError::Unavailable("call log lock poisoned".into()))?;
        calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl DataCatalog for DryRunCatalog {
    async fn register_dataset_subscription(
        &self,
        dataset: &str,
        location: &str,
        activity: &str,
        asynchronous: bool,
    ) -> Result<bool, CatalogError> {
        tracing::info!(
            dataset = %dataset,
            location = %location,
            activity = %activity,
            "dry-run subscription"
        );
        self.record(CatalogCall::Subscription {
            dataset: dataset.to_string(),
            location: location.to_string(),
            activity: activity.to_string(),
            asynchronous,
        })?;
        Ok(true)
    }

    async fn set_dataset_metadata(
        &self,
        dataset: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), CatalogError> {
        tracing::info!(dataset = %dataset, key = %key, value = %value, "dry-run metadata");
        self.record(CatalogCall::Metadata {
            dataset: dataset.to_string(),
            key: key.to_string(),
            value: value.clone(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_records_calls_in_order() {
        let catalog = DryRunCatalog::new();
        assert!(
            catalog
                .register_dataset_subscription("out.1", "CERN-PROD_DATADISK", PRODUCTION_OUTPUT_ACTIVITY, true)
                .await
                .unwrap()
        );
        catalog
            .set_dataset_metadata("out.1", TRANSIENT_METADATA_KEY, &Value::Bool(true))
            .await
            .unwrap();

        let calls = catalog.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            &calls[0],
            CatalogCall::Subscription { location, asynchronous: true, .. } if location == "CERN-PROD_DATADISK"
        ));
        assert!(matches!(
            &calls[1],
            CatalogCall::Metadata { key, .. } if key == "transient"
        ));
    }

    #[tokio::test]
    async fn poisoned_call_log_is_reported() {
        let catalog = std::sync::Arc::new(DryRunCatalog::new());
        let poisoner = std::sync::Arc::clone(&catalog);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.calls.lock().unwrap();
            panic!("poison the call log");
        })
        .join();

        let err = catalog
            .register_dataset_subscription("out.1", "CERN-PROD_DATADISK", PRODUCTION_OUTPUT_ACTIVITY, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Unavailable(_)));
        assert!(catalog.calls().is_empty());
    }
}
