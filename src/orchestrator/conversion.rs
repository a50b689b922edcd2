//! One-shot SQL dialect conversion.

use crate::api::{HttpError, MigrationService};
use crate::model::ConversionResult;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("conversion failed: {source}")]
pub struct ConversionFailed {
    #[source]
    pub source: HttpError,
}

/// Holds the output of the most recent conversion request.
pub struct ConversionHelper {
    service: Arc<dyn MigrationService>,
    output: Option<ConversionResult>,
}

impl ConversionHelper {
    pub fn new(service: Arc<dyn MigrationService>) -> Self {
        Self {
            service,
            output: None,
        }
    }

    /// Convert `sql` and replace the held output with the result.
    ///
    /// On failure the held output becomes the failure marker with no
    /// warnings, whatever was held before.
    pub async fn convert(&mut self, sql: &str) -> Result<&ConversionResult, ConversionFailed> {
        match self.service.convert_sql(sql).await {
            Ok(result) => {
                debug!(warnings = result.warnings.len(), "conversion succeeded");
                Ok(&*self.output.insert(result))
            }
            Err(source) => {
                warn!(error = %source, "conversion request failed");
                self.output = Some(ConversionResult::failed());
                Err(ConversionFailed { source })
            }
        }
    }

    pub fn output(&self) -> Option<&ConversionResult> {
        self.output.as_ref()
    }

    pub fn clear(&mut self) {
        self.output = None;
    }
}
