//! Pluggable parameter validation.
//!
//! Services may declare a `parameters` schema string; the node validates the
//! merged params against it before invoking the handler. The default
//! validator accepts everything, so schema enforcement is strictly opt-in.

use lattice_core::ErrorPayload;
use serde_json::Value;

pub trait SchemaValidator: Send + Sync {
    /// `Err` carries the 400-shaped payload returned to the caller.
    fn validate(&self, schema: &str, params: &Value) -> Result<(), ErrorPayload>;
}

/// Accepts any params for any schema.
pub struct AcceptAllValidator;

impl SchemaValidator for AcceptAllValidator {
    fn validate(&self, _schema: &str, _params: &Value) -> Result<(), ErrorPayload> {
        Ok(())
    }
}
