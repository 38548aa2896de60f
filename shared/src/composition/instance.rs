use std::collections::BTreeMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::call::Literal;
use crate::composition::CompositionError;
use crate::types::Service;

/// One usage of a discovered Service inside an app.
///
/// The id is independent of the Service so the same Service can appear
/// several times in one app. Bound values stay string-encoded until call time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service: Arc<Service>,
    #[serde(default)]
    pub input_values: BTreeMap<String, String>,
    #[serde(default)]
    pub custom_name: Option<String>,
}

impl ServiceInstance {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service,
            input_values: BTreeMap::new(),
            custom_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    /// Bind a value to a declared input parameter.
    pub fn bind(&mut self, param: &str, value: impl Into<String>) -> Result<(), CompositionError> {
        if self.service.input_param(param).is_none() {
            return Err(CompositionError::UnknownInput {
                service: self.service.name.clone(),
                param: param.to_string(),
            });
        }
        self.input_values.insert(param.to_string(), value.into());
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.service.name)
    }

    /// Declared inputs with no bound value, in declaration order
    pub fn missing_inputs(&self) -> Vec<&str> {
        self.service
            .input_params()
            .iter()
            .filter(|p| !self.input_values.contains_key(&p.name))
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn is_fully_configured(&self) -> bool {
        self.missing_inputs().is_empty()
    }

    /// Whether `value` is acceptable for the declared type of `param`.
    pub fn validate_input_value(&self, param: &str, value: &str) -> bool {
        self.service
            .input_param(param)
            .is_some_and(|p| Literal::encode(p.ty, value).is_ok())
    }
}
