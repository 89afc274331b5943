//! # Table Handler Registry
//!
//! Read-only lookup from canonical table names to registered handlers, built
//! once at startup. Registration is explicit: the application constructs a
//! [`HandlerRegistryBuilder`], registers each handler with its table, the
//! operations it supports, and optionally a declared record type, then calls
//! `build()`.
//!
//! Build-time rules, in order:
//! - table names are canonicalized to upper case and must be unique; a later
//!   duplicate is rejected with an error log, the first registration wins;
//! - `validate_setup()` runs per handler; a failure removes that registration;
//! - `on_registered(table)` fires once per surviving registration.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{BrokerError, Result};
use crate::messaging::envelope::{ChangeType, RecordConverter};
use crate::registry::change_handler::ChangeHandler;

/// Options supplied when registering a handler.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Table name; canonicalized to upper case at build time.
    pub table: String,
    /// Operations the handler supports.
    pub operations: HashSet<ChangeType>,
    /// Disabled registrations stay in the registry but are skipped at dispatch.
    pub enabled: bool,
    /// Name used in logs and telemetry.
    pub name: String,
}

impl RegistrationOptions {
    /// Registration for all three operations, enabled.
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            operations: ChangeType::ALL.into_iter().collect(),
            enabled: true,
            name: name.into(),
        }
    }

    pub fn with_operations(mut self, operations: impl IntoIterator<Item = ChangeType>) -> Self {
        self.operations = operations.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// One table's registration: the handler plus its declared configuration.
pub struct HandlerRegistration {
    /// Canonical upper-case table name.
    pub table_name: String,
    pub handler: Arc<dyn ChangeHandler>,
    pub supported_operations: HashSet<ChangeType>,
    pub enabled: bool,
    pub registration_name: String,
    /// Declared record type name, for logs; `None` means raw mapping.
    pub record_type_name: Option<&'static str>,
    record_converter: Option<RecordConverter>,
}

impl HandlerRegistration {
    pub fn supports(&self, change_type: ChangeType) -> bool {
        self.supported_operations.contains(&change_type)
    }

    pub fn record_converter(&self) -> Option<&RecordConverter> {
        self.record_converter.as_ref()
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("table_name", &self.table_name)
            .field("supported_operations", &self.supported_operations)
            .field("enabled", &self.enabled)
            .field("registration_name", &self.registration_name)
            .field("record_type_name", &self.record_type_name)
            .finish_non_exhaustive()
    }
}

/// Builder accumulating registrations until `build()`.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    pending: Vec<HandlerRegistration>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that consumes the raw record mapping.
    pub fn register(
        &mut self,
        options: RegistrationOptions,
        handler: Arc<dyn ChangeHandler>,
    ) -> &mut Self {
        self.push_registration(options, handler, None, None);
        self
    }

    /// Register a handler with a declared record type; the record payload is
    /// converted with serde and exposed through
    /// [`crate::messaging::ChangeEvent::typed_record`].
    pub fn register_typed<T>(
        &mut self,
        options: RegistrationOptions,
        handler: Arc<dyn ChangeHandler>,
    ) -> &mut Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let converter: RecordConverter = Arc::new(|raw| {
            if raw.is_empty() {
                return None;
            }
            serde_json::from_value::<T>(Value::Object(raw.clone()))
                .ok()
                .map(|record| Box::new(record) as Box<dyn Any + Send + Sync>)
        });
        self.push_registration(
            options,
            handler,
            Some(converter),
            Some(std::any::type_name::<T>()),
        );
        self
    }

    fn push_registration(
        &mut self,
        options: RegistrationOptions,
        handler: Arc<dyn ChangeHandler>,
        record_converter: Option<RecordConverter>,
        record_type_name: Option<&'static str>,
    ) {
        self.pending.push(HandlerRegistration {
            table_name: options.table.trim().to_uppercase(),
            handler,
            supported_operations: options.operations,
            enabled: options.enabled,
            registration_name: options.name,
            record_type_name,
            record_converter,
        });
    }

    /// Validate and freeze the registry.
    pub fn build(self) -> Result<HandlerRegistry> {
        let mut registrations: HashMap<String, Arc<HandlerRegistration>> = HashMap::new();

        for registration in self.pending {
            let table = registration.table_name.clone();

            if table.is_empty() {
                error!(
                    registration = %registration.registration_name,
                    "Handler registration has an empty table name"
                );
                return Err(BrokerError::InvalidInput(format!(
                    "Registration '{}' has an empty table name",
                    registration.registration_name
                )));
            }

            if let Some(existing) = registrations.get(&table) {
                error!(
                    table = %table,
                    rejected = %registration.registration_name,
                    existing = %existing.registration_name,
                    "Duplicate table handler registration rejected"
                );
                continue;
            }

            if let Err(e) = registration.handler.validate_setup() {
                error!(
                    table = %table,
                    registration = %registration.registration_name,
                    error = %e,
                    "Handler setup validation failed, removing registration"
                );
                continue;
            }

            registration.handler.on_registered(&table);
            registrations.insert(table, Arc::new(registration));
        }

        info!(
            registered = registrations.len(),
            "Table handler registry built"
        );

        Ok(HandlerRegistry { registrations })
    }
}

/// Immutable table-name → registration lookup.
#[derive(Debug)]
pub struct HandlerRegistry {
    registrations: HashMap<String, Arc<HandlerRegistration>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    /// Look up a registration; the probe is canonicalized to upper case.
    pub fn get(&self, table_name: &str) -> Option<Arc<HandlerRegistration>> {
        self.registrations.get(&table_name.to_uppercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Iterate over registrations, for boot-time logging.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<HandlerRegistration>> {
        self.registrations.values()
    }

    /// Log the registration table the way operators expect to see it at boot.
    pub fn log_configuration(&self) {
        if self.is_empty() {
            warn!("No table handlers registered");
            return;
        }

        info!("=== TABLE HANDLER CONFIGURATION ===");
        for registration in self.registrations.values() {
            let mut operations: Vec<&str> = registration
                .supported_operations
                .iter()
                .map(ChangeType::as_str)
                .collect();
            operations.sort_unstable();
            info!(
                table = %registration.table_name,
                handler = %registration.registration_name,
                operations = ?operations,
                record_type = registration.record_type_name.unwrap_or("raw mapping"),
                enabled = registration.enabled,
                "Registered table handler"
            );
        }
        info!("===================================");
    }
}
