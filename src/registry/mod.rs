//! # Handler Registry
//!
//! The binding from table names to change-handler capabilities. Built once at
//! startup through an explicit registration API; the runtime sees only the
//! immutable lookup.

pub mod change_handler;
pub mod handler_registry;

pub use change_handler::ChangeHandler;
pub use handler_registry::{
    HandlerRegistration, HandlerRegistry, HandlerRegistryBuilder, RegistrationOptions,
};
