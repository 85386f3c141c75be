//! # eRx Types
//!
//! Shared domain types for the eRx prescription platform.
//!
//! These are internal domain models used across the token, policy and core
//! crates:
//! - `LicenseNumber`: a validated practitioner registry identifier
//! - `Role`: the closed set of platform roles (with an explicit `Unknown`)
//! - `Identity`: the authenticated caller, as embedded in access tokens
//! - `ServiceError` / `ErrorKind`: the error taxonomy every service speaks

pub mod error;
pub mod identity;
pub mod license;
pub mod role;

pub use error::{ErrorKind, ServiceError, ServiceResult};
pub use identity::Identity;
pub use license::{LicenseError, LicenseNumber};
pub use role::Role;
