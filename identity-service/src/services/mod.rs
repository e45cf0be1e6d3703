//! Services layer for identity-service.
//!
//! Business logic for the session authority and the organization
//! projection, plus the storage, broker and token seams they run on.

pub mod auth;
pub mod broker;
mod database;
pub mod error;
pub mod eventbox;
pub mod events;
mod jwt;
mod memory;
pub mod metrics;
mod policy;
pub mod projection;
pub mod storage;

pub use auth::{AuthService, RegisterParams, TokensPair};
pub use broker::{Broker, BrokerError, Delivery, EventEnvelope, HttpBroker, MemoryBroker, Subscription};
pub use database::Database;
pub use error::ServiceError;
pub use eventbox::EventBoxService;
pub use jwt::{hashes_match, JwtService, SessionClaims, TokenKind, TokenSigner};
pub use memory::MemoryStorage;
pub use policy::{PolicyError, PolicyService};
pub use projection::{Projected, ProjectionError, ProjectionService};
pub use storage::{Storage, StorageError, Transaction};
