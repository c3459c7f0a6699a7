//! # token-store
//!
//! OAuth2 access-token lifecycle: generating token values, persisting grants
//! across interchangeable backends and resolving presented tokens.
//!
//! ## Components
//!
//! - **Generator:** signed (JWT) or opaque token values.
//! - **Store:** one contract over memory, file, database and Redis backends,
//!   all sharing the same reuse/rotation rules.
//! - **Resolver:** maps a bearer token back to its record.
//! - **Service:** builds the three from one [`TokenConfig`].

pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod generator;
pub mod model;
pub mod resolver;
pub mod service;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StoreBackend, StoreConfig, TokenConfig, TokenStrategy};
pub use error::{Result, TokenError};
pub use fingerprint::{token_key, Fingerprint};
pub use generator::{GenerateBasic, Generator, TokenGenerator};
pub use model::{Authentication, TokenRecord};
pub use resolver::{Resolver, TokenResolver};
pub use service::TokenService;
pub use store::{create_store, Store, TokenStore};
