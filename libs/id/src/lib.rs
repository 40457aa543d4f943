//! # tend-id
//!
//! Typed identifiers for the tend reconciliation engine.
//!
//! ## Design Principles
//!
//! - Identifiers are opaque: the engine compares and hashes them, it never
//!   interprets their contents
//! - Each identifier kind is its own type so a pod name can never be passed
//!   where an object UID is expected
//! - Values coming from the cluster are trusted (`new`), values coming from
//!   users are validated (`parse`)
//!
//! ## Identifier Kinds
//!
//! - `ResourceName`: a logical application resource declared by configuration
//! - `ObjectUid`: a raw cluster object (pod, event, or any owner in its chain)
//! - `PodId`, `Namespace`, `ContainerName`, `ContainerId`: cluster coordinates
//! - `SpanId`: a log correlation span (`pod:<id>`, `build:<resource>`)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::MAX_ID_LEN;
pub use types::*;
