//! A handle-based boundary layer for driving a feature-evaluation client from another runtime.
//!
//! # Overview
//!
//! Callers never see native objects. Every [`Options`], [`Client`], and [`UserContext`] lives in
//! a [`Registry`] and is referenced by a typed [`Handle`], which crosses the boundary as an
//! opaque `u64` token. Tokens are generation-checked: a released, zero, or wrong-kind token is
//! rejected with [`Error::InvalidHandle`] instead of being dereferenced.
//!
//! [`Bridge`] exposes every boundary operation over a registry, and [`ffi`] exposes the same
//! operations as a C ABI over the process-wide [`Bridge::global`] instance.
//!
//! A client fetches specs in the background after [`Client::initialize`], which returns an
//! [`InitHandle`] that completes exactly once. Evaluations are delegated to an [`Evaluator`];
//! the bundled [`SpecsEvaluator`] serves the values the specs document resolves.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Construction (options, clients, users) fails
//! with an error and mints no handle. Evaluations fail closed: [`Bridge::check_gate`] returns
//! `false` when a handle does not resolve.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `evalbridge`
//! target. C callers can install a stderr logger with [`ffi::evalbridge_init_logger`].
//!
//! # Examples
//!
//! ```no_run
//! use evalbridge::{Bridge, UserFields};
//!
//! let bridge = Bridge::new();
//! let options = bridge.create_options(Some("https://example.com/v1/specs")).unwrap();
//! let client = bridge.create_client("secret-1", options).unwrap();
//! let _ = bridge.initialize(client).unwrap().wait();
//!
//! let user = bridge
//!     .create_user(UserFields { user_id: Some("u1"), ..UserFields::default() })
//!     .unwrap();
//! let enabled = bridge.check_gate(client, user, "my_gate");
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod bridge;
mod client;
mod error;
pub mod evaluator;
pub mod ffi;
mod handle;
mod hashing;
mod init_response;
mod initializer;
mod options;
mod registry;
mod sdk_metadata;
pub mod specs;
mod specs_fetcher;
mod specs_store;
mod user;

pub use bridge::Bridge;
pub use client::{Client, Lifecycle};
pub use error::{Error, Result};
pub use evaluator::{
    DynamicConfig, EvaluationDetails, EvaluationReason, Evaluator, Experiment, FeatureGate, Layer,
    SpecsEvaluator,
};
pub use handle::{ClientHandle, Handle, HandleKind, HandleTarget, OptionsHandle, UserHandle};
pub use hashing::HashAlgorithm;
pub use init_response::ClientInitResponseOptions;
pub use initializer::InitHandle;
pub use options::Options;
pub use registry::{HandleTable, Registry};
pub use user::{UserContext, UserFields};
