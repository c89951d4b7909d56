#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Relay wires a declarative configuration of **apps**, **flows** and
//! **components** into a running event-streaming pipeline: components
//! consume messages from a broker (or another input), transform them with
//! expressions and declarative operators, optionally invoke a remote
//! service, and publish results, all connected by bounded queues with
//! at-least-once acknowledgement.
//!
//! An **app** is either a *standard* app (a named list of independently
//! chained [`engine::flow::Flow`]s) or a *simplified* app (a `broker`
//! section plus a flat component list, synthesized into one implicit flow
//! with a broker input, an optional subscription router, the user
//! components, and a broker output).
//!
//! [`connector::Connector`] is the top-level orchestrator: it loads one or
//! more configuration documents, builds the shared cache/timer services,
//! starts a connector-wide error flow, and starts every configured app.

pub mod connector;

pub use app;
pub use broker;
pub use component;
pub use config;
pub use context;
pub use engine;
pub use expr;
pub use message;
pub use services;
pub use signal;
pub use task;
