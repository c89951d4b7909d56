#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Turns a resolved [`config::FlowConfig`] into a running chain of component
//! groups. See [`flow::Flow`] for the entry point.

pub mod flow;

/// Errors raised while starting or running a flow.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A component factory failed to construct one of the flow's
    /// configured components.
    #[error("component construction failed (component: {component}, reason: {error})")]
    ComponentConstruction {
        /// The configured component name.
        component: String,
        /// Why construction failed.
        error: String,
    },
}
