//! Message model of the Node Resource Interface (NRI) plugin protocol.
//!
//! Only the subset of `nri.pkg.api.v1alpha1` that a resource-adjusting plugin
//! needs is modelled here. Field tags match the upstream protobuf definitions,
//! so unknown fields sent by newer runtimes are skipped on decode.

pub mod event;
pub mod messages;
pub mod types;

pub use event::Event;
pub use event::EventMask;
pub use messages::*;
pub use types::*;

/// ttrpc service implemented by the plugin and called by the runtime.
pub const PLUGIN_SERVICE: &str = "nri.pkg.api.v1alpha1.Plugin";

/// ttrpc service implemented by the runtime and called by the plugin.
pub const RUNTIME_SERVICE: &str = "nri.pkg.api.v1alpha1.Runtime";
