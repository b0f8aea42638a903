//! Stan backends.
//!
//! - `backend`: the `StanBackend` trait and the fit/sampling policy shared by
//!   all backends
//! - `cmdstan`: precompiled CmdStan executable
//! - `httpstan`: httpstan REST service
//! - `registry`: name → backend lookup

pub mod backend;
pub mod cmdstan;
pub mod httpstan;
pub mod registry;

pub use backend::{BackendOptions, FitOverrides, SampleOverrides, StanBackend, StanFit};
pub use cmdstan::CmdStanBackend;
pub use httpstan::HttpStanBackend;
pub use registry::{BackendFactory, StanBackendKind, backend_names, get_backend_class};
