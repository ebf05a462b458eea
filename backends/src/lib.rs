pub mod backend;
pub mod registry;
pub mod secret;
pub mod setup;

pub use backend::{BackendDescriptor, ConfigResolver, FnResolver, Provider};
pub use registry::BackendRegistry;
pub use secret::Secret;
pub use setup::{prepare_backend, RESTIC_CACHE_DIR};
