pub mod resources;
pub mod store;
pub mod watch;

pub use resources::ResourceManager;
pub use store::{NEW_OBJECT_VERSION, Registry, RegistryError};
pub use watch::{EventLog, ObjectRef, RegistryEvent};
