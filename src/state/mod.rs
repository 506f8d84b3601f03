//! Persistent state for the fleet.
//!
//! One SQLite database (`<data_dir>/fleet.db`, WAL mode) holds:
//!
//! - the service registry (one row per supervised service)
//! - the host and container catalog
//! - the derived `system_status` singleton
//!
//! [`Store`] owns the connection. [`ServiceRegistry`] and [`Catalog`] are cheap
//! cloneable handles over it that get injected into the supervisor and the
//! reconciler; there is no process-wide instance.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::open(&data_dir).await?;
//! let registry = store.registry();
//! let catalog = store.catalog();
//! ```

mod catalog;
mod registry;
mod sqlite;
mod types;

pub use catalog::{Catalog, ContainerChanges, HostRefresh};
pub use registry::{ServiceRegistry, StartingRecord};
pub use sqlite::{LockMode, Store};
pub use types::{
    ContainerStatus, Host, HostResources, HostStatus, ManagedContainer, ManagedService,
    PortBinding, ServiceStatus, ServiceType, SystemStatus,
};

impl Store {
    pub fn registry(&self) -> ServiceRegistry {
        ServiceRegistry::new(self.clone())
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.clone())
    }
}
