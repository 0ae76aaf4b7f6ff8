mod instance;
mod probe;
mod selection;
mod service_registry;

pub use instance::{HealthStatus, InstanceRegistration, ServiceInstance};
pub use probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use selection::SelectionStrategy;
pub use service_registry::{EnhancedServiceRegistry, RegistryConfig, RegistryMetrics};

pub(crate) use instance::join_url;
