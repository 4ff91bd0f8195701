mod event;
mod preview;

pub use event::{EventType, LifecycleEvent};
pub use preview::{
    Database, DatabaseEngine, Preview, PreviewConfig, PreviewKind, PreviewStatus, ServiceConfig,
    ServiceInstance, ServiceStatus,
};
