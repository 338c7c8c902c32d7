pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod providers;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod translate;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use logging::{AuditLog, AuditRecord};
pub use proxy::{DispatchOutput, Dispatcher};
pub use server::{build_router, AppState};
pub use translate::Format;
