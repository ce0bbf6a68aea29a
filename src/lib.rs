//! Query workspace for a database proxy: worksheets, query tabs, ETL tasks and
//! their connections, kept consistent across cancellation, connection loss
//! and reloads.
pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod etl;
pub mod logging;
pub mod persistence;
pub mod query;
pub mod session;
pub mod workspace;

pub use config::Config;
pub use error::{ConnectionError, PersistenceError, WorkspaceError, WorkspaceResult};
pub use workspace::Workspace;
