pub mod entities;
pub mod ids;
pub mod store;

pub use entities::*;
pub use ids::*;
pub use store::{Removal, SessionStore};
