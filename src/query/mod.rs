pub mod engine;
pub mod mask;
pub mod result;

pub use engine::{Execution, QueryEngine};
pub use mask::mask_query_pwd;
pub use result::{QueryError, QueryOutcome, QueryResult, ResultSet, QUERY_CANCELED};
