mod dialect;
mod error;
mod rewrite;
mod store;
mod value;

pub use dialect::Dialect;
pub use error::StoreError;
pub use rewrite::rewrite;
pub use store::{Db, Tx};
pub use value::{Row, Value};
