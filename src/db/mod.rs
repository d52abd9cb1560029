mod connection;
mod query;
pub mod safety;
mod schema;

pub use connection::*;
pub use query::*;
pub use schema::*;
