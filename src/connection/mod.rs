//! Live connections and their lifecycle: creation by the finder, ownership
//! by the pool, exchanges carried in between.

mod connection;
mod exchange;
mod finder;
mod pool;

pub(crate) use connection::{CallReference, Connection};
pub(crate) use exchange::Exchange;
pub(crate) use finder::ExchangeFinder;
pub use pool::ConnectionPool;
