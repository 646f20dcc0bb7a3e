//! External data acquisition: the spot stream, market discovery and the
//! order-book source.

pub mod clob_book;
pub mod gamma;
pub mod spot_feed;

pub use clob_book::{BookSource, ClobBookClient};
pub use gamma::{MarketDiscovery, MarketSource};
pub use spot_feed::{SpotFeed, SpotPoint, SpotSource};
