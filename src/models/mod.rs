pub mod proxy;
pub mod record;

pub use proxy::*;
pub use record::*;
