mod traits;

pub(crate) use traits::unsupported;
pub use traits::{HedgeExchange, LendingProtocol};

#[cfg(test)]
pub use traits::MockHedgeExchange;
