pub mod hyperliquid_rest;
pub mod paper_lending;
pub mod stream;

pub use hyperliquid_rest::HyperliquidRest;
pub use paper_lending::{PaperLending, TransferHook};
pub use stream::{StreamClient, Subscription, TopicHandler};
