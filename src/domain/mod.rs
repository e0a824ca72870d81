pub mod account;
pub mod fallback;
pub mod lending;
pub mod market;
pub mod position;
pub mod state;

pub use account::*;
pub use fallback::*;
pub use lending::*;
pub use market::*;
pub use position::*;
pub use state::*;
