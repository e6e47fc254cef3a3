pub mod callbacks;
pub mod fleet;
pub mod handlers;
pub mod outbound;
pub mod state;

pub use fleet::BotFleet;
pub use state::SessionStore;
