mod cache;
mod filters;
mod fixture;
mod nonce;
mod relay;
mod subscriptions;
mod wallet;

pub use self::cache::Cache;
pub use self::filters::Filters;
pub use self::fixture::Fixture;
pub use self::nonce::Nonce;
pub use self::relay::Relay;
pub use self::subscriptions::{Notification, SubscriptionKind, Subscriptions};
pub use self::wallet::{padded_gas, HookedWallet, GAS_CAP};
