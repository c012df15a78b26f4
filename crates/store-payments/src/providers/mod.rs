//! Payment provider clients

pub mod paypal;
pub mod stripe;

pub use paypal::{PayPalAccount, PayPalApi, PayPalClient, PayPalMode};
pub use stripe::{RequestedMode, StripeAccount, StripeGateway, StripeMode, StripeRegistry};
