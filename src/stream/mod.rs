pub mod client;
pub mod types;

pub const NEW_AUCTION_TOPIC: &str = "new-auction";
pub const NEW_BID_TOPIC: &str = "new-bid";
