pub mod pipeline;
pub mod server;

use crate::cache::QueryKey;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Bid,
    Purchase,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bid => formatter.write_str("bid"),
            Self::Purchase => formatter.write_str("purchase"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionPhase {
    Validating,
    Authorizing,
    Committing,
    Invalidating,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidRequest {
    pub auction_id: u64,
    pub amount: f64,
    pub minimum_bid: f64,
    pub wallet_balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackPurchaseRequest {
    pub pack_id: u64,
    pub price: f64,
    pub wallet_balance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    Bid(BidRequest),
    Purchase(PackPurchaseRequest),
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Bid(_) => ActionKind::Bid,
            Self::Purchase(_) => ActionKind::Purchase,
        }
    }

    pub fn target(&self) -> u64 {
        match self {
            Self::Bid(bid) => bid.auction_id,
            Self::Purchase(purchase) => purchase.pack_id,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            Self::Bid(bid) => bid.amount,
            Self::Purchase(purchase) => purchase.price,
        }
    }

    /// Local precondition checks; failing here has no external side effect.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::Bid(bid) => {
                if !bid.amount.is_finite()
                    || !bid.minimum_bid.is_finite()
                    || !bid.wallet_balance.is_finite()
                {
                    return Err(Error::Validation(
                        "bid amounts must be finite numbers".to_string(),
                    ));
                }
                if bid.amount <= 0.0 {
                    return Err(Error::Validation("bid amount must be positive".to_string()));
                }
                if bid.amount < bid.minimum_bid {
                    return Err(Error::Validation(format!(
                        "minimum bid is {}",
                        bid.minimum_bid
                    )));
                }
                if bid.amount > bid.wallet_balance {
                    return Err(Error::Validation(format!(
                        "insufficient balance for bid of {}",
                        bid.amount
                    )));
                }
                Ok(())
            }
            Self::Purchase(purchase) => {
                if !purchase.price.is_finite() || !purchase.wallet_balance.is_finite() {
                    return Err(Error::Validation(
                        "pack price must be a finite number".to_string(),
                    ));
                }
                if purchase.price <= 0.0 {
                    return Err(Error::Validation("pack price must be positive".to_string()));
                }
                if purchase.price > purchase.wallet_balance {
                    return Err(Error::Validation(
                        "insufficient balance for pack purchase".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// The cached views a committed action makes stale: the entity list,
    /// the single-entity view, and the activity feed.
    pub fn stale_keys(&self) -> [QueryKey; 3] {
        match self {
            Self::Bid(bid) => [
                QueryKey::Auctions,
                QueryKey::Auction(bid.auction_id),
                QueryKey::ActivityFeed,
            ],
            Self::Purchase(purchase) => [
                QueryKey::Packs,
                QueryKey::Pack(purchase.pack_id),
                QueryKey::ActivityFeed,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(amount: f64, minimum_bid: f64, wallet_balance: f64) -> ActionRequest {
        ActionRequest::Bid(BidRequest {
            auction_id: 42,
            amount,
            minimum_bid,
            wallet_balance,
        })
    }

    #[test]
    fn accepts_bid_meeting_minimum_and_balance() {
        assert!(bid(1.5, 1.0, 2.0).validate().is_ok());
    }

    #[test]
    fn rejects_bid_below_minimum() {
        let error = bid(0.5, 1.0, 2.0).validate().expect_err("bid is too low");
        match error {
            Error::Validation(message) => assert_eq!(message, "minimum bid is 1"),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn rejects_bid_above_balance() {
        let error = bid(3.0, 1.0, 2.0).validate().expect_err("bid exceeds funds");
        assert!(matches!(error, Error::Validation(_)));
    }

    #[test]
    fn rejects_non_finite_amounts() {
        assert!(bid(f64::NAN, 1.0, 2.0).validate().is_err());
        assert!(bid(1.5, f64::INFINITY, 2.0).validate().is_err());
    }

    #[test]
    fn rejects_unaffordable_pack_purchase() {
        let purchase = ActionRequest::Purchase(PackPurchaseRequest {
            pack_id: 3,
            price: 5.0,
            wallet_balance: 1.0,
        });
        assert!(matches!(purchase.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn stale_keys_cover_list_entity_and_feed() {
        assert_eq!(
            bid(1.5, 1.0, 2.0).stale_keys(),
            [
                QueryKey::Auctions,
                QueryKey::Auction(42),
                QueryKey::ActivityFeed
            ]
        );

        let purchase = ActionRequest::Purchase(PackPurchaseRequest {
            pack_id: 3,
            price: 1.0,
            wallet_balance: 2.0,
        });
        assert_eq!(
            purchase.stale_keys(),
            [QueryKey::Packs, QueryKey::Pack(3), QueryKey::ActivityFeed]
        );
    }
}
