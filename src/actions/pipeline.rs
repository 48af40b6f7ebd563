use crate::actions::server::{
    AuctionSnapshot, CommitApi, PackPurchaseCommit, PackSnapshot, PlaceBidCommit,
};
use crate::actions::{ActionKind, ActionPhase, ActionRequest, BidRequest, PackPurchaseRequest};
use crate::cache::InvalidationBus;
use crate::error::Error;
use crate::session::{AuthorizeRequest, SessionManager, WalletAuthorizer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Bid(AuctionSnapshot),
    Purchase(PackSnapshot),
}

/// Drives every monetary action through the same four ordered phases:
/// validate locally, authorize with the external signer, commit to the
/// server of record, invalidate the affected cached views. Each phase fails
/// closed; a commit failure after a successful authorization is reported as
/// its own error class because the money may already have moved.
pub struct ActionPipeline {
    session: Arc<SessionManager>,
    authorizer: Arc<dyn WalletAuthorizer>,
    commit: Arc<dyn CommitApi>,
    bus: Arc<InvalidationBus>,
    in_flight: Mutex<HashMap<(ActionKind, u64), ActionPhase>>,
}

impl ActionPipeline {
    pub fn new(
        session: Arc<SessionManager>,
        authorizer: Arc<dyn WalletAuthorizer>,
        commit: Arc<dyn CommitApi>,
        bus: Arc<InvalidationBus>,
    ) -> Self {
        Self {
            session,
            authorizer,
            commit,
            bus,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn action_phase(&self, kind: ActionKind, target: u64) -> Option<ActionPhase> {
        self.in_flight.lock().get(&(kind, target)).copied()
    }

    pub async fn place_bid(&self, request: BidRequest) -> Result<AuctionSnapshot, Error> {
        match self.submit(ActionRequest::Bid(request)).await? {
            ActionOutcome::Bid(snapshot) => Ok(snapshot),
            ActionOutcome::Purchase(_) => Err(Error::InvalidArgument(
                "bid submission produced a purchase outcome".to_string(),
            )),
        }
    }

    pub async fn purchase_pack(&self, request: PackPurchaseRequest) -> Result<PackSnapshot, Error> {
        match self.submit(ActionRequest::Purchase(request)).await? {
            ActionOutcome::Purchase(snapshot) => Ok(snapshot),
            ActionOutcome::Bid(_) => Err(Error::InvalidArgument(
                "purchase submission produced a bid outcome".to_string(),
            )),
        }
    }

    pub async fn submit(&self, request: ActionRequest) -> Result<ActionOutcome, Error> {
        let kind = request.kind();
        let target = request.target();
        let guard = FlightGuard::acquire(self, kind, target)?;

        let account = self.session.account().ok_or_else(|| {
            Error::Validation("wallet is not connected".to_string())
        })?;
        request.validate()?;

        guard.set_phase(ActionPhase::Authorizing);
        self.authorizer
            .authorize(AuthorizeRequest {
                kind,
                target,
                amount: request.amount(),
                address: account.address.clone(),
            })
            .await
            .map_err(|error| match error {
                Error::Authorization(_) => error,
                other => Error::Authorization(other.to_string()),
            })?;

        guard.set_phase(ActionPhase::Committing);
        let outcome = match &request {
            ActionRequest::Bid(bid) => self
                .commit
                .place_bid(PlaceBidCommit {
                    auction_id: bid.auction_id,
                    amount: bid.amount,
                    bidder_address: account.address.clone(),
                })
                .await
                .map(ActionOutcome::Bid),
            ActionRequest::Purchase(purchase) => self
                .commit
                .purchase_pack(PackPurchaseCommit {
                    pack_id: purchase.pack_id,
                    address: account.address.clone(),
                })
                .await
                .map(ActionOutcome::Purchase),
        }
        .map_err(|error| match error {
            Error::Commit(_) => error,
            other => Error::Commit(other.to_string()),
        })?;

        guard.set_phase(ActionPhase::Invalidating);
        for key in request.stale_keys() {
            self.bus.mark_stale(key);
        }

        Ok(outcome)
    }
}

/// Holds the (kind, target) slot for the lifetime of one submission; the
/// slot doubles as the per-target logical mutex the concurrency model
/// requires.
struct FlightGuard<'a> {
    pipeline: &'a ActionPipeline,
    kind: ActionKind,
    target: u64,
}

impl<'a> FlightGuard<'a> {
    fn acquire(
        pipeline: &'a ActionPipeline,
        kind: ActionKind,
        target: u64,
    ) -> Result<Self, Error> {
        let mut in_flight = pipeline.in_flight.lock();
        if in_flight.contains_key(&(kind, target)) {
            return Err(Error::Busy { kind, target });
        }
        in_flight.insert((kind, target), ActionPhase::Validating);
        Ok(Self {
            pipeline,
            kind,
            target,
        })
    }

    fn set_phase(&self, phase: ActionPhase) {
        if let Some(slot) = self
            .pipeline
            .in_flight
            .lock()
            .get_mut(&(self.kind, self.target))
        {
            *slot = phase;
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.pipeline
            .in_flight
            .lock()
            .remove(&(self.kind, self.target));
    }
}
