//! Maps (event, phase) to the ordered task pipeline each role runs. An event
//! with no wiring for the current phase yields `None` and is dropped or
//! rejected by the actor without touching trade state.

pub(crate) mod buyer_as_maker;
pub(crate) mod buyer_as_taker;
pub(crate) mod seller_as_maker;
pub(crate) mod seller_as_taker;

use crate::common::types::TradeRole;
use crate::message::TradeMessageBody;
use crate::protocol::model::ProtocolModel;
use crate::protocol::tasks::*;
use crate::task::TaskRunner;
use crate::trade::TradePhase;

/// What the actor asks a role wiring to react to: an operator command or a
/// phase-validated inbound message.
pub(crate) enum TradeEvent {
    TakeOffer,
    ConfirmFiatSent,
    ConfirmPaymentReceived,
    RequestCancel,
    RespondCancel { accept: bool },
    Inbound(TradeMessageBody),
}

impl TradeEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TradeEvent::TakeOffer => "TakeOffer",
            TradeEvent::ConfirmFiatSent => "ConfirmFiatSent",
            TradeEvent::ConfirmPaymentReceived => "ConfirmPaymentReceived",
            TradeEvent::RequestCancel => "RequestCancel",
            TradeEvent::RespondCancel { .. } => "RespondCancel",
            TradeEvent::Inbound(body) => body.into(),
        }
    }

    pub(crate) fn is_cancel_related(&self) -> bool {
        matches!(
            self,
            TradeEvent::RequestCancel
                | TradeEvent::RespondCancel { .. }
                | TradeEvent::Inbound(TradeMessageBody::RequestCancelTrade { .. })
                | TradeEvent::Inbound(TradeMessageBody::CancelTradeAccepted { .. })
                | TradeEvent::Inbound(TradeMessageBody::CancelTradeRejected { .. })
        )
    }
}

pub(crate) fn pipeline_for(
    role: TradeRole,
    event: &TradeEvent,
    phase: TradePhase,
) -> Option<TaskRunner<ProtocolModel>> {
    match role {
        TradeRole::BuyerAsMaker => buyer_as_maker::pipeline(event, phase),
        TradeRole::BuyerAsTaker => buyer_as_taker::pipeline(event, phase),
        TradeRole::SellerAsMaker => seller_as_maker::pipeline(event, phase),
        TradeRole::SellerAsTaker => seller_as_taker::pipeline(event, phase),
    }
}

/// Cancel wiring shared by all four roles; only valid before the fiat leg
/// settles.
fn cancel_pipeline(event: &TradeEvent, phase: TradePhase) -> Option<TaskRunner<ProtocolModel>> {
    if !phase.at_or_before_fiat_sent() {
        return None;
    }
    match event {
        TradeEvent::RequestCancel => {
            Some(TaskRunner::new("RequestCancel").add(SendCancelRequest))
        }
        TradeEvent::RespondCancel { accept: true } => {
            Some(TaskRunner::new("AcceptCancel").add(AcceptCancel))
        }
        TradeEvent::RespondCancel { accept: false } => {
            Some(TaskRunner::new("RejectCancel").add(RejectCancel))
        }
        TradeEvent::Inbound(TradeMessageBody::RequestCancelTrade { .. }) => {
            Some(TaskRunner::new("PeerCancelRequest").add(ProcessCancelRequest))
        }
        TradeEvent::Inbound(TradeMessageBody::CancelTradeAccepted { .. }) => {
            Some(TaskRunner::new("PeerCancelAccepted").add(ProcessCancelAccepted))
        }
        TradeEvent::Inbound(TradeMessageBody::CancelTradeRejected { .. }) => {
            Some(TaskRunner::new("PeerCancelRejected").add(ProcessCancelRejected))
        }
        _ => None,
    }
}

/// Maker's answer to the opening deposit request, identical for both maker
/// roles.
fn maker_deposit_pipeline() -> TaskRunner<ProtocolModel> {
    TaskRunner::new("MakerDepositNegotiation")
        .add(ProcessDepositRequest)
        .add(VerifyPeerAccount)
        .add(CreateDepositInputs)
        .add(VerifyAndSignContract)
        .add(SendPublishDepositTxRequest)
}

/// Taker's publish step once the maker countersigned, identical for both
/// taker roles.
fn taker_publish_pipeline() -> TaskRunner<ProtocolModel> {
    TaskRunner::new("TakerDepositPublish")
        .add(ProcessPublishDepositTxRequest)
        .add(SignAndPublishDepositTx)
        .add(SendDepositPublishedMessage)
}
