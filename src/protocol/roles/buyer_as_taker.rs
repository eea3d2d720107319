use super::TradeEvent;
use crate::message::TradeMessageBody;
use crate::protocol::model::ProtocolModel;
use crate::protocol::tasks::*;
use crate::task::TaskRunner;
use crate::trade::TradePhase;

pub(crate) fn pipeline(
    event: &TradeEvent,
    phase: TradePhase,
) -> Option<TaskRunner<ProtocolModel>> {
    match (event, phase) {
        (TradeEvent::TakeOffer, TradePhase::Init) => Some(
            TaskRunner::new("TakeOffer")
                .add(CreateDepositInputs)
                .add(SendPayDepositRequest),
        ),
        (
            TradeEvent::Inbound(TradeMessageBody::RequestPublishDepositTx { .. }),
            TradePhase::DepositRequested,
        ) => Some(super::taker_publish_pipeline()),
        (TradeEvent::ConfirmFiatSent, TradePhase::DepositPublished) => Some(
            TaskRunner::new("FiatTransferStarted")
                .add(CreateAndSignPayoutTx)
                .add(SendFiatTransferStartedMessage),
        ),
        (
            TradeEvent::Inbound(TradeMessageBody::PayoutTxPublished { .. }),
            TradePhase::FiatSent,
        ) => Some(TaskRunner::new("PayoutReceived").add(ProcessPayoutPublished)),
        _ => super::cancel_pipeline(event, phase),
    }
}
