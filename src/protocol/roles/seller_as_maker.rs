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
        (
            TradeEvent::Inbound(TradeMessageBody::PayDepositRequest { .. }),
            TradePhase::Init,
        ) => Some(super::maker_deposit_pipeline()),
        (
            TradeEvent::Inbound(TradeMessageBody::DepositTxPublished { .. }),
            TradePhase::DepositRequested,
        ) => Some(
            TaskRunner::new("DepositConfirmed")
                .add(ProcessDepositPublished)
                .add(VerifyFeePayment),
        ),
        (
            TradeEvent::Inbound(TradeMessageBody::FiatTransferStarted { .. }),
            TradePhase::DepositPublished,
        ) => Some(TaskRunner::new("FiatTransferReceived").add(ProcessFiatTransferStarted)),
        (TradeEvent::ConfirmPaymentReceived, TradePhase::FiatSent) => Some(
            TaskRunner::new("PaymentReceived")
                .add(SignAndPublishPayoutTx)
                .add(SendPayoutPublishedMessage),
        ),
        _ => super::cancel_pipeline(event, phase),
    }
}
