mod common;

#[cfg(test)]
mod timeout_tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::sleep;

    use tradewind::protocol::TradeNotif;
    use tradewind::trade::{CancelState, OfferDirection, TradePhase};

    use super::common::harness::{
        next_notif_matching, wait_for_trade, wait_until_phase, MemoryHub, TestPeer,
    };
    use super::common::logger;

    #[tokio::test]
    async fn unanswered_step_resends_once_then_fails_the_trade() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "maker.onion", Duration::from_millis(300)).await;
        let taker = TestPeer::start(&hub, "taker.onion", Duration::from_millis(300)).await;

        let offer = maker.new_offer("offer-t1", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();

        // Maker is offline and never drains its mailbox, so the take request
        // goes unanswered forever.
        hub.set_offline(&maker.address, true);
        let taker_access = taker.manager.take_offer(offer).await.unwrap();

        let (notif_tx, mut notifs) = mpsc::channel::<TradeNotif>(100);
        taker_access.register_notif_tx(notif_tx).await.unwrap();
        let notif = next_notif_matching(&mut notifs, |notif| {
            matches!(notif, TradeNotif::Failed { .. })
        })
        .await;
        match notif {
            TradeNotif::Failed { error } => assert!(error.contains("timed out")),
            _ => unreachable!(),
        }

        let state = taker_access.query_state().await;
        assert_eq!(state.phase, TradePhase::Failed);
        assert!(state.error_message.is_some());
        // Exactly one resend: the original take request plus one retry.
        assert_eq!(hub.mailbox_len(&maker.address), 2);

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_cancel_request_reverts_instead_of_failing() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "ivan.onion", Duration::from_millis(500)).await;
        let taker = TestPeer::start(&hub, "judy.onion", Duration::from_millis(500)).await;

        let offer = maker.new_offer("offer-t2", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-t2").await;
        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        hub.set_offline(&maker.address, true);

        let (notif_tx, mut notifs) = mpsc::channel::<TradeNotif>(100);
        taker_access.register_notif_tx(notif_tx).await.unwrap();
        taker_access.request_cancel("second thoughts").await.unwrap();
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::RequestedByMe
        );

        // The peer never answers. The request expires quietly; only the
        // cancel attempt dies, not the trade.
        next_notif_matching(&mut notifs, |notif| {
            matches!(notif, TradeNotif::CancelRejected { .. })
        })
        .await;

        let state = taker_access.query_state().await;
        assert_eq!(state.cancel_state, CancelState::None);
        assert_eq!(state.phase, TradePhase::DepositPublished);
        assert!(state.error_message.is_none());

        // And the trade is still drivable once the peer is back.
        hub.set_offline(&maker.address, false);
        sleep(Duration::from_millis(100)).await;
        taker_access.confirm_fiat_sent().await.unwrap();
        wait_until_phase(&maker_access, TradePhase::FiatSent).await;

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }
}
