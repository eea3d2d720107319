mod common;

#[cfg(test)]
mod cancel_tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use tradewind::protocol::TradeNotif;
    use tradewind::trade::{CancelState, OfferDirection, TradePhase};

    use super::common::harness::{
        next_notif_matching, wait_for_trade, wait_until_phase, MemoryHub, TestPeer,
    };
    use super::common::logger;

    #[tokio::test]
    async fn rejected_cancel_resumes_the_trade() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "maker.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "taker.onion", Duration::from_secs(30)).await;

        let offer = maker.new_offer("offer-c1", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-c1").await;
        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        let (maker_notif_tx, mut maker_notifs) = mpsc::channel::<TradeNotif>(100);
        maker_access.register_notif_tx(maker_notif_tx).await.unwrap();
        let (taker_notif_tx, mut taker_notifs) = mpsc::channel::<TradeNotif>(100);
        taker_access.register_notif_tx(taker_notif_tx).await.unwrap();

        taker_access.request_cancel("rate moved").await.unwrap();
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::RequestedByMe
        );

        let notif = next_notif_matching(&mut maker_notifs, |notif| {
            matches!(notif, TradeNotif::CancelRequestedByPeer { .. })
        })
        .await;
        match notif {
            TradeNotif::CancelRequestedByPeer { reason } => assert_eq!(reason, "rate moved"),
            _ => unreachable!(),
        }

        maker_access
            .respond_cancel(false, "deposit already funded")
            .await
            .unwrap();

        let notif = next_notif_matching(&mut taker_notifs, |notif| {
            matches!(notif, TradeNotif::CancelRejected { .. })
        })
        .await;
        match notif {
            TradeNotif::CancelRejected { reason } => {
                assert_eq!(reason, "deposit already funded")
            }
            _ => unreachable!(),
        }

        // Both sides back to a clean slate, trade proceeds as if nothing
        // happened.
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::None
        );
        assert_eq!(
            maker_access.query_state().await.cancel_state,
            CancelState::None
        );
        assert_eq!(
            taker_access.query_state().await.phase,
            TradePhase::DepositPublished
        );

        taker_access.confirm_fiat_sent().await.unwrap();
        wait_until_phase(&maker_access, TradePhase::FiatSent).await;
        maker_access.confirm_payment_received().await.unwrap();
        wait_until_phase(&taker_access, TradePhase::Completed).await;

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn accepted_cancel_settles_both_sides() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "erin.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "frank.onion", Duration::from_secs(30)).await;

        let offer = maker.new_offer("offer-c2", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-c2").await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        let (maker_notif_tx, mut maker_notifs) = mpsc::channel::<TradeNotif>(100);
        maker_access.register_notif_tx(maker_notif_tx).await.unwrap();
        taker_access.request_cancel("found a better deal").await.unwrap();
        next_notif_matching(&mut maker_notifs, |notif| {
            matches!(notif, TradeNotif::CancelRequestedByPeer { .. })
        })
        .await;

        maker_access.respond_cancel(true, "").await.unwrap();
        wait_until_phase(&maker_access, TradePhase::Canceled).await;
        wait_until_phase(&taker_access, TradePhase::Canceled).await;

        let maker_state = maker_access.query_state().await;
        let taker_state = taker_access.query_state().await;
        assert_eq!(maker_state.cancel_state, CancelState::Accepted);
        assert_eq!(taker_state.cancel_state, CancelState::Accepted);
        // Deposit was already on chain, so cancellation settles through a
        // payout transaction both sides know.
        assert!(maker_state.payout_tx_id.is_some());
        assert_eq!(maker_state.payout_tx_id, taker_state.payout_tx_id);

        // Terminal trades can be archived.
        maker.manager.close_trade("offer-c2").await.unwrap();
        taker.manager.close_trade("offer-c2").await.unwrap();

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn simultaneous_cancel_requests_resolve_by_address_order() {
        logger::setup();
        let hub = MemoryHub::new();
        // The maker's address sorts lower, so its request wins the tie-break
        // and the taker must answer it. The taker gets a short step timeout:
        // were its own superseded request still being chased, that timer
        // would fire well inside this test.
        let maker = TestPeer::start(&hub, "dora.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "elio.onion", Duration::from_millis(500)).await;

        let offer = maker.new_offer("offer-c4", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-c4").await;
        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        let (taker_notif_tx, mut taker_notifs) = mpsc::channel::<TradeNotif>(100);
        taker_access.register_notif_tx(taker_notif_tx).await.unwrap();

        let (maker_result, taker_result) = tokio::join!(
            maker_access.request_cancel("maker wants out"),
            taker_access.request_cancel("taker wants out"),
        );
        maker_result.unwrap();
        taker_result.unwrap();

        let notif = next_notif_matching(&mut taker_notifs, |notif| {
            matches!(notif, TradeNotif::CancelRequestedByPeer { .. })
        })
        .await;
        match notif {
            TradeNotif::CancelRequestedByPeer { reason } => {
                assert_eq!(reason, "maker wants out")
            }
            _ => unreachable!(),
        }
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::RequestedByPeer
        );

        // Long past the loser's step timeout, the peer's request must still
        // be pending: no resend of the superseded request, no revert.
        tokio::time::sleep(Duration::from_millis(1_800)).await;
        let taker_state = taker_access.query_state().await;
        assert_eq!(taker_state.cancel_state, CancelState::RequestedByPeer);
        assert_eq!(taker_state.phase, TradePhase::DepositPublished);
        assert!(taker_state.error_message.is_none());
        assert_eq!(
            maker_access.query_state().await.cancel_state,
            CancelState::RequestedByMe
        );

        // The loser answers the request it lost to.
        taker_access.respond_cancel(true, "").await.unwrap();
        wait_until_phase(&taker_access, TradePhase::Canceled).await;
        wait_until_phase(&maker_access, TradePhase::Canceled).await;
        let maker_state = maker_access.query_state().await;
        let taker_state = taker_access.query_state().await;
        assert_eq!(maker_state.cancel_state, CancelState::Accepted);
        assert_eq!(taker_state.cancel_state, CancelState::Accepted);
        assert_eq!(maker_state.payout_tx_id, taker_state.payout_tx_id);

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_duplicate_cancel_request_leaves_the_first_intact() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "carol.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "dave.onion", Duration::from_secs(30)).await;

        let offer = maker.new_offer("offer-c5", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-c5").await;
        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        let (maker_notif_tx, mut maker_notifs) = mpsc::channel::<TradeNotif>(100);
        maker_access.register_notif_tx(maker_notif_tx).await.unwrap();
        let (taker_notif_tx, mut taker_notifs) = mpsc::channel::<TradeNotif>(100);
        taker_access.register_notif_tx(taker_notif_tx).await.unwrap();

        taker_access.request_cancel("rate moved").await.unwrap();
        // A second request while the first is pending is refused and must
        // not disturb the one in flight.
        assert!(taker_access.request_cancel("changed my mind").await.is_err());
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::RequestedByMe
        );

        let notif = next_notif_matching(&mut maker_notifs, |notif| {
            matches!(notif, TradeNotif::CancelRequestedByPeer { .. })
        })
        .await;
        match notif {
            TradeNotif::CancelRequestedByPeer { reason } => assert_eq!(reason, "rate moved"),
            _ => unreachable!(),
        }

        maker_access.respond_cancel(false, "keep going").await.unwrap();
        let notif = next_notif_matching(&mut taker_notifs, |notif| {
            matches!(notif, TradeNotif::CancelRejected { .. })
        })
        .await;
        match notif {
            TradeNotif::CancelRejected { reason } => assert_eq!(reason, "keep going"),
            _ => unreachable!(),
        }

        // Clean slate; the refused duplicate left nothing behind.
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::None
        );
        taker_access.confirm_fiat_sent().await.unwrap();
        wait_until_phase(&maker_access, TradePhase::FiatSent).await;

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_past_the_payout_is_refused() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "grace.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "heidi.onion", Duration::from_secs(30)).await;

        let offer = maker.new_offer("offer-c3", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        let maker_access = wait_for_trade(&maker.manager, "offer-c3").await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        taker_access.confirm_fiat_sent().await.unwrap();
        wait_until_phase(&maker_access, TradePhase::FiatSent).await;
        maker_access.confirm_payment_received().await.unwrap();
        wait_until_phase(&taker_access, TradePhase::Completed).await;

        // The payout is on chain; there is nothing left to cancel.
        assert!(taker_access.request_cancel("too late").await.is_err());
        assert_eq!(
            taker_access.query_state().await.cancel_state,
            CancelState::None
        );
        assert_eq!(
            taker_access.query_state().await.phase,
            TradePhase::Completed
        );

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }
}
