mod common;

#[cfg(test)]
mod trade_flow_tests {
    use std::time::Duration;

    use tradewind::common::types::TradeRole;
    use tradewind::trade::{CancelState, OfferDirection, TradePhase};

    use super::common::harness::{wait_for_trade, wait_until_phase, MemoryHub, TestPeer};
    use super::common::logger;

    #[tokio::test]
    async fn sell_offer_runs_to_completion() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "maker.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "taker.onion", Duration::from_secs(30)).await;

        // Maker sells BTC, so the taker is the fiat-sending buyer.
        let offer = maker.new_offer("offer-1", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();

        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-1").await;

        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        // The taker already saw every deposit-negotiation message once;
        // replaying the maker's full inbound history must all dedup away.
        hub.replay_direct(&maker.address).await;

        taker_access.confirm_fiat_sent().await.unwrap();
        wait_until_phase(&maker_access, TradePhase::FiatSent).await;

        maker_access.confirm_payment_received().await.unwrap();
        wait_until_phase(&maker_access, TradePhase::Completed).await;
        wait_until_phase(&taker_access, TradePhase::Completed).await;

        let taker_state = taker_access.query_state().await;
        let maker_state = maker_access.query_state().await;
        assert_eq!(taker_state.role, TradeRole::BuyerAsTaker);
        assert_eq!(maker_state.role, TradeRole::SellerAsMaker);
        assert_eq!(taker_state.cancel_state, CancelState::None);
        assert!(taker_state.deposit_tx_id.is_some());
        assert_eq!(taker_state.deposit_tx_id, maker_state.deposit_tx_id);
        assert!(taker_state.payout_tx_id.is_some());
        assert_eq!(taker_state.payout_tx_id, maker_state.payout_tx_id);
        assert_eq!(maker_state.peer_address, Some(taker.address.clone()));
        assert_eq!(taker_state.peer_address, Some(maker.address.clone()));

        maker.manager.close_trade("offer-1").await.unwrap();
        taker.manager.close_trade("offer-1").await.unwrap();
        assert!(maker.manager.trade_access("offer-1").await.is_none());

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn buy_offer_runs_to_completion() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "alice.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "bob.onion", Duration::from_secs(30)).await;

        // Maker buys BTC, so the maker is the fiat-sending buyer.
        let offer = maker.new_offer("offer-2", OfferDirection::Buy);
        maker.manager.make_offer(offer.clone()).await.unwrap();

        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        let maker_access = wait_for_trade(&maker.manager, "offer-2").await;

        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;
        wait_until_phase(&maker_access, TradePhase::DepositPublished).await;

        maker_access.confirm_fiat_sent().await.unwrap();
        wait_until_phase(&taker_access, TradePhase::FiatSent).await;

        taker_access.confirm_payment_received().await.unwrap();
        wait_until_phase(&taker_access, TradePhase::Completed).await;
        wait_until_phase(&maker_access, TradePhase::Completed).await;

        let taker_state = taker_access.query_state().await;
        let maker_state = maker_access.query_state().await;
        assert_eq!(taker_state.role, TradeRole::SellerAsTaker);
        assert_eq!(maker_state.role, TradeRole::BuyerAsMaker);
        assert_eq!(taker_state.payout_tx_id, maker_state.payout_tx_id);

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn user_events_outside_their_phase_are_rejected() {
        logger::setup();
        let hub = MemoryHub::new();
        let maker = TestPeer::start(&hub, "carol.onion", Duration::from_secs(30)).await;
        let taker = TestPeer::start(&hub, "dave.onion", Duration::from_secs(30)).await;

        let offer = maker.new_offer("offer-3", OfferDirection::Sell);
        maker.manager.make_offer(offer.clone()).await.unwrap();
        let taker_access = taker.manager.take_offer(offer).await.unwrap();
        wait_until_phase(&taker_access, TradePhase::DepositPublished).await;

        // Buyer-side event on the seller, and a seller event too early.
        let maker_access = wait_for_trade(&maker.manager, "offer-3").await;
        assert!(maker_access.confirm_fiat_sent().await.is_err());
        assert!(maker_access.confirm_payment_received().await.is_err());
        assert_eq!(
            maker_access.query_state().await.phase,
            TradePhase::DepositPublished
        );

        maker.manager.shutdown().await.unwrap();
        taker.manager.shutdown().await.unwrap();
    }
}
