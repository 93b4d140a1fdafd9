mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connected, harness, harness_with, CHAIN};
use land_registry_dashboard::mock::{test_address, MockWallet};
use land_registry_dashboard::session::{ConnectionStatus, DEFAULT_ROLE};
use land_registry_dashboard::wallet::WalletEvent;
use land_registry_dashboard::DashboardError;

#[tokio::test]
async fn init_without_authorized_account_does_not_prompt() {
    let h = harness(test_address(1));
    let snapshot = h.session.init().await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(h.wallet.count_calls("eth_requestAccounts"), 0);
}

#[tokio::test]
async fn init_resumes_an_authorized_account() {
    let account = test_address(1);
    let h = harness_with(MockWallet::new(vec![account], CHAIN).authorized());
    let snapshot = h.session.init().await.unwrap();
    assert!(snapshot.is_connected());
    assert_eq!(snapshot.account, Some(account));
    assert_eq!(snapshot.role.as_deref(), Some(DEFAULT_ROLE));
}

#[tokio::test]
async fn role_is_read_from_the_registry() {
    let account = test_address(1);
    let h = harness(account);
    h.registry.set_role(account, "Government");
    let snapshot = h.session.connect().await.unwrap();
    assert_eq!(snapshot.role.as_deref(), Some("Government"));
}

#[tokio::test]
async fn failed_connect_returns_to_disconnected() {
    let h = harness_with(MockWallet::new(vec![test_address(1)], CHAIN).rejecting_accounts());
    let err = h.session.connect().await.err().unwrap();
    assert!(matches!(err, DashboardError::UserRejected(_)));
    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(matches!(snapshot.require(), Err(DashboardError::NotConnected)));
}

#[tokio::test]
async fn zero_accounts_notification_disconnects() {
    let h = connected(test_address(1)).await;
    h.session
        .handle_event(WalletEvent::AccountsChanged(Vec::new()))
        .await
        .unwrap();
    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(snapshot.account.is_none());
    assert!(snapshot.contract.is_none());
}

#[tokio::test]
async fn repeated_notifications_are_ignored() {
    let account = test_address(1);
    let h = connected(account).await;
    let epoch = h.session.epoch().await;

    h.session
        .handle_event(WalletEvent::AccountsChanged(vec![account]))
        .await
        .unwrap();
    h.session
        .handle_event(WalletEvent::ChainChanged(CHAIN))
        .await
        .unwrap();

    assert_eq!(h.wallet.count_calls("eth_requestAccounts"), 1);
    assert_eq!(h.session.epoch().await, epoch);
    assert!(h.session.snapshot().await.is_connected());
}

#[tokio::test]
async fn account_change_reconnects_as_the_new_account() {
    let first = test_address(1);
    let second = test_address(2);
    let h = connected(first).await;
    let epoch = h.session.epoch().await;

    h.wallet.change_accounts(vec![second, first]);
    h.session
        .handle_event(WalletEvent::AccountsChanged(vec![second, first]))
        .await
        .unwrap();

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.account, Some(second));
    assert_eq!(snapshot.contract.unwrap().signer(), second);
    assert!(snapshot.epoch > epoch);
}

#[tokio::test]
async fn network_change_rebuilds_the_contract_handle() {
    let h = connected(test_address(1)).await;
    let before = h.session.snapshot().await;

    h.wallet.change_chain(1);
    h.session
        .handle_event(WalletEvent::ChainChanged(1))
        .await
        .unwrap();

    let after = h.session.snapshot().await;
    assert!(after.is_connected());
    assert_eq!(after.chain_id, Some(CHAIN));
    assert!(after.epoch > before.epoch);
    assert!(!Arc::ptr_eq(
        before.contract.as_ref().unwrap(),
        after.contract.as_ref().unwrap()
    ));
}

#[tokio::test]
async fn concurrent_connects_prompt_once() {
    let h = harness(test_address(1));
    h.registry.set_read_delay(Duration::from_millis(30));

    let (first, second) = tokio::join!(h.session.connect(), h.session.connect());

    assert!(first.unwrap().is_connected());
    assert!(second.unwrap().is_connected());
    assert_eq!(h.wallet.count_calls("eth_requestAccounts"), 1);
}

#[tokio::test]
async fn listener_applies_wallet_events_until_shutdown() {
    let h = connected(test_address(1)).await;
    h.session.start();

    h.wallet.change_accounts(Vec::new());
    let mut disconnected = false;
    for _ in 0..50 {
        if !h.session.snapshot().await.is_connected() {
            disconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(disconnected);

    h.session.shutdown().await;
    h.wallet.change_accounts(vec![test_address(1)]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!h.session.snapshot().await.is_connected());
}

#[tokio::test]
async fn zero_accounts_during_connect_leaves_the_session_disconnected() {
    let h = harness(test_address(1));
    h.registry.set_read_delay(Duration::from_millis(40));

    let (connect, _) = tokio::join!(h.session.connect(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.session
            .handle_event(WalletEvent::AccountsChanged(Vec::new()))
            .await
            .unwrap();
    });

    assert!(matches!(connect, Err(DashboardError::SessionChanged)));
    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(snapshot.account.is_none());
    assert!(snapshot.contract.is_none());
}

#[tokio::test]
async fn disconnect_during_connect_wins() {
    let h = harness(test_address(1));
    h.registry.set_read_delay(Duration::from_millis(40));

    let (connect, _) = tokio::join!(h.session.connect(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.session.disconnect().await
    });

    assert!(matches!(connect, Err(DashboardError::SessionChanged)));
    assert!(!h.session.snapshot().await.is_connected());

    h.registry.set_read_delay(Duration::ZERO);
    assert!(h.session.connect().await.unwrap().is_connected());
}

#[tokio::test]
async fn network_change_during_connect_reconnects_on_the_new_handle() {
    let h = harness(test_address(1));
    h.registry.set_read_delay(Duration::from_millis(40));

    let (connect, event) = tokio::join!(h.session.connect(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.wallet.change_chain(1);
        h.session.handle_event(WalletEvent::ChainChanged(1)).await
    });

    assert!(matches!(connect, Err(DashboardError::SessionChanged)));
    event.unwrap();
    let snapshot = h.session.snapshot().await;
    assert!(snapshot.is_connected());
    assert_eq!(snapshot.chain_id, Some(CHAIN));
}
