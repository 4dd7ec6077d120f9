//! Block-driven refund of a timed-out submarine swap, exercised through the
//! running nursery with a mocked exchange and chain backend.

mod support;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bitcoin::hashes::Hash;

use lnswap::chain::{ChainBackend, Network};
use lnswap::database::Database;
use lnswap::exchange::ExchangeClient;
use lnswap::nursery::Nursery;
use lnswap::swap::{Currency, Status, SwapState};
use lnswap::wallet::WalletRegistry;

use support::*;

#[test]
fn submarine_timeout_refund_via_block_stream() {
    let api = MockApi::start();
    let (swap, lockup_tx, lockup_hex) = submarine_fixture("sub1", 1_000, 100_000);
    let lockup_txid = lockup_tx.compute_txid().to_string();

    api.route_json(
        "GET",
        "/v2/swap/sub1",
        r#"{"status":"swap.created"}"#,
    );
    api.route_json(
        "GET",
        &format!("/v2/chain/BTC/transaction/{lockup_txid}"),
        &format!(r#"{{"hex":"{lockup_hex}"}}"#),
    );

    let broadcasts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = broadcasts.clone();
    api.route("POST", "/v2/chain/BTC/transaction", move |body| {
        let request: serde_json::Value = serde_json::from_str(body).unwrap();
        let hex = request["hex"].as_str().unwrap().to_string();
        let txid = txid_of(&hex);
        recorded.lock().unwrap().push(hex);
        (200, format!(r#"{{"id":"{txid}"}}"#))
    });

    let database = Arc::new(Database::open_in_memory().unwrap());
    database.insert_swap(&swap).unwrap();

    let (backend, blocks) = MockChainBackend::new(Currency::Btc, 2.0);
    let mut backends: HashMap<Currency, Arc<dyn ChainBackend>> = HashMap::new();
    backends.insert(Currency::Btc, backend);

    let wallets = Arc::new(WalletRegistry::new());
    wallets.register(MockWallet::new("main", Currency::Btc));

    let nursery = Nursery::start(
        Network::regtest(elements::BlockHash::all_zeros()),
        Arc::new(ExchangeClient::new(api.url())),
        MockLightning::new(),
        wallets,
        backends,
        database.clone(),
    )
    .unwrap();
    let stream = nursery.global_swap_updates();

    // One block below the timeout: the refund must not fire.
    blocks.send(999).unwrap();
    thread::sleep(Duration::from_millis(700));
    let pending = database.query_swap("sub1").unwrap().unwrap();
    assert!(pending.refund_transaction_id.is_none());
    assert_eq!(pending.state, SwapState::Pending);

    // Exactly at the timeout height the refund is attempted, not one block
    // later.
    blocks.send(1_000).unwrap();
    let refunded = wait_for(Duration::from_secs(20), || {
        database
            .query_swap("sub1")
            .unwrap()
            .filter(|swap| swap.state == SwapState::Refunded)
    });

    assert_eq!(refunded.status, Status::TransactionRefunded);
    let refund_txid = refunded.refund_transaction_id.clone().expect("refund txid");
    let refund_address = refunded.refund_address.clone().expect("refund address");

    // The broadcast went through the exchange first.
    let raw = broadcasts
        .lock()
        .unwrap()
        .first()
        .cloned()
        .expect("refund was broadcast");
    let tx: bitcoin::Transaction =
        bitcoin::consensus::encode::deserialize(&lnswap::utill::from_hex(&raw).unwrap()).unwrap();

    assert_eq!(tx.compute_txid().to_string(), refund_txid);
    assert_eq!(tx.lock_time.to_consensus_u32(), 1_000);
    assert_eq!(tx.input.len(), 1);
    assert_eq!(
        tx.input[0].previous_output.txid,
        lockup_tx.compute_txid()
    );
    assert_eq!(tx.input[0].previous_output.vout, 0);
    assert_eq!(tx.output.len(), 1);
    let expected_spk = bitcoin::Address::from_str(&refund_address)
        .unwrap()
        .assume_checked()
        .script_pubkey();
    assert_eq!(tx.output[0].script_pubkey, expected_spk);

    // A subscriber observes the terminal update.
    let saw_terminal = wait_for(Duration::from_secs(5), || {
        match stream.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(update)) if update.is_terminal() => Some(true),
            _ => None,
        }
    });
    assert!(saw_terminal);

    // Later blocks do not produce a second refund.
    blocks.send(1_001).unwrap();
    thread::sleep(Duration::from_millis(700));
    assert_eq!(broadcasts.lock().unwrap().len(), 1);

    nursery.stop();
}
