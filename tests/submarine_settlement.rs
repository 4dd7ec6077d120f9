//! Submarine settlement: fee accounting on `transaction.claimed` and the
//! guard against settling while the local invoice is unpaid.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;

use lnswap::chain::{ChainBackend, Network};
use lnswap::database::Database;
use lnswap::exchange::ExchangeClient;
use lnswap::lightning::InvoiceState;
use lnswap::nursery::Nursery;
use lnswap::swap::{Currency, Status, SwapState};
use lnswap::wallet::WalletRegistry;

use support::*;

fn start_nursery(
    api: &MockApi,
    database: Arc<Database>,
    lightning: Arc<MockLightning>,
) -> Arc<Nursery> {
    let (backend, _blocks) = MockChainBackend::new(Currency::Btc, 2.0);
    let mut backends: HashMap<Currency, Arc<dyn ChainBackend>> = HashMap::new();
    backends.insert(Currency::Btc, backend);

    Nursery::start(
        Network::regtest(elements::BlockHash::all_zeros()),
        Arc::new(ExchangeClient::new(api.url())),
        lightning,
        Arc::new(WalletRegistry::new()),
        backends,
        database,
    )
    .unwrap()
}

#[test]
fn claimed_swap_settles_with_deterministic_fees() {
    let api = MockApi::start();
    let (mut swap, _lockup_tx, _lockup_hex) = submarine_fixture("sub1", 1_000, 100_500);
    let (node_secret, _) = keypair(0x5a);
    // The exchange pays a 100 000 sat invoice; 200 sat were quoted as miner
    // fee at creation, leaving 300 sat of service fee.
    swap.invoice = Some(build_invoice(&node_secret, swap.preimage_hash, 100_000));

    api.route_json(
        "GET",
        "/v2/swap/sub1",
        r#"{"status":"transaction.claimed"}"#,
    );

    let database = Arc::new(Database::open_in_memory().unwrap());
    database.insert_swap(&swap).unwrap();

    let lightning = MockLightning::new();
    lightning.set_invoice_state(swap.preimage_hash, InvoiceState::Settled);

    let nursery = start_nursery(&api, database.clone(), lightning);

    let settled = wait_for(Duration::from_secs(10), || {
        database
            .query_swap("sub1")
            .unwrap()
            .filter(|swap| swap.state == SwapState::Successful)
    });
    assert_eq!(settled.status, Status::TransactionClaimed);
    assert_eq!(settled.onchain_fee, Some(200));
    assert_eq!(settled.service_fee, Some(300));

    nursery.stop();
}

#[test]
fn claimed_swap_does_not_settle_while_invoice_is_open() {
    let api = MockApi::start();
    let (mut swap, _lockup_tx, _lockup_hex) = submarine_fixture("sub2", 1_000, 100_500);
    let (node_secret, _) = keypair(0x5a);
    swap.invoice = Some(build_invoice(&node_secret, swap.preimage_hash, 100_000));

    api.route_json(
        "GET",
        "/v2/swap/sub2",
        r#"{"status":"transaction.claimed"}"#,
    );

    let database = Arc::new(Database::open_in_memory().unwrap());
    database.insert_swap(&swap).unwrap();

    let lightning = MockLightning::new();
    lightning.set_invoice_state(swap.preimage_hash, InvoiceState::Open);

    let nursery = start_nursery(&api, database.clone(), lightning);
    std::thread::sleep(Duration::from_millis(700));

    // The exchange's word alone is not enough: no state change, and the
    // claimed status was not recorded either.
    let unsettled = database.query_swap("sub2").unwrap().unwrap();
    assert_eq!(unsettled.state, SwapState::Pending);
    assert_eq!(unsettled.status, Status::SwapCreated);
    assert!(unsettled.service_fee.is_none());

    nursery.stop();
}
