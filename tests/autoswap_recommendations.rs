//! Autoswapper evaluation: thresholds, dismissal reasons and budget
//! accounting against mocked channels and pair quotes.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::hashes::Hash;
use chrono::Utc;

use lnswap::autoswap::config::AutoSwapConfig;
use lnswap::autoswap::{AutoSwapStatus, AutoSwapper, DismissalReason, RecommendationType};
use lnswap::chain::{ChainBackend, Network};
use lnswap::database::{AutoSwapEntry, Database};
use lnswap::exchange::ExchangeClient;
use lnswap::manager::SwapManager;
use lnswap::nursery::Nursery;
use lnswap::swap::Currency;
use lnswap::wallet::WalletRegistry;

use support::*;

const SUBMARINE_PAIRS: &str = r#"{
    "BTC": {"BTC": {
        "hash": "abcd", "rate": 1.0,
        "limits": {"minimal": 10000, "maximal": 10000000},
        "fees": {"percentage": 0.1, "minerFees": 300}
    }}
}"#;

const REVERSE_PAIRS: &str = r#"{
    "BTC": {"BTC": {
        "hash": "dcba", "rate": 1.0,
        "limits": {"minimal": 10000, "maximal": 10000000},
        "fees": {"percentage": 0.25, "minerFees": {"claim": 120, "lockup": 280}}
    }}
}"#;

struct Setup {
    swapper: Arc<AutoSwapper>,
    database: Arc<Database>,
    lightning: Arc<MockLightning>,
    nursery: Arc<Nursery>,
    _api: Arc<MockApi>,
}

fn setup(config: AutoSwapConfig) -> Setup {
    let api = MockApi::start();
    api.route_json("GET", "/v2/swap/submarine", SUBMARINE_PAIRS);
    api.route_json("GET", "/v2/swap/reverse", REVERSE_PAIRS);

    let database = Arc::new(Database::open_in_memory().unwrap());
    let (backend, _blocks) = MockChainBackend::new(Currency::Btc, 2.0);
    let mut backends: HashMap<Currency, Arc<dyn ChainBackend>> = HashMap::new();
    backends.insert(Currency::Btc, backend);

    let exchange = Arc::new(ExchangeClient::new(api.url()));
    let lightning = MockLightning::new();
    let wallets = Arc::new(WalletRegistry::new());
    wallets.register(MockWallet::new("main", Currency::Btc));
    let network = Network::regtest(elements::BlockHash::all_zeros());

    let nursery = Nursery::start(
        network,
        exchange.clone(),
        lightning.clone(),
        wallets.clone(),
        backends,
        database.clone(),
    )
    .unwrap();
    let manager = Arc::new(SwapManager::new(
        network,
        exchange,
        nursery.clone(),
        database.clone(),
        wallets.clone(),
        lightning.clone(),
    ));

    let swapper = AutoSwapper::new(config, lightning.clone(), database.clone(), manager, wallets);
    Setup {
        swapper,
        database,
        lightning,
        nursery,
        _api: api,
    }
}

fn band_config() -> AutoSwapConfig {
    let mut config = AutoSwapConfig::default();
    config.set_value("currency", "BTC").unwrap();
    config.set_value("min_balance_percent", "25").unwrap();
    config.set_value("max_balance_percent", "75").unwrap();
    config.set_value("budget", "2000").unwrap();
    config.set_value("max_fee_percent", "5").unwrap();
    config
}

#[test]
fn recommendations_target_half_capacity_with_strict_thresholds() {
    let env = setup(band_config());
    // Depleted, exactly-on-threshold, and overfull channels.
    env.lightning.add_channel(1, 1_000_000, 100_000);
    env.lightning.add_channel(2, 1_000_000, 250_000);
    env.lightning.add_channel(3, 1_000_000, 900_000);

    let recommendations = env.swapper.recommendations().unwrap();
    assert_eq!(recommendations.len(), 2);

    let normal = recommendations
        .iter()
        .find(|r| r.swap_type == RecommendationType::Normal)
        .expect("normal recommendation");
    assert_eq!(normal.amount, 400_000);
    assert_eq!(normal.channel.as_ref().unwrap().id, 1);
    // 0.1% service + 300 sat miner quote.
    assert_eq!(normal.fee_estimate, 700);
    // Disabled master switch is the only obstacle.
    assert_eq!(normal.dismissed_reasons, vec![DismissalReason::Disabled]);

    let reverse = recommendations
        .iter()
        .find(|r| r.swap_type == RecommendationType::Reverse)
        .expect("reverse recommendation");
    assert_eq!(reverse.amount, 400_000);
    assert_eq!(reverse.channel.as_ref().unwrap().id, 3);
    // 0.25% service + claim and lockup miner quotes.
    assert_eq!(reverse.fee_estimate, 1_400);
    assert_eq!(reverse.dismissed_reasons, vec![DismissalReason::Disabled]);

    env.nursery.stop();
}

#[test]
fn zero_budget_dismisses_everything() {
    let mut config = band_config();
    config.set_value("budget", "0").unwrap();
    let env = setup(config);
    env.lightning.add_channel(1, 1_000_000, 100_000);
    env.lightning.add_channel(2, 1_000_000, 900_000);

    let recommendations = env.swapper.recommendations().unwrap();
    assert_eq!(recommendations.len(), 2);
    for recommendation in &recommendations {
        assert!(
            recommendation
                .dismissed_reasons
                .contains(&DismissalReason::Budget),
            "missing budget dismissal: {recommendation:?}"
        );
    }

    env.nursery.stop();
}

#[test]
fn budget_window_spending_dismisses_second_proposal() {
    let env = setup(band_config());
    env.lightning.add_channel(1, 1_000_000, 900_000);

    // 1 400 sat of the 2 000 sat budget are already spent in this window;
    // the next reverse proposal (another 1 400 sat) no longer fits.
    env.database
        .insert_auto_swap(&AutoSwapEntry {
            swap_id: "earlier".to_string(),
            swap_type: "reverse".to_string(),
            channel_id: Some(9),
            amount: 400_000,
            fee_estimate: 1_400,
            created_at: Utc::now(),
        })
        .unwrap();

    let recommendations = env.swapper.recommendations().unwrap();
    assert_eq!(recommendations.len(), 1);
    assert!(recommendations[0]
        .dismissed_reasons
        .contains(&DismissalReason::Budget));

    let budget = env.swapper.current_budget().unwrap();
    assert_eq!(budget.total, 2_000);
    assert_eq!(budget.remaining, 600);

    env.nursery.stop();
}

#[test]
fn fee_limit_and_direction_filter_dismiss() {
    let mut config = band_config();
    config.set_value("max_fee_percent", "0.01").unwrap();
    config.set_value("swap_type", "normal").unwrap();
    let env = setup(config);
    env.lightning.add_channel(1, 1_000_000, 900_000);

    let recommendations = env.swapper.recommendations().unwrap();
    assert_eq!(recommendations.len(), 1);
    let reverse = &recommendations[0];
    assert_eq!(reverse.swap_type, RecommendationType::Reverse);
    assert!(reverse
        .dismissed_reasons
        .contains(&DismissalReason::FeeExceedsLimit));
    // Reverse swaps are switched off by the direction filter.
    assert!(reverse
        .dismissed_reasons
        .contains(&DismissalReason::Disabled));

    env.nursery.stop();
}

#[test]
fn status_reflects_master_switch() {
    let env = setup(band_config());
    assert_eq!(env.swapper.status(), AutoSwapStatus::Disabled);
    env.swapper.set_config_value("enabled", "true").unwrap();
    assert_eq!(env.swapper.status(), AutoSwapStatus::Running);
    env.nursery.stop();
}
