//! The automated rebalancer.
//!
//! Watches Lightning channel balances and proposes swaps that bring them
//! back toward half capacity, under a rolling fee budget. Recommendations
//! are always computed so embedders can display them; execution additionally
//! requires the master switch and a clean error state.

pub mod budget;
pub mod config;

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, Mutex, RwLock,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;

use crate::database::{AutoSwapEntry, Database};
use crate::error::Error;
use crate::lightning::{ChannelInfo, LightningNode};
use crate::manager::{ReverseRequest, SubmarineRequest, SwapManager};
use crate::nursery::sleep_with_shutdown;
use crate::swap::{Currency, Pair};
use crate::wallet::WalletRegistry;
use budget::Budget;
use config::{AutoSwapConfig, SwapTypeFilter};

/// Direction of a recommended swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationType {
    /// Submarine swap, moving on-chain funds into the channel.
    Normal,
    /// Reverse swap, draining the channel to on-chain.
    Reverse,
}

impl RecommendationType {
    /// Stable string form used in persistence and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationType::Normal => "normal",
            RecommendationType::Reverse => "reverse",
        }
    }
}

impl fmt::Display for RecommendationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a recommendation was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissalReason {
    /// Fee budget for the current window is exhausted.
    Budget,
    /// Amount is below the pair's minimum.
    AmountBelowMin,
    /// Amount is above the pair's maximum.
    AmountAboveMax,
    /// Estimated fee exceeds the configured percentage of the amount.
    FeeExceedsLimit,
    /// The autoswapper or this swap direction is disabled.
    Disabled,
}

impl DismissalReason {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DismissalReason::Budget => "budget",
            DismissalReason::AmountBelowMin => "amount-below-min",
            DismissalReason::AmountAboveMax => "amount-above-max",
            DismissalReason::FeeExceedsLimit => "fee-exceeds-limit",
            DismissalReason::Disabled => "disabled",
        }
    }
}

impl fmt::Display for DismissalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed swap.
#[derive(Debug, Clone)]
pub struct Recommendation {
    /// Direction.
    pub swap_type: RecommendationType,
    /// Amount in sat.
    pub amount: u64,
    /// Channel the proposal targets; `None` in aggregate mode.
    pub channel: Option<ChannelInfo>,
    /// Estimated total fee in sat (service plus miners).
    pub fee_estimate: u64,
    /// Everything standing in the way of execution; empty means actionable.
    pub dismissed_reasons: Vec<DismissalReason>,
}

impl Recommendation {
    /// Whether the proposal was dismissed.
    pub fn dismissed(&self) -> bool {
        !self.dismissed_reasons.is_empty()
    }
}

/// Externally visible state of the autoswapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSwapStatus {
    /// Master switch is off; recommendations only.
    Disabled,
    /// Evaluating and executing.
    Running,
    /// A persistent error stopped execution; evaluation continues.
    Error(String),
}

/// The rebalancer.
pub struct AutoSwapper {
    config: RwLock<AutoSwapConfig>,
    lightning: Arc<dyn LightningNode>,
    database: Arc<Database>,
    manager: Arc<SwapManager>,
    wallets: Arc<WalletRegistry>,
    error: Mutex<Option<String>>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSwapper {
    /// Wire up the rebalancer; call [`AutoSwapper::start`] to begin
    /// evaluating.
    pub fn new(
        config: AutoSwapConfig,
        lightning: Arc<dyn LightningNode>,
        database: Arc<Database>,
        manager: Arc<SwapManager>,
        wallets: Arc<WalletRegistry>,
    ) -> Arc<Self> {
        Arc::new(AutoSwapper {
            config: RwLock::new(config),
            lightning,
            database,
            manager,
            wallets,
            error: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the evaluation loop.
    pub fn start(self: &Arc<Self>) {
        *self.error.lock().expect("error state poisoned") = None;

        let swapper = self.clone();
        let handle = thread::Builder::new()
            .name("autoswap loop".to_string())
            .spawn(move || {
                log::info!("autoswap loop started");
                while !swapper.shutdown.load(Relaxed) {
                    swapper.tick();
                    let poll = Duration::from_secs(
                        swapper.config().channel_poll_interval_secs,
                    );
                    sleep_with_shutdown(&swapper.shutdown, poll);
                }
                log::info!("autoswap loop shut down");
            })
            .expect("failed to spawn autoswap loop");
        *self.handle.lock().expect("handle poisoned") = Some(handle);
    }

    /// Stop the evaluation loop and join it.
    pub fn stop(&self) {
        self.shutdown.store(true, Relaxed);
        if let Some(handle) = self.handle.lock().expect("handle poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> AutoSwapConfig {
        self.config.read().expect("config poisoned").clone()
    }

    /// Update one configuration value; clears a latched error.
    pub fn set_config_value(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut config = self.config.write().expect("config poisoned");
        config.set_value(key, value)?;
        *self.error.lock().expect("error state poisoned") = None;
        Ok(())
    }

    /// Replace the whole configuration; clears a latched error.
    pub fn set_config(&self, new_config: AutoSwapConfig) -> Result<(), Error> {
        new_config.validate().map_err(Error::InvalidInput)?;
        *self.config.write().expect("config poisoned") = new_config;
        *self.error.lock().expect("error state poisoned") = None;
        Ok(())
    }

    /// Current status.
    pub fn status(&self) -> AutoSwapStatus {
        if let Some(error) = self.error.lock().expect("error state poisoned").clone() {
            return AutoSwapStatus::Error(error);
        }
        if self.config().enabled {
            AutoSwapStatus::Running
        } else {
            AutoSwapStatus::Disabled
        }
    }

    /// The fee budget of the current window.
    pub fn current_budget(&self) -> Result<Budget, Error> {
        let config = self.config();
        Ok(Budget::current(
            &self.database,
            config.budget,
            config.budget_interval_secs,
            Utc::now(),
        )?)
    }

    /// Evaluate all channels and produce recommendations with their
    /// dismissal reasons.
    pub fn recommendations(&self) -> Result<Vec<Recommendation>, Error> {
        let config = self.config();
        let channels = self.lightning.list_channels()?;
        let budget = self.current_budget()?;

        let targets: Vec<(Option<ChannelInfo>, u64, u64)> = if config.per_channel {
            channels
                .iter()
                .map(|channel| {
                    (
                        Some(channel.clone()),
                        channel.local_sat,
                        channel.capacity_sat,
                    )
                })
                .collect()
        } else {
            let local: u64 = channels.iter().map(|c| c.local_sat).sum();
            let capacity: u64 = channels.iter().map(|c| c.capacity_sat).sum();
            vec![(None, local, capacity)]
        };

        let mut recommendations = Vec::new();
        for (channel, local, capacity) in targets {
            if capacity == 0 {
                continue;
            }
            let (min, max) = config.thresholds(capacity);
            let half = capacity / 2;

            // Strict inequalities: a balance sitting exactly on a threshold
            // is left alone.
            let proposal = if min > 0 && local < min {
                Some((RecommendationType::Normal, half.saturating_sub(local)))
            } else if max > 0 && local > max {
                Some((RecommendationType::Reverse, local.saturating_sub(half)))
            } else {
                None
            };

            let Some((swap_type, amount)) = proposal else {
                continue;
            };
            if amount == 0 {
                continue;
            }

            recommendations.push(self.evaluate_proposal(
                &config,
                &budget,
                swap_type,
                amount,
                channel,
            )?);
        }
        Ok(recommendations)
    }

    /// Price a proposal and collect its dismissal reasons.
    fn evaluate_proposal(
        &self,
        config: &AutoSwapConfig,
        budget: &Budget,
        swap_type: RecommendationType,
        amount: u64,
        channel: Option<ChannelInfo>,
    ) -> Result<Recommendation, Error> {
        let mut dismissed = Vec::new();

        let (limits, fee_estimate) = match swap_type {
            RecommendationType::Normal => {
                let pair = self.manager.submarine_pair(self.normal_pair(config))?;
                let service = (amount as f64 * pair.fees.percentage / 100.0) as u64;
                (pair.limits, service + pair.fees.miner_fees)
            }
            RecommendationType::Reverse => {
                let pair = self.manager.reverse_pair(self.reverse_pair(config))?;
                let service = (amount as f64 * pair.fees.percentage / 100.0) as u64;
                (
                    pair.limits,
                    service + pair.fees.miner_fees.claim + pair.fees.miner_fees.lockup,
                )
            }
        };

        let direction_disabled = matches!(
            (config.swap_type, swap_type),
            (Some(SwapTypeFilter::Normal), RecommendationType::Reverse)
                | (Some(SwapTypeFilter::Reverse), RecommendationType::Normal)
        );
        if !config.enabled || direction_disabled {
            dismissed.push(DismissalReason::Disabled);
        }
        if amount < limits.minimal {
            dismissed.push(DismissalReason::AmountBelowMin);
        }
        if amount > limits.maximal {
            dismissed.push(DismissalReason::AmountAboveMax);
        }
        if fee_estimate as f64 > amount as f64 * config.max_fee_percent / 100.0 {
            dismissed.push(DismissalReason::FeeExceedsLimit);
        }
        if budget.remaining < fee_estimate {
            dismissed.push(DismissalReason::Budget);
        }

        Ok(Recommendation {
            swap_type,
            amount,
            channel,
            fee_estimate,
            dismissed_reasons: dismissed,
        })
    }

    fn normal_pair(&self, config: &AutoSwapConfig) -> Pair {
        Pair {
            from: config.currency,
            to: Currency::Btc,
        }
    }

    fn reverse_pair(&self, config: &AutoSwapConfig) -> Pair {
        Pair {
            from: Currency::Btc,
            to: config.currency,
        }
    }

    /// One evaluation round: recommendations, then execution when allowed.
    fn tick(self: &Arc<Self>) {
        let recommendations = match self.recommendations() {
            Ok(recommendations) => recommendations,
            Err(e) => {
                if !e.is_transient() {
                    log::error!("autoswap evaluation failed, stopping execution: {}", e);
                    *self.error.lock().expect("error state poisoned") = Some(e.to_string());
                } else {
                    log::warn!("autoswap evaluation failed transiently: {}", e);
                }
                return;
            }
        };

        let config = self.config();
        if !config.enabled {
            return;
        }
        if self.error.lock().expect("error state poisoned").is_some() {
            log::debug!("autoswap in error state, not executing");
            return;
        }

        for recommendation in recommendations {
            if recommendation.dismissed() {
                log::debug!(
                    "dismissed {} swap over {} sat: {:?}",
                    recommendation.swap_type,
                    recommendation.amount,
                    recommendation.dismissed_reasons
                );
                continue;
            }
            match self.channel_has_pending_swap(&recommendation) {
                Ok(true) => {
                    log::debug!(
                        "channel {:?} already has a swap in flight",
                        recommendation.channel.as_ref().map(|c| c.id)
                    );
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!("could not check in-flight swaps: {}", e);
                    continue;
                }
            }
            if let Err(e) = self.execute(&config, &recommendation) {
                log::error!(
                    "executing {} swap over {} sat failed: {}",
                    recommendation.swap_type,
                    recommendation.amount,
                    e
                );
                if !e.is_transient() {
                    *self.error.lock().expect("error state poisoned") = Some(e.to_string());
                    return;
                }
            }
        }
    }

    /// At most one autoswap per channel in flight; in aggregate mode at most
    /// one overall. In flight means the linked swap row is still pending, no
    /// matter how long ago the swap was executed.
    fn channel_has_pending_swap(
        &self,
        recommendation: &Recommendation,
    ) -> Result<bool, Error> {
        for entry in self.database.query_pending_auto_swaps()? {
            let same_scope = match (&recommendation.channel, entry.channel_id) {
                (Some(channel), Some(entry_channel)) => channel.id == entry_channel,
                (None, _) => true,
                (Some(_), None) => false,
            };
            if same_scope {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create (and for submarine swaps, fund) one recommended swap.
    fn execute(
        self: &Arc<Self>,
        config: &AutoSwapConfig,
        recommendation: &Recommendation,
    ) -> Result<(), Error> {
        let wallet_name = if config.wallet.is_empty() {
            None
        } else {
            Some(config.wallet.clone())
        };
        let chan_ids: Vec<u64> = recommendation
            .channel
            .as_ref()
            .map(|channel| vec![channel.id])
            .unwrap_or_default();

        log::info!(
            "executing {} swap over {} sat (estimated fee {} sat)",
            recommendation.swap_type,
            recommendation.amount,
            recommendation.fee_estimate
        );

        let swap_id = match recommendation.swap_type {
            RecommendationType::Normal => {
                let wallet = wallet_name
                    .as_ref()
                    .and_then(|name| self.wallets.get(name))
                    .or_else(|| self.wallets.get_for_currency(config.currency))
                    .ok_or_else(|| {
                        Error::FailedPrecondition(format!(
                            "no wallet available to fund {} swaps",
                            config.currency
                        ))
                    })?;
                if wallet.is_readonly() {
                    return Err(Error::FailedPrecondition(format!(
                        "wallet {} cannot sign submarine swap funding",
                        wallet.name()
                    )));
                }

                let invoice = self.lightning.create_invoice(
                    recommendation.amount,
                    "channel rebalancing",
                    86_400,
                )?;
                let swap = self.manager.create_swap(SubmarineRequest {
                    pair: self.normal_pair(config),
                    invoice: Some(invoice.bolt11),
                    refund_address: None,
                    wallet: wallet_name.clone(),
                    is_auto: true,
                })?;

                let fee_rate = self.manager.fee_rate(config.currency)?;
                let funding_txid =
                    wallet.send_to_address(&swap.address, swap.expected_amount, fee_rate)?;
                log::info!(
                    "funded autoswap {} with {} sat: {}",
                    swap.id,
                    swap.expected_amount,
                    funding_txid
                );
                swap.id
            }
            RecommendationType::Reverse => {
                let swap = self.manager.create_reverse_swap(ReverseRequest {
                    pair: self.reverse_pair(config),
                    amount_sat: recommendation.amount,
                    claim_address: None,
                    accept_zero_conf: config.accept_zero_conf,
                    external_pay: false,
                    chan_ids,
                    wallet: wallet_name.clone(),
                    is_auto: true,
                })?;
                swap.id
            }
        };

        self.database.insert_auto_swap(&AutoSwapEntry {
            swap_id,
            swap_type: recommendation.swap_type.as_str().to_string(),
            channel_id: recommendation.channel.as_ref().map(|channel| channel.id),
            amount: recommendation.amount,
            fee_estimate: recommendation.fee_estimate,
            created_at: Utc::now(),
        })?;
        Ok(())
    }
}
