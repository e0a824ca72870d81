//! In-memory lending venue for dry runs.
//!
//! Keeps wallet, supply and debt balances per asset and enforces the LTV limit on
//! borrows. Prices come from a static table seeded from config.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

use crate::config::LendingConfig;
use crate::domain::{
    is_stablecoin, usd_price, ReserveData, TxReceipt, UserAccountData, UserReservePosition,
};
use crate::error::{CarryError, Result};
use crate::exchange::LendingProtocol;

/// Called for every outgoing transfer with (asset, recipient, amount)
pub type TransferHook = Arc<dyn Fn(&str, &str, Decimal) + Send + Sync>;

#[derive(Debug, Default)]
struct PaperBook {
    wallet: HashMap<String, Decimal>,
    supplied: HashMap<String, Decimal>,
    borrowed: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
    reserves: HashMap<String, ReserveData>,
}

impl PaperBook {
    fn price(&self, asset: &str) -> Result<Decimal> {
        if let Some(price) = self.prices.get(asset) {
            return Ok(*price);
        }
        if is_stablecoin(asset) {
            return Ok(Decimal::ONE);
        }
        Err(CarryError::MarketDataUnavailable(format!(
            "no paper price for {}",
            asset
        )))
    }

    fn reserve(&self, asset: &str) -> Result<&ReserveData> {
        self.reserves
            .get(asset)
            .ok_or_else(|| CarryError::Validation(format!("unknown reserve {}", asset)))
    }

    fn usd(&self, balances: &HashMap<String, Decimal>) -> Result<Decimal> {
        let mut total = Decimal::ZERO;
        for (asset, amount) in balances {
            total += *amount * self.price(asset)?;
        }
        Ok(total)
    }

    fn collateral_usd(&self, weight: impl Fn(&ReserveData) -> f64) -> Result<f64> {
        let mut total = 0.0;
        for (asset, amount) in &self.supplied {
            let reserve = self.reserve(asset)?;
            if !reserve.collateral_enabled {
                continue;
            }
            let usd = (*amount * self.price(asset)?).to_f64().unwrap_or(0.0);
            total += usd * weight(reserve);
        }
        Ok(total)
    }

    fn debit(&mut self, asset: &str, amount: Decimal) -> Result<()> {
        let balance = self.wallet.entry(asset.to_string()).or_default();
        if *balance < amount {
            return Err(CarryError::Transaction(format!(
                "insufficient {} balance: have {}, need {}",
                asset, balance, amount
            )));
        }
        *balance -= amount;
        Ok(())
    }

    fn credit(&mut self, asset: &str, amount: Decimal) {
        *self.wallet.entry(asset.to_string()).or_default() += amount;
    }
}

pub struct PaperLending {
    book: Mutex<PaperBook>,
    on_transfer: Option<TransferHook>,
}

fn receipt() -> TxReceipt {
    TxReceipt::confirmed(format!("0xpaper{}", Uuid::new_v4().simple()))
}

impl PaperLending {
    pub fn from_config(config: &LendingConfig) -> Self {
        let mut book = PaperBook::default();
        book.wallet
            .insert(config.quote_asset.clone(), config.paper_quote_balance);
        book.prices
            .insert(config.base_asset.clone(), config.paper_base_price);

        book.reserves.insert(
            config.base_asset.clone(),
            ReserveData {
                symbol: config.base_asset.clone(),
                ltv: config.paper_base_ltv,
                liquidation_threshold: config.paper_base_ltv + 0.025,
                liquidation_bonus: 0.05,
                liquidity_rate: config.paper_supply_rate,
                variable_borrow_rate: config.paper_supply_rate * 1.5,
                collateral_enabled: true,
                borrowing_enabled: true,
            },
        );
        book.reserves.insert(
            config.quote_asset.clone(),
            ReserveData {
                symbol: config.quote_asset.clone(),
                ltv: 0.75,
                liquidation_threshold: 0.78,
                liquidation_bonus: 0.05,
                liquidity_rate: config.paper_borrow_rate * 0.8,
                variable_borrow_rate: config.paper_borrow_rate,
                collateral_enabled: true,
                borrowing_enabled: true,
            },
        );

        info!(
            quote = %config.quote_asset,
            balance = %config.paper_quote_balance,
            "Paper lending venue seeded"
        );

        Self {
            book: Mutex::new(book),
            on_transfer: None,
        }
    }

    /// Observe outgoing transfers, e.g. to credit a simulated bridge deposit.
    pub fn with_transfer_hook(mut self, hook: TransferHook) -> Self {
        self.on_transfer = Some(hook);
        self
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_price(&self, asset: &str, price: Decimal) {
        self.book().prices.insert(asset.to_string(), price);
    }

    pub fn set_borrowing_enabled(&self, asset: &str, enabled: bool) {
        if let Some(reserve) = self.book().reserves.get_mut(asset) {
            reserve.borrowing_enabled = enabled;
        }
    }

    pub fn supplied(&self, asset: &str) -> Decimal {
        self.book().supplied.get(asset).copied().unwrap_or_default()
    }

    pub fn borrowed(&self, asset: &str) -> Decimal {
        self.book().borrowed.get(asset).copied().unwrap_or_default()
    }
}

#[async_trait]
impl LendingProtocol for PaperLending {
    fn name(&self) -> &str {
        "paper"
    }

    async fn wallet_balance(&self, asset: &str) -> Result<Decimal> {
        Ok(self.book().wallet.get(asset).copied().unwrap_or_default())
    }

    async fn oracle_price(&self, asset: &str) -> Result<Decimal> {
        self.book().price(asset)
    }

    async fn swap(
        &self,
        from_asset: &str,
        to_asset: &str,
        amount: Decimal,
        min_out: Decimal,
    ) -> Result<TxReceipt> {
        let mut book = self.book();
        let out = amount * book.price(from_asset)? / book.price(to_asset)?;
        if out < min_out {
            return Err(CarryError::Transaction(format!(
                "swap output {} below minimum {}",
                out, min_out
            )));
        }

        book.debit(from_asset, amount)?;
        book.credit(to_asset, out);
        info!(from = %from_asset, to = %to_asset, %amount, %out, "Paper swap");
        Ok(receipt().with_amount_out(out))
    }

    async fn supply(
        &self,
        asset: &str,
        amount: Decimal,
        _on_behalf_of: Option<&str>,
        _is_native: bool,
    ) -> Result<TxReceipt> {
        let mut book = self.book();
        book.reserve(asset)?;
        book.debit(asset, amount)?;
        *book.supplied.entry(asset.to_string()).or_default() += amount;
        info!(%asset, %amount, "Paper supply");
        Ok(receipt())
    }

    async fn borrow_asset(&self, asset: &str, amount: Decimal) -> Result<TxReceipt> {
        let mut book = self.book();
        if !book.reserve(asset)?.borrowing_enabled {
            return Err(CarryError::Transaction(format!(
                "borrowing disabled for {}",
                asset
            )));
        }

        let capacity = book.collateral_usd(|r| r.ltv)?;
        let debt = book.usd(&book.borrowed)?.to_f64().unwrap_or(0.0);
        let requested = (amount * book.price(asset)?).to_f64().unwrap_or(f64::MAX);
        if debt + requested > capacity {
            return Err(CarryError::Transaction(format!(
                "borrow of {} {} exceeds capacity ({:.2} of {:.2} USD used)",
                amount, asset, debt, capacity
            )));
        }

        *book.borrowed.entry(asset.to_string()).or_default() += amount;
        book.credit(asset, amount);
        info!(%asset, %amount, "Paper borrow");
        Ok(receipt())
    }

    async fn transfer(&self, asset: &str, to: &str, amount: Decimal) -> Result<TxReceipt> {
        self.book().debit(asset, amount)?;
        info!(%asset, %to, %amount, "Paper transfer");
        if let Some(hook) = &self.on_transfer {
            hook(asset, to, amount);
        }
        Ok(receipt())
    }

    async fn get_reserve_data(&self, asset: &str) -> Result<ReserveData> {
        self.book().reserve(asset).cloned()
    }

    async fn get_user_account_data(&self) -> Result<UserAccountData> {
        let book = self.book();
        let total_collateral_usd = book.collateral_usd(|_| 1.0)?;
        let borrow_capacity = book.collateral_usd(|r| r.ltv)?;
        let weighted_threshold = book.collateral_usd(|r| r.liquidation_threshold)?;
        let total_debt_usd = book.usd(&book.borrowed)?.to_f64().unwrap_or(0.0);

        let ratio = |weighted: f64| {
            if total_collateral_usd > 0.0 {
                weighted / total_collateral_usd
            } else {
                0.0
            }
        };

        Ok(UserAccountData {
            total_collateral_usd,
            total_debt_usd,
            available_borrows_usd: (borrow_capacity - total_debt_usd).max(0.0),
            current_liquidation_threshold: ratio(weighted_threshold),
            ltv: ratio(borrow_capacity),
            health_factor: if total_debt_usd > 0.0 {
                weighted_threshold / total_debt_usd
            } else {
                f64::INFINITY
            },
        })
    }

    async fn get_user_reserves(&self) -> Result<Vec<UserReservePosition>> {
        let book = self.book();
        let mut reserves: Vec<UserReservePosition> = book
            .reserves
            .values()
            .map(|reserve| {
                let supply = book.supplied.get(&reserve.symbol).copied().unwrap_or_default();
                let borrow = book.borrowed.get(&reserve.symbol).copied().unwrap_or_default();
                let price = book
                    .price(&reserve.symbol)
                    .map(|p| p.to_f64().unwrap_or(0.0));

                UserReservePosition {
                    symbol: reserve.symbol.clone(),
                    supply_balance: supply.to_f64().unwrap_or(0.0),
                    borrow_balance: borrow.to_f64().unwrap_or(0.0),
                    price_usd: usd_price(&reserve.symbol, price),
                    supply_apr: reserve.liquidity_rate,
                    borrow_apr: reserve.variable_borrow_rate,
                    liquidation_threshold: reserve.liquidation_threshold,
                    usage_as_collateral: reserve.collateral_enabled && supply > Decimal::ZERO,
                }
            })
            .filter(|r| !r.is_empty())
            .collect();

        reserves.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(reserves)
    }
}
