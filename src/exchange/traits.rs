use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{
    AccountSnapshot, ExchangeAck, ExchangeMeta, OrderResult, ReserveData, TxReceipt,
    UserAccountData, UserReservePosition,
};
use crate::error::{CarryError, Result};

pub(crate) fn unsupported(feature: &str, venue: &str) -> CarryError {
    CarryError::Unsupported(format!("{} is not implemented for venue '{}'", feature, venue))
}

/// Collateralized lending venue.
///
/// Transaction building, approvals and gas are the implementation's concern; every
/// mutating call resolves once the transaction is mined and reports `success`.
#[async_trait]
pub trait LendingProtocol: Send + Sync {
    fn name(&self) -> &str;

    /// Idle wallet balance of `asset`
    async fn wallet_balance(&self, asset: &str) -> Result<Decimal>;

    /// Oracle price of `asset` in USD
    async fn oracle_price(&self, asset: &str) -> Result<Decimal>;

    async fn swap(
        &self,
        from_asset: &str,
        to_asset: &str,
        amount: Decimal,
        min_out: Decimal,
    ) -> Result<TxReceipt>;

    async fn supply(
        &self,
        asset: &str,
        amount: Decimal,
        on_behalf_of: Option<&str>,
        is_native: bool,
    ) -> Result<TxReceipt>;

    async fn borrow_asset(&self, asset: &str, amount: Decimal) -> Result<TxReceipt>;

    /// Plain token transfer out of the wallet
    async fn transfer(&self, asset: &str, to: &str, amount: Decimal) -> Result<TxReceipt>;

    async fn get_reserve_data(&self, asset: &str) -> Result<ReserveData>;

    async fn get_user_account_data(&self) -> Result<UserAccountData>;

    /// Reserves with a non-zero supply or borrow balance
    async fn get_user_reserves(&self) -> Result<Vec<UserReservePosition>>;
}

/// Perpetuals venue used for the short hedge
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HedgeExchange: Send + Sync {
    fn name(&self) -> &str;

    fn is_dry_run(&self) -> bool;

    async fn user_state(&self, address: &str) -> Result<AccountSnapshot>;

    async fn meta(&self) -> Result<ExchangeMeta>;

    async fn market_open(
        &self,
        symbol: &str,
        is_buy: bool,
        size: Decimal,
        slippage: Decimal,
    ) -> Result<OrderResult>;

    async fn withdraw_from_bridge(&self, amount: Decimal, address: &str) -> Result<ExchangeAck>;
}
