use async_trait::async_trait;
use neuro_market_protocol::TokenAddress;
use tracing::info;

use crate::error::PreflightError;

const GIB: u128 = 1024 * 1024 * 1024;

#[async_trait]
pub trait RateOracle: Send + Sync {
    /// Units of `token` per unit of storage price.
    async fn current_rate(&self, token: &TokenAddress) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn available_balance(&self, token: &TokenAddress) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone)]
pub struct PricingRequest {
    pub token: TokenAddress,
    /// Price per GiB per day.
    pub price: u64,
    pub shard_size: u64,
    /// Days.
    pub storage_length: u32,
    pub shard_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentQuote {
    pub rate: u64,
    pub expect_one_pay: u64,
    pub expect_total_pay: u64,
}

/// Pay owed for a single shard: `ceil(size * price * days / GiB)`, at least 1, times `rate`.
pub fn total_pay(
    shard_size: u64,
    price: u64,
    storage_length: u32,
    rate: u64,
) -> Result<u64, PreflightError> {
    if shard_size == 0 {
        return Err(PreflightError::PricingError("shard size must be positive".to_string()));
    }
    if price == 0 {
        return Err(PreflightError::PricingError("price must be positive".to_string()));
    }
    if storage_length == 0 {
        return Err(PreflightError::PricingError(
            "storage length must be positive".to_string(),
        ));
    }
    if rate == 0 {
        return Err(PreflightError::PricingError("exchange rate must be positive".to_string()));
    }

    let overflow = || PreflightError::PricingError("per-shard pay overflows".to_string());
    let product = (shard_size as u128)
        .checked_mul(price as u128)
        .and_then(|v| v.checked_mul(storage_length as u128))
        .ok_or_else(overflow)?;
    let base = product.div_ceil(GIB).max(1);
    let pay = base.checked_mul(rate as u128).ok_or_else(overflow)?;
    u64::try_from(pay).map_err(|_| overflow())
}

/// Prices the whole session and checks the renter can pay for it. Performs only the two reads.
pub async fn run_preflight(
    oracle: &dyn RateOracle,
    balances: &dyn BalanceSource,
    request: &PricingRequest,
) -> Result<PaymentQuote, PreflightError> {
    if request.shard_count == 0 {
        return Err(PreflightError::PricingError("session has no shards".to_string()));
    }

    let rate = oracle
        .current_rate(&request.token)
        .await
        .map_err(|source| PreflightError::RateUnavailable {
            token: request.token.to_string(),
            source,
        })?;

    let expect_one_pay = total_pay(
        request.shard_size,
        request.price,
        request.storage_length,
        rate,
    )?;
    let expect_total_pay = u64::try_from(request.shard_count)
        .ok()
        .and_then(|n| expect_one_pay.checked_mul(n))
        .ok_or_else(|| PreflightError::PricingError("total pay overflows".to_string()))?;

    let available = balances
        .available_balance(&request.token)
        .await
        .map_err(|source| PreflightError::BalanceUnavailable {
            token: request.token.to_string(),
            source,
        })?;
    if available < expect_total_pay {
        return Err(PreflightError::InsufficientBalance {
            required: expect_total_pay,
            available,
        });
    }

    info!(
        token = %request.token,
        rate,
        expect_one_pay,
        expect_total_pay,
        available,
        "Payment preflight passed"
    );
    Ok(PaymentQuote {
        rate,
        expect_one_pay,
        expect_total_pay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FixedRate(Option<u64>);

    #[async_trait]
    impl RateOracle for FixedRate {
        async fn current_rate(&self, _: &TokenAddress) -> anyhow::Result<u64> {
            self.0.ok_or_else(|| anyhow!("oracle offline"))
        }
    }

    struct FixedBalance(u64);

    #[async_trait]
    impl BalanceSource for FixedBalance {
        async fn available_balance(&self, _: &TokenAddress) -> anyhow::Result<u64> {
            Ok(self.0)
        }
    }

    fn request(shard_count: usize) -> PricingRequest {
        PricingRequest {
            token: TokenAddress::new("0xWBTT"),
            price: 250,
            shard_size: 2 * GIB as u64,
            storage_length: 30,
            shard_count,
        }
    }

    #[test]
    fn per_shard_pay_scales_with_size_price_length_and_rate() {
        // 2 GiB * 250 * 30 days = 15_000 base units, times rate 3
        assert_eq!(total_pay(2 * GIB as u64, 250, 30, 3).unwrap(), 45_000);
    }

    #[test]
    fn tiny_shards_round_up_to_one_unit() {
        assert_eq!(total_pay(1, 1, 1, 7).unwrap(), 7);
    }

    #[test]
    fn invalid_inputs_and_overflow_are_pricing_errors() {
        assert!(matches!(total_pay(0, 1, 1, 1), Err(PreflightError::PricingError(_))));
        assert!(matches!(total_pay(1024, 0, 30, 5), Err(PreflightError::PricingError(_))));
        assert!(matches!(total_pay(1, 1, 0, 1), Err(PreflightError::PricingError(_))));
        assert!(matches!(total_pay(1, 1, 1, 0), Err(PreflightError::PricingError(_))));
        assert!(matches!(
            total_pay(u64::MAX, u64::MAX, u32::MAX, u64::MAX),
            Err(PreflightError::PricingError(_))
        ));
    }

    #[tokio::test]
    async fn total_is_one_pay_times_shard_count() {
        let quote = run_preflight(&FixedRate(Some(3)), &FixedBalance(u64::MAX), &request(4))
            .await
            .expect("enough balance");
        assert_eq!(quote.rate, 3);
        assert_eq!(quote.expect_one_pay, 45_000);
        assert_eq!(quote.expect_total_pay, 180_000);
    }

    #[tokio::test]
    async fn balance_must_cover_total() {
        let err = run_preflight(&FixedRate(Some(3)), &FixedBalance(179_999), &request(4))
            .await
            .expect_err("short by one");
        assert!(matches!(
            err,
            PreflightError::InsufficientBalance {
                required: 180_000,
                available: 179_999
            }
        ));
        assert!(run_preflight(&FixedRate(Some(3)), &FixedBalance(180_000), &request(4))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unreachable_oracle_is_rate_unavailable() {
        let err = run_preflight(&FixedRate(None), &FixedBalance(u64::MAX), &request(1))
            .await
            .expect_err("no rate");
        assert!(matches!(err, PreflightError::RateUnavailable { .. }));
    }

    #[tokio::test]
    async fn empty_session_is_rejected() {
        let err = run_preflight(&FixedRate(Some(1)), &FixedBalance(u64::MAX), &request(0))
            .await
            .expect_err("no shards");
        assert!(matches!(err, PreflightError::PricingError(_)));
    }

    #[tokio::test]
    async fn free_contracts_are_rejected() {
        let err = run_preflight(
            &FixedRate(Some(3)),
            &FixedBalance(u64::MAX),
            &PricingRequest {
                price: 0,
                ..request(2)
            },
        )
        .await
        .expect_err("zero price");
        assert!(matches!(err, PreflightError::PricingError(ref m) if m.contains("price")));
    }
}
