//! In-memory exchange for paper trading.
//!
//! Implements the same execution port as a live venue, so the decision loop
//! runs unchanged:
//! - Market orders fill at the reference price moved by slippage
//! - Limit orders rest and fill once an observed price crosses them
//! - A taker fee is charged on every fill
//! - Open positions pay a fixed funding rate at every funding boundary
//! - Realized PnL, fees and funding flow into equity

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::{
    ExchangePosition, ExecutionPort, Fill, MarketDataPort, OrderKind, OrderRequest, OrderStatus,
    Side,
};
use crate::error::PortError;
use crate::models::{to_price, Direction, FundingPayment};
use crate::trading::MarginMode;

/// Paper exchange configuration.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub starting_equity: Decimal,
    /// Fee as a fraction of notional
    pub fee_rate: Decimal,
    /// Adverse price move applied to market fills
    pub slippage: Decimal,
    /// Timeframe polled to decide whether resting orders filled
    pub price_timeframe: String,
    /// Funding per interval as a fraction of entry notional; longs pay
    /// when positive
    pub funding_rate: Decimal,
    pub funding_interval_hours: i64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_equity: dec!(1000),
            fee_rate: dec!(0.0005),  // 0.05% taker
            slippage: dec!(0.0002),  // 0.02%
            price_timeframe: "1m".to_string(),
            funding_rate: dec!(0.0001), // 0.01% per 8h
            funding_interval_hours: 8,
        }
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    request: OrderRequest,
    price: Decimal,
}

#[derive(Debug, Default)]
struct Book {
    equity: Decimal,
    positions: HashMap<String, ExchangePosition>,
    orders: HashMap<String, RestingOrder>,
    filled: HashMap<String, Fill>,
    leverage: HashMap<String, u32>,
    margin_mode: HashMap<String, MarginMode>,
    funding: HashMap<String, Vec<FundingPayment>>,
    next_funding: HashMap<String, DateTime<Utc>>,
}

pub struct PaperExchange {
    config: PaperConfig,
    market: Arc<dyn MarketDataPort>,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig, market: Arc<dyn MarketDataPort>) -> Self {
        let book = Book {
            equity: config.starting_equity,
            ..Default::default()
        };
        Self {
            config,
            market,
            book: Mutex::new(book),
        }
    }

    pub async fn leverage(&self, symbol: &str) -> Option<u32> {
        self.book.lock().await.leverage.get(symbol).copied()
    }

    /// Settle every funding boundary up to `at`.
    pub async fn accrue_funding(&self, at: DateTime<Utc>) {
        let mut book = self.book.lock().await;
        self.accrue(&mut book, at);
    }

    fn accrue(&self, book: &mut Book, at: DateTime<Utc>) {
        let interval = Duration::hours(self.config.funding_interval_hours.max(1));
        let Book {
            equity,
            positions,
            funding,
            next_funding,
            ..
        } = book;
        for (symbol, due) in next_funding.iter_mut() {
            let Some(pos) = positions.get(symbol) else {
                continue;
            };
            while *due <= at {
                let amount = (pos.entry_price * pos.quantity * self.config.funding_rate
                    * pos.direction.sign())
                .round_dp(8);
                *equity -= amount;
                funding.entry(symbol.clone()).or_default().push(FundingPayment {
                    amount,
                    settled_at: *due,
                });
                debug!(symbol = %symbol, amount = %amount, at = %due, "Paper funding settled");
                *due += interval;
            }
        }
    }

    fn next_boundary(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let hours = self.config.funding_interval_hours.max(1);
        let period = hours * 3600;
        let ts = (after.timestamp().div_euclid(period) + 1) * period;
        DateTime::from_timestamp(ts, 0).unwrap_or(after + Duration::hours(hours))
    }

    fn slipped(&self, price: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => price * (Decimal::ONE + self.config.slippage),
            Side::Sell => price * (Decimal::ONE - self.config.slippage),
        }
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, PortError> {
        let candles = self
            .market
            .get_candles(symbol, &self.config.price_timeframe, 1)
            .await?;
        candles
            .last()
            .and_then(|c| to_price(c.close))
            .ok_or_else(|| PortError::Protocol(format!("no price for {}", symbol)))
    }

    /// Book a fill against the ledger.
    fn settle(&self, book: &mut Book, request: &OrderRequest, price: Decimal, order_id: String) -> Fill {
        let fee = (price * request.quantity * self.config.fee_rate).round_dp(8);
        book.equity -= fee;

        let direction = match request.side {
            Side::Buy => Direction::Long,
            Side::Sell => Direction::Short,
        };
        let mut remaining = request.quantity;

        if let Some(pos) = book.positions.get_mut(&request.symbol) {
            if pos.direction == direction {
                let total = pos.quantity + remaining;
                pos.entry_price = (pos.entry_price * pos.quantity + price * remaining) / total;
                pos.quantity = total;
                remaining = Decimal::ZERO;
            } else {
                let closed = remaining.min(pos.quantity);
                let pnl = (price - pos.entry_price) * closed * pos.direction.sign();
                book.equity += pnl;
                pos.quantity -= closed;
                remaining -= closed;
                debug!(symbol = %request.symbol, qty = %closed, pnl = %pnl, "Paper position reduced");
            }
        }
        if book
            .positions
            .get(&request.symbol)
            .is_some_and(|p| p.quantity.is_zero())
        {
            book.positions.remove(&request.symbol);
            book.next_funding.remove(&request.symbol);
        }
        let now = Utc::now();
        if remaining > Decimal::ZERO && !request.reduce_only {
            book.next_funding
                .insert(request.symbol.clone(), self.next_boundary(now));
            book.positions.insert(
                request.symbol.clone(),
                ExchangePosition {
                    symbol: request.symbol.clone(),
                    direction,
                    quantity: remaining,
                    entry_price: price,
                },
            );
        }

        let fill = Fill {
            order_id: order_id.clone(),
            price,
            quantity: request.quantity,
            fee,
            timestamp: now,
        };
        book.filled.insert(order_id, fill.clone());
        fill
    }
}

#[async_trait]
impl ExecutionPort for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderStatus, PortError> {
        if request.quantity <= Decimal::ZERO {
            return Err(PortError::ExchangeRejected(format!("quantity {}", request.quantity)));
        }
        if request.reference_price <= Decimal::ZERO {
            return Err(PortError::ExchangeRejected(format!(
                "price {}",
                request.reference_price
            )));
        }

        let mut book = self.book.lock().await;
        self.accrue(&mut book, Utc::now());
        if request.reduce_only {
            let closes_position = book.positions.get(&request.symbol).is_some_and(|p| {
                Side::closing(p.direction) == request.side && request.quantity <= p.quantity
            });
            if !closes_position {
                return Err(PortError::ExchangeRejected(
                    "reduce-only order would not reduce".to_string(),
                ));
            }
        }

        let order_id = Uuid::new_v4().to_string();
        match request.kind {
            OrderKind::Market => {
                let price = self.slipped(request.reference_price, request.side);
                let fill = self.settle(&mut book, request, price, order_id);
                info!(
                    symbol = %request.symbol,
                    side = request.side.as_str(),
                    qty = %fill.quantity,
                    price = %fill.price.round_dp(4),
                    "Paper fill"
                );
                Ok(OrderStatus::Filled(fill))
            }
            OrderKind::Limit(price) => {
                if price <= Decimal::ZERO {
                    return Err(PortError::ExchangeRejected(format!("limit price {}", price)));
                }
                book.orders.insert(
                    order_id.clone(),
                    RestingOrder {
                        request: request.clone(),
                        price,
                    },
                );
                info!(symbol = %request.symbol, side = request.side.as_str(), price = %price, "Paper limit order resting");
                Ok(OrderStatus::Pending { order_id, price })
            }
        }
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), PortError> {
        let mut book = self.book.lock().await;
        match book.orders.remove(order_id) {
            Some(_) => Ok(()),
            None => Err(PortError::ExchangeRejected(format!("unknown order {}", order_id))),
        }
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, PortError> {
        {
            let book = self.book.lock().await;
            if let Some(fill) = book.filled.get(order_id) {
                return Ok(OrderStatus::Filled(fill.clone()));
            }
            if !book.orders.contains_key(order_id) {
                return Ok(OrderStatus::Cancelled);
            }
        }

        // Price fetched outside the lock
        let price = self.last_price(symbol).await?;

        let mut book = self.book.lock().await;
        let Some(resting) = book.orders.get(order_id).cloned() else {
            return Ok(OrderStatus::Cancelled);
        };
        let crossed = match resting.request.side {
            Side::Buy => price <= resting.price,
            Side::Sell => price >= resting.price,
        };
        if !crossed {
            return Ok(OrderStatus::Pending {
                order_id: order_id.to_string(),
                price: resting.price,
            });
        }

        book.orders.remove(order_id);
        let fill = self.settle(&mut book, &resting.request, resting.price, order_id.to_string());
        info!(symbol, price = %fill.price, "Paper limit order filled");
        Ok(OrderStatus::Filled(fill))
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, PortError> {
        Ok(self.book.lock().await.positions.get(symbol).cloned())
    }

    async fn get_equity(&self) -> Result<Decimal, PortError> {
        let mut book = self.book.lock().await;
        self.accrue(&mut book, Utc::now());
        Ok(book.equity)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), PortError> {
        if leverage == 0 || leverage > 125 {
            return Err(PortError::ExchangeRejected(format!("leverage {}", leverage)));
        }
        self.book.lock().await.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), PortError> {
        self.book.lock().await.margin_mode.insert(symbol.to_string(), mode);
        Ok(())
    }

    async fn funding_fees(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FundingPayment>, PortError> {
        let mut book = self.book.lock().await;
        self.accrue(&mut book, Utc::now());
        Ok(book
            .funding
            .get(symbol)
            .map(|payments| {
                payments
                    .iter()
                    .filter(|p| p.settled_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
