//! Port traits and the adapters behind them.

mod analyst;
mod market_client;
mod ports;
mod retry;

pub use analyst::{FileAnalyst, NeutralAnalyst};
pub use market_client::MarketClient;
pub use ports::{
    AiOutcome, AnalysisContext, AnalystPort, EventKind, ExchangePosition, ExecutionPort, Fill,
    MarketDataPort, NotificationPort, OrderKind, OrderRequest, OrderStatus, PersistencePort,
    Side,
};
pub use retry::RetryPolicy;

#[cfg(test)]
pub(crate) mod testing;
