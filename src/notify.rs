//! Operator notifications.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::api::{EventKind, NotificationPort};

/// Writes notifications to the log. Problems land at `warn`.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationPort for LogNotifier {
    async fn notify(&self, kind: EventKind, payload: &str) {
        match kind {
            EventKind::OrderRejected
            | EventKind::StateCorrupted
            | EventKind::AnalystDegraded
            | EventKind::CycleSkipped => warn!(event = kind.as_str(), "{}", payload),
            _ => info!(event = kind.as_str(), "{}", payload),
        }
    }
}
