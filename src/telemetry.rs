//! Logging setup and the in-memory query log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Install the global subscriber. `RUST_LOG` wins over the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// One handled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub tenant_id: String,
    pub question: String,
    pub route: String,
    pub sql_generated: Option<String>,
    pub rows_returned: Option<u64>,
    pub delivery: Option<String>,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl QueryLogEntry {
    pub fn new(tenant_id: impl Into<String>, question: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            question: question.into(),
            route: route.into(),
            sql_generated: None,
            rows_returned: None,
            delivery: None,
            execution_time_ms: 0,
            success: true,
            error_message: None,
        }
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }
}

/// Bounded ring of recent [`QueryLogEntry`] records.
pub struct ExecutionLogger {
    entries: Mutex<VecDeque<QueryLogEntry>>,
    capacity: usize,
}

impl ExecutionLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn log_query(&self, entry: QueryLogEntry) {
        if entry.success {
            info!(
                request_id = %entry.request_id,
                tenant = %entry.tenant_id,
                route = %entry.route,
                rows = ?entry.rows_returned,
                delivery = ?entry.delivery,
                elapsed_ms = entry.execution_time_ms,
                "query handled"
            );
        } else {
            warn!(
                request_id = %entry.request_id,
                tenant = %entry.tenant_id,
                route = %entry.route,
                elapsed_ms = entry.execution_time_ms,
                error = ?entry.error_message,
                "query failed"
            );
        }

        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<QueryLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Newest first, one tenant only.
    pub fn recent_for(&self, tenant_id: &str, limit: usize) -> Vec<QueryLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for ExecutionLogger {
    fn default() -> Self {
        Self::new(500)
    }
}
