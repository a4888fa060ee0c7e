use std::sync::Arc;

use crate::config::settings::AppConfig;
use crate::modules::jobs::repository::JobLedger;
use crate::workers::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ledger: Arc<dyn JobLedger>,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(config: AppConfig, ledger: Arc<dyn JobLedger>, scheduler: Scheduler) -> Self {
        Self {
            config: Arc::new(config),
            ledger,
            scheduler,
        }
    }
}
