use crate::config::Config;
use crate::hub::PartyHub;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<PartyHub>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(hub: Arc<PartyHub>, config: Arc<Config>) -> Self {
        Self { hub, config }
    }
}
