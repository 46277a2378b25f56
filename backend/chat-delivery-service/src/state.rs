use crate::{config::Config, services::MessagingCore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub core: MessagingCore,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(core: MessagingCore, config: Arc<Config>) -> Self {
        Self { core, config }
    }
}
