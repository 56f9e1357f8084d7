use crate::{config::AppConfig, deploy::DeployManager};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub deploys: Arc<DeployManager>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, deploys: Arc<DeployManager>) -> Self {
        Self { config, deploys }
    }
}
