use candle_core::Device;
use common::ServiceConfig;
use std::{collections::HashMap, sync::Arc, time::Instant};
use sysinfo::System;
use tracing::{info, warn};

use crate::chat::Chatbot;
use crate::csv_preview::CsvPreviewer;
use crate::fraud::{FraudModel, FraudScorer};

pub const SERVICE_NAME: &str = "BFSI Predictive Intelligence API";

/// Everything a request handler may read. Built once at startup and never
/// mutated by requests.
pub struct ServiceContext {
    pub config: ServiceConfig,
    pub fraud: Option<Arc<dyn FraudScorer>>,
    pub chat: Option<Arc<Chatbot>>,
    pub csv: CsvPreviewer,
    pub load_times_ms: HashMap<String, f64>,
    pub device: String,
    pub system: tokio::sync::Mutex<System>,
}

impl ServiceContext {
    pub fn new(
        config: ServiceConfig,
        fraud: Option<Arc<dyn FraudScorer>>,
        chat: Option<Arc<Chatbot>>,
    ) -> Self {
        let csv = CsvPreviewer::new(&config.csv.path, config.csv.preview_rows);
        Self {
            config,
            fraud,
            chat,
            csv,
            load_times_ms: HashMap::new(),
            device: format!("{:?}", Device::Cpu),
            system: tokio::sync::Mutex::new(System::new()),
        }
    }

    /// Load every artifact. Each failure only disables its own capability.
    pub fn load(config: ServiceConfig) -> Self {
        let device = Device::Cpu;
        info!("Using device: {:?}", device);

        let mut load_times_ms = HashMap::new();

        let start_time = Instant::now();
        let fraud: Option<Arc<dyn FraudScorer>> = match FraudModel::load(&config.fraud) {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                warn!("Could not load scaler/fraud model: {:#}", e);
                None
            }
        };
        load_times_ms.insert(
            "fraud".to_string(),
            start_time.elapsed().as_secs_f64() * 1000.0,
        );

        let start_time = Instant::now();
        let chat = match Chatbot::load(&config.chat, &device) {
            Ok(chatbot) => Some(Arc::new(chatbot)),
            Err(e) => {
                warn!("Chatbot not initialized: {:#}", e);
                None
            }
        };
        load_times_ms.insert(
            "chat".to_string(),
            start_time.elapsed().as_secs_f64() * 1000.0,
        );

        if !CsvPreviewer::enabled() {
            warn!("CSV support is not compiled in. CSV data endpoint will not work.");
        }

        let mut context = Self::new(config, fraud, chat);
        context.load_times_ms = load_times_ms;
        context.device = format!("{:?}", device);
        context
    }

    pub fn chat_model_loaded(&self) -> bool {
        self.chat.as_ref().map(|c| c.is_loaded()).unwrap_or(false)
    }
}
