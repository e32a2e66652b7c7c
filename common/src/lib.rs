pub mod http;
pub mod config;
pub mod stats;

pub use http::{
    ChatRequest, ChatResponse, ChatTurn, CsvPreview, ErrorResponse, FraudRequest, FraudResponse,
    HealthResponse, InfoResponse, RootResponse,
};
pub use config::{ProbeConfig, ProbeEndpoint, ScenarioConfig, ServiceConfig};
pub use stats::{throughput, Statistics};
