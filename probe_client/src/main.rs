use anyhow::{Context, Result};
use common::{
    throughput, ChatRequest, ChatResponse, CsvPreview, FraudRequest, FraudResponse, ProbeConfig,
    ProbeEndpoint, ScenarioConfig, Statistics,
};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioResult {
    scenario_name: String,
    endpoint: ProbeEndpoint,
    concurrency: usize,
    num_requests: usize,
    latency_ms: Statistics,
    throughput_qps: f64,
    total_duration_sec: f64,
    client_cpu_percent: f32,
    client_memory_rss_mb: f64,
    errors: usize,
    error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProbeReport {
    server_url: String,
    server_info: serde_json::Value,
    results: BTreeMap<String, ScenarioResult>,
    timestamp: String,
}

/// One request a scenario will send, prepared before timing starts.
#[derive(Debug, Clone, PartialEq)]
enum ProbeRequest {
    Fraud(Vec<f64>),
    Chat(String),
    Csv,
}

struct ProbeClient {
    server_url: String,
    client: reqwest::blocking::Client,
}

impl ProbeClient {
    fn new(server_url: String) -> Result<Self> {
        // Chat generation on CPU can take tens of seconds.
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self { server_url, client })
    }

    fn wait_for_server(&self, timeout_secs: u64) -> Result<()> {
        let health_url = format!("{}/health", self.server_url);
        let start = Instant::now();

        println!("Waiting for server at {}...", self.server_url);

        while start.elapsed().as_secs() < timeout_secs {
            if let Ok(response) = self.client.get(&health_url).send() {
                if response.status().is_success() {
                    println!("✓ Server is ready!");
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_secs(2));
        }

        anyhow::bail!("✗ Server failed to start within {}s", timeout_secs)
    }

    fn get_server_info(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/info", self.server_url))
            .send()
            .context("Failed to get server info")?;

        let info: serde_json::Value = response.json()?;
        Ok(info)
    }

    fn predict_fraud(&self, feature_vector: Vec<f64>) -> Result<FraudResponse> {
        let request = FraudRequest {
            feature_vector: Some(feature_vector),
            ..FraudRequest::default()
        };

        let response = self
            .client
            .post(format!("{}/predict_fraud", self.server_url))
            .json(&request)
            .send()
            .context("Failed to send fraud request")?;

        if !response.status().is_success() {
            anyhow::bail!("Server returned error: {}", response.status());
        }
        Ok(response.json()?)
    }

    fn chat(&self, message: String) -> Result<ChatResponse> {
        let request = ChatRequest {
            message,
            history: None,
        };

        let response = self
            .client
            .post(format!("{}/chat", self.server_url))
            .json(&request)
            .send()
            .context("Failed to send chat request")?;

        if !response.status().is_success() {
            anyhow::bail!("Server returned error: {}", response.status());
        }
        Ok(response.json()?)
    }

    fn csv_data(&self) -> Result<CsvPreview> {
        let response = self
            .client
            .get(format!("{}/csv_data", self.server_url))
            .send()
            .context("Failed to send csv request")?;

        if !response.status().is_success() {
            anyhow::bail!("Server returned error: {}", response.status());
        }
        Ok(response.json()?)
    }

    fn send(&self, request: &ProbeRequest) -> Result<()> {
        match request {
            ProbeRequest::Fraud(vector) => self.predict_fraud(vector.clone()).map(|_| ()),
            ProbeRequest::Chat(message) => self.chat(message.clone()).map(|_| ()),
            ProbeRequest::Csv => self.csv_data().map(|_| ()),
        }
    }

    fn warmup(&self, config: &ProbeConfig) -> Result<()> {
        let num_iterations = config.warmup.num_requests;
        println!("\nWarming up server ({} iterations)...", num_iterations);

        let pb = progress_bar(num_iterations, "{msg} [{bar:40.cyan/blue}] {pos}/{len}")?;
        pb.set_message("Warmup");

        let requests = build_requests(ProbeEndpoint::Fraud, num_iterations, config)?;
        let mut errors = 0;

        for request in &requests {
            if self.send(request).is_err() {
                errors += 1;
            }
            pb.inc(1);
        }

        pb.finish_with_message("✓ Warmup complete");

        if errors > 0 {
            println!(
                "⚠ Warning: {}/{} warmup requests failed",
                errors, num_iterations
            );
        }

        Ok(())
    }

    fn run_scenario(&self, scenario: &ScenarioConfig, config: &ProbeConfig) -> Result<ScenarioResult> {
        println!("\n{}", "=".repeat(70));
        println!("Scenario: {}", scenario.name);
        println!("  Endpoint: {:?}", scenario.endpoint);
        println!("  Concurrency: {}", scenario.concurrency);
        println!("  Requests: {}", scenario.num_requests);
        println!("{}", "=".repeat(70));

        let requests = build_requests(scenario.endpoint, scenario.num_requests, config)?;

        let pb = progress_bar(
            scenario.num_requests,
            "{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )?;
        pb.set_message("Running");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(scenario.concurrency.max(1))
            .build()?;

        let start_time = Instant::now();

        // Some(latency_ms) per success, None per failed request.
        let outcomes: Vec<Option<f64>> = pool.install(|| {
            requests
                .par_iter()
                .map(|request| {
                    let request_start = Instant::now();
                    let outcome = self
                        .send(request)
                        .ok()
                        .map(|_| request_start.elapsed().as_secs_f64() * 1000.0);
                    pb.inc(1);
                    outcome
                })
                .collect()
        });

        let total_duration = start_time.elapsed().as_secs_f64();
        pb.finish_with_message("✓ Complete");

        let (client_cpu_percent, client_memory_rss_mb) = client_process_usage();
        let result = summarize(
            scenario,
            &outcomes,
            total_duration,
            client_cpu_percent,
            client_memory_rss_mb,
        );

        println!("\nResults:");
        println!("  Total duration: {:.2}s", result.total_duration_sec);
        println!("  Throughput: {:.2} req/s", result.throughput_qps);
        println!("  Latency: {}", result.latency_ms.summary());
        println!("  Errors: {}", result.errors);
        println!("  Error rate: {:.2}%", result.error_rate * 100.0);

        Ok(result)
    }

    fn run_probe(&self, config: &ProbeConfig) -> Result<ProbeReport> {
        let server_info = self.get_server_info()?;
        println!("\nServer Info:");
        println!("{}", serde_json::to_string_pretty(&server_info)?);

        if config.warmup.enabled {
            self.warmup(config)?;
        }

        let mut results = BTreeMap::new();
        for scenario in &config.scenarios {
            let result = self.run_scenario(scenario, config)?;
            results.insert(scenario.name.clone(), result);
        }

        Ok(ProbeReport {
            server_url: self.server_url.clone(),
            server_info,
            results,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

fn progress_bar(len: usize, template: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

/// Cycle through the configured samples until `count` requests are prepared.
fn build_requests(
    endpoint: ProbeEndpoint,
    count: usize,
    config: &ProbeConfig,
) -> Result<Vec<ProbeRequest>> {
    let requests = match endpoint {
        ProbeEndpoint::Fraud => {
            if config.fraud_samples.is_empty() {
                anyhow::bail!("Fraud scenarios need at least one entry in fraud_samples");
            }
            config
                .fraud_samples
                .iter()
                .cycle()
                .take(count)
                .map(|v| ProbeRequest::Fraud(v.clone()))
                .collect()
        }
        ProbeEndpoint::Chat => {
            if config.chat_prompts.is_empty() {
                anyhow::bail!("Chat scenarios need at least one entry in chat_prompts");
            }
            config
                .chat_prompts
                .iter()
                .cycle()
                .take(count)
                .map(|m| ProbeRequest::Chat(m.clone()))
                .collect()
        }
        ProbeEndpoint::Csv => vec![ProbeRequest::Csv; count],
    };
    Ok(requests)
}

fn summarize(
    scenario: &ScenarioConfig,
    outcomes: &[Option<f64>],
    total_duration_sec: f64,
    client_cpu_percent: f32,
    client_memory_rss_mb: f64,
) -> ScenarioResult {
    let latencies: Vec<f64> = outcomes.iter().flatten().copied().collect();
    let errors = outcomes.len() - latencies.len();
    let error_rate = if outcomes.is_empty() {
        0.0
    } else {
        errors as f64 / outcomes.len() as f64
    };

    ScenarioResult {
        scenario_name: scenario.name.clone(),
        endpoint: scenario.endpoint,
        concurrency: scenario.concurrency,
        num_requests: outcomes.len(),
        throughput_qps: throughput(latencies.len(), total_duration_sec),
        latency_ms: Statistics::from_samples(&latencies),
        total_duration_sec,
        client_cpu_percent,
        client_memory_rss_mb,
        errors,
        error_rate,
    }
}

/// CPU and resident memory of this client process; zeros when unavailable.
fn client_process_usage() -> (f32, f64) {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_all();

    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .map(|p| (p.cpu_usage(), p.memory() as f64 / 1024.0 / 1024.0))
        .unwrap_or((0.0, 0.0))
}

fn main() -> Result<()> {
    println!("========================================================================");
    println!("BFSI Service Probe Client");
    println!("========================================================================");

    let server_url = env::var("SERVER_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let config_path = env::var("PROBE_CONFIG").unwrap_or_else(|_| "config/probe.yaml".to_string());
    let results_dir = env::var("RESULTS_DIR").unwrap_or_else(|_| "results".to_string());

    println!("Server URL: {}", server_url);
    println!("Probe config: {}", config_path);

    let config = ProbeConfig::load(&config_path)
        .with_context(|| format!("Failed to load probe configuration from {}", config_path))?;

    let client = ProbeClient::new(server_url)?;
    client.wait_for_server(120)?;

    let report = client.run_probe(&config)?;

    let output_dir = Path::new(&results_dir);
    fs::create_dir_all(output_dir)?;

    let output_path = output_dir.join(format!(
        "probe-{}.json",
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
    ));
    let json = serde_json::to_string_pretty(&report)?;
    fs::write(&output_path, json)?;

    println!("\n========================================================================");
    println!("Probe complete!");
    println!("Results saved to: {}", output_path.display());
    println!("========================================================================");

    Ok(())
}
