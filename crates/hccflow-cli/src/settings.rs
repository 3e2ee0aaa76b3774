//! Command-line and environment configuration, mapped onto
//! [`AnalyzerConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use hccflow_core::config::{
    DEFAULT_CATEGORY_COLUMN, DEFAULT_CODE_COLUMN, DEFAULT_DESCRIPTION_COLUMN,
};
use hccflow_core::{
    AnalyzerConfig, ConfigError, EscalationPolicy, InferenceSettings, ReferenceColumns,
    RunnerSettings,
};

#[derive(Args, Debug, Clone)]
pub struct ReferenceArgs {
    /// Reference code table (CSV or Parquet)
    #[arg(long = "reference", env = "HCC_CODES_PATH")]
    pub path: PathBuf,

    #[arg(long, default_value = DEFAULT_CODE_COLUMN)]
    pub code_column: String,

    #[arg(long, default_value = DEFAULT_DESCRIPTION_COLUMN)]
    pub description_column: String,

    #[arg(long, default_value = DEFAULT_CATEGORY_COLUMN)]
    pub category_column: String,
}

impl ReferenceArgs {
    pub fn columns(&self) -> ReferenceColumns {
        ReferenceColumns {
            code: self.code_column.clone(),
            description: self.description_column.clone(),
            category: self.category_column.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzerArgs {
    #[command(flatten)]
    pub reference: ReferenceArgs,

    /// Escalate conditions whose deterministic confidence is below this
    #[arg(long, env = "HCC_ESCALATION_THRESHOLD")]
    pub escalation_threshold: f64,

    /// Escalate every condition to inference
    #[arg(long, env = "HCC_ESCALATE_ALL")]
    pub escalate_all: bool,

    /// Deterministic confidence for codes absent from the reference table
    #[arg(long, env = "HCC_NO_MATCH_CONFIDENCE")]
    pub no_match_confidence: f64,

    /// Confidence at or above which a determination counts as high confidence
    #[arg(long = "high-confidence", default_value_t = 0.9)]
    pub high_confidence_cutoff: f64,

    /// Inference endpoint base URL; inference is disabled without it
    #[arg(long, env = "HCC_INFERENCE_ENDPOINT")]
    pub inference_endpoint: Option<String>,

    #[arg(long, env = "HCC_INFERENCE_API_KEY", hide_env_values = true)]
    pub inference_api_key: Option<String>,

    #[arg(long, env = "HCC_INFERENCE_MODEL")]
    pub inference_model: Option<String>,

    #[arg(long, default_value_t = 60)]
    pub inference_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub max_inference_retries: u32,

    /// Conditions per inference call
    #[arg(long, default_value_t = 20)]
    pub batch_size: usize,

    /// Confidence ceiling for inference fallbacks
    #[arg(long, default_value_t = 0.3)]
    pub fallback_confidence: f64,

    #[arg(long, env = "HCC_WORKERS", default_value_t = 4)]
    pub workers: usize,
}

impl AnalyzerArgs {
    /// Build and validate the analyzer configuration.
    pub fn to_config(&self) -> Result<AnalyzerConfig, ConfigError> {
        let inference = match &self.inference_endpoint {
            None => None,
            Some(endpoint) => {
                let model = self
                    .inference_model
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| {
                        ConfigError::Other("inference endpoint configured without a model".into())
                    })?;
                let mut s = InferenceSettings::new(
                    endpoint.clone(),
                    self.inference_api_key.clone().unwrap_or_default(),
                    model,
                );
                s.timeout = Duration::from_secs(self.inference_timeout_secs);
                s.max_retries = self.max_inference_retries;
                s.batch_size = self.batch_size;
                s.fallback_confidence = self.fallback_confidence;
                Some(s)
            }
        };

        let config = AnalyzerConfig {
            reference_path: self.reference.path.clone(),
            reference_columns: self.reference.columns(),
            escalation: EscalationPolicy {
                threshold: self.escalation_threshold,
                escalate_all: self.escalate_all,
            },
            no_match_confidence: self.no_match_confidence,
            high_confidence_cutoff: self.high_confidence_cutoff,
            inference,
            runner: RunnerSettings {
                worker_concurrency: self.workers,
                ..RunnerSettings::default()
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Directory holding extraction artifacts
    #[arg(long, env = "INPUT_DIR", default_value = "./data")]
    pub input_dir: PathBuf,

    /// Directory analysis results are written to
    #[arg(long, env = "OUTPUT_DIR", default_value = "./output")]
    pub output_dir: PathBuf,

    /// DuckDB file for document status; status tracking is off without it
    #[arg(long, env = "HCC_STATUS_DB")]
    pub status_db: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Queue gateway base URL
    #[arg(long, env = "HCC_BROKER_URL")]
    pub broker_url: String,

    #[arg(long, default_value = "document-events")]
    pub queue: String,

    #[arg(long, default_value = "hcc-extractor")]
    pub exchange: String,

    /// Deliveries before a message is dead-lettered
    #[arg(long, default_value_t = 5)]
    pub max_delivery_attempts: u32,

    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Bound on every gateway request, receive included
    #[arg(long, default_value_t = 30)]
    pub broker_timeout_secs: u64,
}

impl BrokerArgs {
    pub fn apply(&self, config: &mut AnalyzerConfig) -> Result<(), ConfigError> {
        config.runner.max_delivery_attempts = self.max_delivery_attempts;
        config.runner.shutdown_grace = Duration::from_secs(self.shutdown_grace_secs);
        if self.broker_timeout_secs == 0 {
            return Err(ConfigError::Zero("broker timeout"));
        }
        config.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        analyzer: AnalyzerArgs,
        #[command(flatten)]
        broker: BrokerArgs,
    }

    const BASE: &[&str] = &[
        "hccflow",
        "--reference",
        "codes.csv",
        "--escalation-threshold",
        "0.7",
        "--no-match-confidence",
        "0.5",
        "--broker-url",
        "http://localhost:15680",
    ];

    fn parse(extra: &[&str]) -> TestCli {
        let args: Vec<&str> = BASE.iter().chain(extra).copied().collect();
        TestCli::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        let config = cli.analyzer.to_config().unwrap();
        assert_eq!(config.reference_path, PathBuf::from("codes.csv"));
        assert_eq!(config.reference_columns, ReferenceColumns::default());
        assert_eq!(config.escalation.threshold, 0.7);
        assert!(!config.escalation.escalate_all);
        assert_eq!(config.no_match_confidence, 0.5);
        assert_eq!(config.high_confidence_cutoff, 0.9);
        assert!(config.inference.is_none());
        assert_eq!(config.runner.worker_concurrency, 4);
        assert_eq!(cli.broker.queue, "document-events");
        assert_eq!(cli.broker.exchange, "hcc-extractor");
    }

    #[test]
    fn inference_settings() {
        let cli = parse(&[
            "--inference-endpoint",
            "https://api.example.com",
            "--inference-api-key",
            "secret",
            "--inference-model",
            "classifier",
            "--inference-timeout-secs",
            "15",
            "--batch-size",
            "5",
        ]);
        let inference = cli.analyzer.to_config().unwrap().inference.unwrap();
        assert_eq!(inference.endpoint, "https://api.example.com");
        assert_eq!(inference.model, "classifier");
        assert_eq!(inference.timeout, Duration::from_secs(15));
        assert_eq!(inference.batch_size, 5);
        assert_eq!(inference.fallback_confidence, 0.3);
    }

    #[test]
    fn threshold_and_baseline_are_required() {
        let err = TestCli::try_parse_from(["hccflow", "--reference", "codes.csv", "--broker-url", "x"]);
        assert!(err.is_err());
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let cli = parse(&["--escalate-all"]);
        assert!(matches!(
            cli.analyzer.to_config(),
            Err(ConfigError::EscalateAllWithoutInference)
        ));

        let cli = parse(&["--inference-endpoint", "https://api.example.com", "--inference-model", "m"]);
        assert!(matches!(cli.analyzer.to_config(), Err(ConfigError::MissingApiKey)));

        let cli = parse(&["--inference-endpoint", "https://api.example.com", "--inference-api-key", "k"]);
        assert!(matches!(cli.analyzer.to_config(), Err(ConfigError::Other(_))));

        let cli = parse(&["--workers", "0"]);
        assert!(matches!(cli.analyzer.to_config(), Err(ConfigError::Zero(_))));

        let cli = parse(&["--high-confidence", "1.5"]);
        assert!(matches!(
            cli.analyzer.to_config(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn broker_settings_apply_to_runner() {
        let cli = parse(&["--max-delivery-attempts", "2", "--shutdown-grace-secs", "3"]);
        let mut config = cli.analyzer.to_config().unwrap();
        cli.broker.apply(&mut config).unwrap();
        assert_eq!(config.runner.max_delivery_attempts, 2);
        assert_eq!(config.runner.shutdown_grace, Duration::from_secs(3));
        assert_eq!(cli.broker.request_timeout(), Duration::from_secs(30));

        let cli = parse(&["--max-delivery-attempts", "0"]);
        let mut config = cli.analyzer.to_config().unwrap();
        assert!(cli.broker.apply(&mut config).is_err());

        let cli = parse(&["--broker-timeout-secs", "0"]);
        let mut config = cli.analyzer.to_config().unwrap();
        assert!(matches!(cli.broker.apply(&mut config), Err(ConfigError::Zero(_))));
    }
}
