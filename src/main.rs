use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use trade_model_engine::config::{load_config, render_config, EngineConfig};
use trade_model_engine::ml::classifier::ModelTrainer;
use trade_model_engine::ml::cross_validation::{
    cross_validate, time_series_cross_validate, CancellationToken, CrossValidationConfig, CrossValidationResult,
};
use trade_model_engine::ml::ensemble::{
    train_ensemble, train_stacked, EnsembleConfig, EnsembleTrainer, MemberSpec, StackingConfig, StackingTrainer,
};
use trade_model_engine::ml::features::{
    detect_interactions, gbm_importance, low_variance_features, permutation_importance, prune_correlated_features,
    PermutationConfig,
};
use trade_model_engine::ml::gbm::{train_gbm, GbmTrainer};
use trade_model_engine::ml::linear::{train_linear, LinearTrainer};
use trade_model_engine::ml::metrics::{evaluate_classifier, EvaluationMetrics};
use trade_model_engine::ml::pit::{validate_training_examples, EnforcementContext, PitFeatureRegistry};
use trade_model_engine::ml::split::{stratified_split, SplitRatios};
use trade_model_engine::registry::{
    ExperimentFilter, ExperimentStatus, ExperimentTracker, ModelArtifact, ModelRegistry, NewExperiment,
    RegisterRequest, VersionBump,
};
use trade_model_engine::types::{load_examples, positive_rate, TrainingExample};

#[derive(Parser)]
#[command(name = "trade-model-engine")]
#[command(author = "Trading Bot")]
#[command(version = "0.1.0")]
#[command(about = "Train, validate and promote trade-candidate scoring models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "engine.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelKind {
    Linear,
    Gbm,
    Stacked,
    Ensemble,
}

impl ModelKind {
    fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::Gbm => "gbm",
            ModelKind::Stacked => "stacked",
            ModelKind::Ensemble => "ensemble",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model, track the run and optionally register the artifact
    Train {
        /// JSON file of labelled examples
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long, value_enum, default_value = "gbm")]
        model: ModelKind,
        /// Decision date of the batch (YYYY-MM-DD or RFC 3339); required while PIT enforcement is on
        #[arg(long)]
        as_of: Option<String>,
        /// Register the trained model in the registry
        #[arg(long)]
        register: bool,
        /// Version component to bump on registration (major, minor, patch)
        #[arg(long, default_value = "patch")]
        bump: String,
        #[arg(long)]
        tag: Vec<String>,
        #[arg(long)]
        description: Option<String>,
        /// Experiment name (defaults to the model kind)
        #[arg(long)]
        name: Option<String>,
    },
    /// Cross-validate a model type
    Cv {
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long, value_enum, default_value = "gbm")]
        model: ModelKind,
        /// Walk-forward folds instead of stratified k-fold
        #[arg(long)]
        time_series: bool,
        /// Override the configured fold count
        #[arg(long)]
        folds: Option<usize>,
    },
    /// Feature importance, correlation pruning and interaction report
    Features {
        #[arg(short, long)]
        data: PathBuf,
        /// |correlation| above which the weaker feature is dropped
        #[arg(long, default_value = "0.95")]
        correlation_threshold: f64,
        /// Number of interaction pairs to report
        #[arg(long, default_value = "5")]
        interactions: usize,
        /// Also compute permutation importance on the validation slice
        #[arg(long)]
        permutation: bool,
    },
    /// Inspect and manage registered models
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Inspect tracked experiments
    Experiments {
        #[command(subcommand)]
        action: ExperimentAction,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    /// List registered models
    List,
    /// Promote a version to production if it passes the promotion gate
    Promote { version: String },
    /// Restore a previous production model
    Rollback {
        /// Version to restore (defaults to the previous production model)
        #[arg(long)]
        to: Option<String>,
    },
    /// Compare two versions
    Compare { v1: String, v2: String },
}

#[derive(Subcommand)]
enum ExperimentAction {
    /// List experiments, newest first
    List {
        #[arg(long = "type")]
        experiment_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one experiment as JSON
    Show { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if cli.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let config = load_config(Some(cli.config.as_path())).context("loading configuration")?;

    match cli.command {
        Commands::Train { data, model, as_of, register, bump, tag, description, name } => {
            let options = TrainOptions {
                as_of,
                register,
                bump: bump.parse::<VersionBump>()?,
                tags: tag,
                description,
                name,
            };
            run_train(&config, &data, model, options)?;
        }
        Commands::Cv { data, model, time_series, folds } => {
            run_cv(&config, &data, model, time_series, folds)?;
        }
        Commands::Features { data, correlation_threshold, interactions, permutation } => {
            run_features(&config, &data, correlation_threshold, interactions, permutation)?;
        }
        Commands::Registry { action } => run_registry(&config, action)?,
        Commands::Experiments { action } => run_experiments(&config, action)?,
        Commands::Config { action: ConfigAction::Show } => {
            println!("{}", render_config(&config)?);
        }
    }

    Ok(())
}

struct TrainOptions {
    as_of: Option<String>,
    register: bool,
    bump: VersionBump,
    tags: Vec<String>,
    description: Option<String>,
    name: Option<String>,
}

fn parse_as_of(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid as-of date: {}", raw))?;
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("invalid as-of date: {}", raw))
}

fn stacking_config(config: &EngineConfig) -> StackingConfig {
    StackingConfig {
        linear: config.training.linear.clone(),
        gbm: config.training.seeded_gbm(),
        ..Default::default()
    }
}

fn ensemble_config(config: &EngineConfig) -> EnsembleConfig {
    EnsembleConfig {
        base_seed: config.training.seed,
        member: MemberSpec::Gbm(config.training.gbm.clone()),
        ..Default::default()
    }
}

fn fit_artifact(
    config: &EngineConfig,
    kind: ModelKind,
    train: &[TrainingExample],
    validation: &[TrainingExample],
) -> trade_model_engine::Result<ModelArtifact> {
    let artifact = match kind {
        ModelKind::Linear => ModelArtifact::Linear(train_linear(train, &config.training.linear)?),
        ModelKind::Gbm => ModelArtifact::Gbm(train_gbm(train, validation, &config.training.seeded_gbm())?),
        ModelKind::Stacked => ModelArtifact::Stacked(train_stacked(train, validation, &stacking_config(config))?.model),
        ModelKind::Ensemble => {
            let combined: Vec<TrainingExample> = train.iter().chain(validation.iter()).cloned().collect();
            ModelArtifact::Ensemble(train_ensemble(&combined, &ensemble_config(config))?.model)
        }
    };
    Ok(artifact)
}

fn metrics_map(metrics: &EvaluationMetrics) -> BTreeMap<String, f64> {
    EvaluationMetrics::NAMES
        .iter()
        .chain(std::iter::once(&"log_loss"))
        .filter_map(|name| metrics.get(name).map(|v| (name.to_string(), v)))
        .collect()
}

fn print_metrics(title: &str, m: &EvaluationMetrics) {
    println!("\n=== {} ===", title);
    println!("Samples:           {}", m.samples);
    println!("AUC:               {:.4}", m.auc);
    println!("Accuracy:          {:.2}%", m.accuracy * 100.0);
    println!("Precision:         {:.2}%", m.precision * 100.0);
    println!("Recall:            {:.2}%", m.recall * 100.0);
    println!("F1:                {:.4}", m.f1);
    println!("Calibration error: {:.4}", m.calibration_error);
    println!("Log loss:          {:.4}", m.log_loss);
}

fn run_train(config: &EngineConfig, data: &Path, kind: ModelKind, options: TrainOptions) -> Result<()> {
    let examples = load_examples(data)?;
    let as_of = options.as_of.as_deref().map(parse_as_of).transpose()?;

    let mut pit = EnforcementContext::new(config.pit.enforcement_enabled);
    validate_training_examples(&mut pit, &PitFeatureRegistry::new(), &examples, as_of)
        .context("point-in-time check failed")?;

    let seed = config.training.seed;
    let split = stratified_split(&examples, SplitRatios::new(0.7, 0.15, 0.15), seed)?;
    info!(
        "Training {} on {} examples ({:.1}% positive), {} validation, {} test",
        kind.as_str(),
        split.train.len(),
        positive_rate(&split.train) * 100.0,
        split.validation.len(),
        split.test.len()
    );

    let tracker = ExperimentTracker::open(&config.paths.store_root)?;
    let request = NewExperiment::new(
        options.name.clone().unwrap_or_else(|| kind.as_str().to_string()),
        kind.as_str(),
        serde_json::to_value(&config.training)?,
    )
    .with_tags(options.tags.clone());
    let experiment = tracker.create_experiment(request)?;

    let artifact = match fit_artifact(config, kind, &split.train, &split.validation) {
        Ok(artifact) => artifact,
        Err(e) => {
            tracker.fail_experiment(&experiment.id, &e.to_string())?;
            return Err(e.into());
        }
    };

    let validation_metrics = evaluate_classifier(&artifact, &split.validation);
    let test_metrics = evaluate_classifier(&artifact, &split.test);
    let val_metrics: BTreeMap<String, f64> = metrics_map(&validation_metrics)
        .into_iter()
        .map(|(k, v)| (format!("val_{}", k), v))
        .collect();
    tracker.log_metrics(&experiment.id, &val_metrics)?;

    let registered = if options.register {
        let registry = ModelRegistry::open(&config.paths.store_root)?;
        let mut request = RegisterRequest::new(artifact, test_metrics);
        request.bump = options.bump;
        request.tags = options.tags;
        request.description = options.description;
        match registry.register_model(request) {
            Ok(record) => Some(record.version),
            Err(e) => {
                tracker.fail_experiment(&experiment.id, &format!("registration failed: {}", e))?;
                return Err(e.into());
            }
        }
    } else {
        None
    };
    tracker.complete_experiment(&experiment.id, &metrics_map(&test_metrics), registered)?;

    print_metrics("Validation", &validation_metrics);
    print_metrics("Test", &test_metrics);
    println!("\nExperiment: {}", experiment.id);
    if let Some(version) = registered {
        println!("Registered:  {}", version);
    }
    Ok(())
}

fn cross_validate_with<T: ModelTrainer>(
    examples: &[TrainingExample],
    trainer: &T,
    cv: &CrossValidationConfig,
    time_series: bool,
) -> trade_model_engine::Result<CrossValidationResult> {
    let cancel = CancellationToken::new();
    if time_series {
        time_series_cross_validate(examples, trainer, cv, &cancel)
    } else {
        cross_validate(examples, trainer, cv, &cancel)
    }
}

fn run_cv(config: &EngineConfig, data: &Path, kind: ModelKind, time_series: bool, folds: Option<usize>) -> Result<()> {
    let examples = load_examples(data)?;
    let cv = CrossValidationConfig {
        folds: folds.unwrap_or(config.training.cv_folds),
        seed: config.training.seed,
        min_train_fraction: config.training.min_train_fraction,
        ..Default::default()
    };

    let result = match kind {
        ModelKind::Linear => cross_validate_with(
            &examples,
            &LinearTrainer::new(config.training.linear.clone()),
            &cv,
            time_series,
        )?,
        ModelKind::Gbm => cross_validate_with(&examples, &GbmTrainer::new(config.training.seeded_gbm()), &cv, time_series)?,
        ModelKind::Stacked => {
            cross_validate_with(&examples, &StackingTrainer::new(stacking_config(config)), &cv, time_series)?
        }
        ModelKind::Ensemble => {
            cross_validate_with(&examples, &EnsembleTrainer::new(ensemble_config(config)), &cv, time_series)?
        }
    };

    println!(
        "\n=== {} cross-validation ({} folds, {}) ===",
        result.trainer,
        result.folds.len(),
        if time_series { "walk-forward" } else { "stratified" }
    );
    for fold in &result.folds {
        println!(
            "Fold {}: train {:>5}  holdout {:>5}  val {:>5}  auc {:.4}",
            fold.index, fold.train_size, fold.holdout_size, fold.validation_size, fold.metrics.auc
        );
    }
    println!();
    for (name, s) in &result.summary {
        println!(
            "{:<18} mean {:.4}  std {:.4}  min {:.4}  max {:.4}  95% CI [{:.4}, {:.4}]",
            name, s.mean, s.std, s.min, s.max, s.ci95.0, s.ci95.1
        );
    }
    println!("\nStability: {}", result.stability);
    Ok(())
}

fn run_features(
    config: &EngineConfig,
    data: &Path,
    correlation_threshold: f64,
    top_interactions: usize,
    permutation: bool,
) -> Result<()> {
    let examples = load_examples(data)?;
    let split = stratified_split(&examples, SplitRatios::new(0.8, 0.2, 0.0), config.training.seed)?;
    let model = train_gbm(&split.train, &split.validation, &config.training.seeded_gbm())?;

    let ranking = gbm_importance(&model);
    println!("\n=== GBM importance ===");
    for f in &ranking {
        println!("{:<24} {:.4}", f.feature, f.importance);
    }

    if permutation {
        let perm = permutation_importance(
            &model,
            &split.validation,
            &PermutationConfig {
                seed: config.training.seed,
                ..Default::default()
            },
            &CancellationToken::new(),
        )?;
        println!("\n=== Permutation importance (AUC drop) ===");
        for p in &perm {
            println!("{:<24} {:+.4} ± {:.4}", p.feature, p.mean_drop, p.std_drop);
        }
    }

    let pruned = prune_correlated_features(&examples, correlation_threshold, &ranking)?;
    println!("\n=== Correlation pruning (|r| > {:.2}) ===", correlation_threshold);
    for (dropped, kept, r) in &pruned.dropped {
        println!("drop {:<20} keeps {:<20} r={:+.3}", dropped, kept, r);
    }
    println!("kept {} features", pruned.kept.len());

    let flat = low_variance_features(&examples, 1e-8)?;
    if !flat.is_empty() {
        warn!("Zero-variance features: {}", flat.join(", "));
    }

    println!("\n=== Interactions ===");
    for pair in detect_interactions(&model, top_interactions) {
        println!("{} x {}: {:.4}", pair.first, pair.second, pair.strength);
    }
    Ok(())
}

fn run_registry(config: &EngineConfig, action: RegistryAction) -> Result<()> {
    let registry = ModelRegistry::open(&config.paths.store_root)?;
    match action {
        RegistryAction::List => {
            let models = registry.list_models()?;
            if models.is_empty() {
                println!("No registered models");
            }
            for m in models {
                println!(
                    "{:<10} {:<20} {:<10} auc {:.4}  cal {:.4}  {}{}",
                    m.version.to_string(),
                    m.model_type.to_string(),
                    format!("{:?}", m.status).to_lowercase(),
                    m.validation_metrics.auc,
                    m.validation_metrics.calibration_error,
                    m.registered_at.format("%Y-%m-%d %H:%M"),
                    if m.is_production { "  *" } else { "" }
                );
            }
        }
        RegistryAction::Promote { version } => {
            let result = registry.promote_to_production(&version, &config.promotion)?;
            if result.success {
                println!("Promoted {} to production", result.version);
            } else {
                println!(
                    "Promotion of {} rejected: {}",
                    result.version,
                    result.reason.unwrap_or_default()
                );
            }
        }
        RegistryAction::Rollback { to } => {
            let result = registry.rollback_model(to.as_deref())?;
            match result.restored_version {
                Some(v) if result.success => println!("Production restored to {}", v),
                _ => println!("Rollback failed: {}", result.reason.unwrap_or_default()),
            }
        }
        RegistryAction::Compare { v1, v2 } => match registry.compare_models(&v1, &v2)? {
            Some(c) => {
                println!("\n=== {} -> {} ===", c.v1, c.v2);
                println!("AUC:               {:+.4}", c.auc_delta);
                println!("Accuracy:          {:+.4}", c.accuracy_delta);
                println!("F1:                {:+.4}", c.f1_delta);
                println!("Calibration error: {:+.4}", c.calibration_delta);
                println!("Recommendation:    {}", serde_json::to_string(&c.recommendation)?.trim_matches('"'));
            }
            None => println!("Unknown version: {} or {}", v1, v2),
        },
    }
    Ok(())
}

fn run_experiments(config: &EngineConfig, action: ExperimentAction) -> Result<()> {
    let tracker = ExperimentTracker::open(&config.paths.store_root)?;
    match action {
        ExperimentAction::List { experiment_type, status, limit } => {
            let status = status
                .map(|s| serde_json::from_value::<ExperimentStatus>(serde_json::Value::String(s.clone())))
                .transpose()
                .map_err(|_| anyhow!("unknown experiment status"))?;
            let filter = ExperimentFilter {
                experiment_type,
                status,
                tag: None,
                limit,
            };
            for e in tracker.list_experiments(&filter)? {
                println!(
                    "{}  {:<10} {:<10} {:<16} auc {}",
                    e.id,
                    e.experiment_type,
                    e.status,
                    e.created_at.format("%Y-%m-%d %H:%M"),
                    e.metric("auc").map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string())
                );
            }
        }
        ExperimentAction::Show { id } => match tracker.get_experiment(&id)? {
            Some(e) => println!("{}", serde_json::to_string_pretty(&e)?),
            None => println!("Experiment {} not found", id),
        },
    }
    Ok(())
}
