// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use blood_atlas::config::{
    EstimatorConfig, FlaggedGenePolicy, MixedModelConfig, StabilityConfig, ThresholdScanConfig,
    WarningPolicy,
};
use blood_atlas::{
    annotations::SampleAnnotations, integrate, io, matrix::ExpressionMatrix, platform, resample,
    select_platform_independent, selection, simulate, threshold_scan,
};
use clap::Parser;
use log::{debug, info, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting blood_atlas with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    match &cli_args.command {
        cli::Command::PlatformDependence(args) => run_platform_dependence(args)?,
        cli::Command::Filter(args) => run_filter(args)?,
        cli::Command::ThresholdScan(args) => run_threshold_scan(args)?,
        cli::Command::Stability(args) => run_stability(args)?,
        cli::Command::Integrate(args) => run_integrate(args)?,
        cli::Command::Simulate(args) => run_simulate(args)?,
    }

    info!(
        "blood_atlas finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Subcommands ---

fn load_inputs(input: &cli::InputArgs) -> Result<(ExpressionMatrix, SampleAnnotations)> {
    info!("Reading expression table {}", input.expression.display());
    let expression = io::read_expression(&input.expression)
        .map_err(|e| anyhow!("Failed to read expression table {}: {}", input.expression.display(), e))?;
    info!("Reading sample annotations {}", input.annotations.display());
    let annotations = io::read_annotations(&input.annotations)
        .map_err(|e| anyhow!("Failed to read annotations {}: {}", input.annotations.display(), e))?;
    info!(
        "Loaded {} genes x {} samples; {} annotated samples.",
        expression.n_genes(),
        expression.n_samples(),
        annotations.len()
    );
    Ok((expression, annotations))
}

fn estimator_config(model: &cli::ModelArgs) -> EstimatorConfig {
    EstimatorConfig {
        mixed_model: MixedModelConfig {
            tolerance: model.tolerance,
            max_iterations: model.max_iterations,
            warning_policy: if model.log_convergence_warnings {
                WarningPolicy::Log
            } else {
                WarningPolicy::Ignore
            },
            ..Default::default()
        },
        min_samples_per_platform: model.min_samples_per_platform,
        show_progress: !model.no_progress,
    }
}

fn flagged_policy(model: &cli::ModelArgs) -> FlaggedGenePolicy {
    if model.exclude_flagged {
        FlaggedGenePolicy::Exclude
    } else {
        FlaggedGenePolicy::Keep
    }
}

fn run_platform_dependence(args: &cli::PlatformDependenceArgs) -> Result<()> {
    let (expression, annotations) = load_inputs(&args.input)?;
    let table = platform::calculate_platform_dependence(&expression, &annotations, &estimator_config(&args.model))?;
    output_writer::prepare_prefix(&args.output_prefix)?;
    output_writer::write_var_fraction(&args.output_prefix, &table)
}

fn run_filter(args: &cli::FilterArgs) -> Result<()> {
    blood_atlas::config::validate_threshold(args.threshold)?;
    let (expression, annotations) = load_inputs(&args.input)?;
    let table = platform::calculate_platform_dependence(&expression, &annotations, &estimator_config(&args.model))?;
    let selected = select_platform_independent(&table, args.threshold, flagged_policy(&args.model));
    info!(
        "{} of {} genes have a platform variance fraction <= {}.",
        selected.len(),
        table.len(),
        args.threshold
    );
    output_writer::prepare_prefix(&args.output_prefix)?;
    output_writer::write_var_fraction(&args.output_prefix, &table)?;
    output_writer::write_gene_selection(&args.output_prefix, &table, &selected)
}

fn run_threshold_scan(args: &cli::ThresholdScanArgs) -> Result<()> {
    let (expression, annotations) = load_inputs(&args.input)?;
    let table = platform::calculate_platform_dependence(&expression, &annotations, &estimator_config(&args.model))?;
    let config = ThresholdScanConfig {
        n_pca_components: args.components,
        flagged_gene_policy: flagged_policy(&args.model),
        ..Default::default()
    };
    let rows = threshold_scan::scan_thresholds(&expression, &annotations, &table, &config)?;
    output_writer::prepare_prefix(&args.output_prefix)?;
    output_writer::write_threshold_scan(&args.output_prefix, &rows)
}

fn run_stability(args: &cli::StabilityArgs) -> Result<()> {
    let (expression, annotations) = load_inputs(&args.input)?;
    let config = StabilityConfig {
        resample_strategy: args.strategy.into(),
        n_resamples: args.resamples,
        n_clusters_list: args.clusters.clone(),
        platform_variance_threshold: args.threshold,
        n_pca_components: args.components,
        seed: args.seed,
        flagged_gene_policy: flagged_policy(&args.model),
        parallel_iterations: args.parallel_iterations,
        estimator: estimator_config(&args.model),
    };
    let report = resample::resample_clustering(&expression, &annotations, &config)?;

    for stability in &report.per_k {
        if stability.scores.is_empty() {
            continue;
        }
        let n = stability.scores.len() as f64;
        let mean = stability.scores.iter().sum::<f64>() / n;
        let min = stability.scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = stability.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        info!(
            "k = {}: {} clusters, mean H-index {:.3}, min {:.2}, max {:.2}",
            stability.n_clusters,
            stability.scores.len(),
            mean,
            min,
            max
        );
    }

    output_writer::prepare_prefix(&args.output_prefix)?;
    output_writer::write_h_index(&args.output_prefix, &report)?;
    output_writer::write_retained_genes(&args.output_prefix, &report)?;
    if args.json {
        output_writer::write_report_json(&args.output_prefix, &report)?;
    }
    Ok(())
}

fn run_integrate(args: &cli::IntegrateArgs) -> Result<()> {
    let selector = if args.select_blood_cells || !args.patterns.is_empty() {
        if args.annotations.is_empty() {
            return Err(anyhow!("Sample selection needs --annotations"));
        }
        let selector = if args.patterns.is_empty() {
            selection::SampleSelector::blood_cells()?
        } else {
            selection::SampleSelector::new(args.patterns.as_slice())?
        };
        Some(if args.match_columns.is_empty() {
            selector
        } else {
            selector.with_columns(args.match_columns.clone())
        })
    } else {
        None
    };

    let mapping = match &args.probe_mapping {
        Some(path) => Some(io::read_probe_mapping(path)?),
        None => None,
    };
    let tables = io::load_datasets(&args.dir, &args.datasets, mapping.as_ref())?;
    if tables.is_empty() {
        return Err(anyhow!("No dataset could be loaded from {}", args.dir.display()));
    }
    // keep the command-line order, not the map order
    let ordered: Vec<&integrate::RawExpressionTable> =
        args.datasets.iter().filter_map(|id| tables.get(id)).collect();
    let genes = integrate::common_genes(&ordered);
    if genes.is_empty() {
        warn!("The loaded datasets share no gene ids.");
    }
    let mut merged = integrate::merge_columns(&ordered, &genes)?;

    let merged_annotations = if args.annotations.is_empty() {
        None
    } else {
        let loaded = args
            .annotations
            .iter()
            .map(|p| io::read_annotations(p))
            .collect::<blood_atlas::Result<Vec<_>>>()?;
        Some(integrate::merge_annotations(&loaded.iter().collect::<Vec<_>>())?)
    };

    output_writer::prepare_prefix(&args.output_prefix)?;
    let merged_annotations = match (merged_annotations, &selector) {
        (Some(annotations), Some(selector)) => {
            output_writer::write_match_report(&args.output_prefix, &selector.match_report(&annotations))?;
            let selected = selector.select(&annotations)?;
            let keep: Vec<String> = merged
                .sample_ids()
                .iter()
                .filter(|s| selected.get(s).is_some())
                .cloned()
                .collect();
            info!(
                "Keeping {} of {} integrated samples after selection.",
                keep.len(),
                merged.n_samples()
            );
            merged = merged.select_samples(&keep)?;
            Some(selected)
        }
        (annotations, _) => annotations,
    };
    if args.percentile {
        merged = blood_atlas::transform_to_percentile(&merged);
    }

    let path = output_writer::output_path(&args.output_prefix, "expression.tsv");
    info!("Writing integrated expression to {}", path.display());
    io::write_expression(&path, &merged)?;

    if let Some(annotations) = merged_annotations {
        let path = output_writer::output_path(&args.output_prefix, "samples.tsv");
        info!(
            "Writing {} merged sample annotations to {}",
            annotations.len(),
            path.display()
        );
        io::write_annotations(&path, &annotations)?;
    }
    Ok(())
}

fn run_simulate(args: &cli::SimulateArgs) -> Result<()> {
    let config = simulate::SimulationConfig {
        n_platforms: args.platforms,
        samples_per_platform: args.samples_per_platform,
        n_platform_genes: args.platform_genes,
        n_biological_genes: args.biological_genes,
        n_groups: args.groups,
        platform_effect: args.platform_effect,
        group_effect: args.group_effect,
        noise_sd: args.noise_sd,
        seed: args.seed,
    };
    let sim = simulate::simulate_atlas(&config)?;
    output_writer::prepare_prefix(&args.output_prefix)?;
    io::write_expression(&output_writer::output_path(&args.output_prefix, "expression.tsv"), &sim.expression)?;
    io::write_annotations(&output_writer::output_path(&args.output_prefix, "samples.tsv"), &sim.annotations)?;
    debug!("Simulated group sizes: {:?}", {
        let mut sizes = vec![0usize; config.n_groups];
        for &g in &sim.groups {
            sizes[g] += 1;
        }
        sizes
    });
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use blood_atlas::config::{ResampleStrategy, RESAMPLING_VARIANCE_THRESHOLD};
    use clap::{Args, Parser, Subcommand, ValueEnum};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Platform-independent gene filtering and clustering stability for expression atlases.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Per-gene platform variance fraction.
        PlatformDependence(PlatformDependenceArgs),
        /// Select platform-independent genes.
        Filter(FilterArgs),
        /// Kruskal-Wallis scan of candidate thresholds.
        ThresholdScan(ThresholdScanArgs),
        /// Bootstrap / jackknife clustering stability (H-index).
        Stability(StabilityArgs),
        /// Merge per-dataset expression tables on their common genes.
        Integrate(IntegrateArgs),
        /// Write a synthetic atlas.
        Simulate(SimulateArgs),
    }

    #[derive(Args, Debug)]
    pub(crate) struct InputArgs {
        #[arg(short = 'e', long, required = true)]
        pub(crate) expression: PathBuf,

        #[arg(short = 'a', long, required = true)]
        pub(crate) annotations: PathBuf,
    }

    #[derive(Args, Debug)]
    pub(crate) struct ModelArgs {
        #[arg(long, default_value_t = 1e-6)]
        pub(crate) tolerance: f64,

        #[arg(long, default_value_t = 200)]
        pub(crate) max_iterations: usize,

        #[arg(long, default_value_t = 2)]
        pub(crate) min_samples_per_platform: usize,

        /// Log every convergence warning instead of only counting them.
        #[arg(long)]
        pub(crate) log_convergence_warnings: bool,

        /// Genes whose fit carried a convergence warning never pass the filter.
        #[arg(long)]
        pub(crate) exclude_flagged: bool,

        #[arg(long)]
        pub(crate) no_progress: bool,
    }

    #[derive(Args, Debug)]
    pub(crate) struct PlatformDependenceArgs {
        #[command(flatten)]
        pub(crate) input: InputArgs,

        #[command(flatten)]
        pub(crate) model: ModelArgs,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,
    }

    #[derive(Args, Debug)]
    pub(crate) struct FilterArgs {
        #[command(flatten)]
        pub(crate) input: InputArgs,

        #[command(flatten)]
        pub(crate) model: ModelArgs,

        #[arg(long, default_value_t = blood_atlas::ATLAS_VARIANCE_THRESHOLD)]
        pub(crate) threshold: f64,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,
    }

    #[derive(Args, Debug)]
    pub(crate) struct ThresholdScanArgs {
        #[command(flatten)]
        pub(crate) input: InputArgs,

        #[command(flatten)]
        pub(crate) model: ModelArgs,

        #[arg(short = 'k', long, default_value_t = 10)]
        pub(crate) components: usize,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,
    }

    #[derive(ValueEnum, Clone, Copy, Debug)]
    pub(crate) enum StrategyArg {
        Bootstrap,
        Jackknife,
    }

    impl From<StrategyArg> for ResampleStrategy {
        fn from(arg: StrategyArg) -> Self {
            match arg {
                StrategyArg::Bootstrap => ResampleStrategy::Bootstrap,
                StrategyArg::Jackknife => ResampleStrategy::Jackknife,
            }
        }
    }

    #[derive(Args, Debug)]
    pub(crate) struct StabilityArgs {
        #[command(flatten)]
        pub(crate) input: InputArgs,

        #[command(flatten)]
        pub(crate) model: ModelArgs,

        #[arg(short = 's', long, value_enum, default_value_t = StrategyArg::Jackknife)]
        pub(crate) strategy: StrategyArg,

        /// Bootstrap iterations (the jackknife runs once per dataset).
        #[arg(short = 'n', long, default_value_t = 10)]
        pub(crate) resamples: usize,

        #[arg(short = 'c', long, value_delimiter = ',', default_value = "3,4")]
        pub(crate) clusters: Vec<usize>,

        #[arg(long, default_value_t = RESAMPLING_VARIANCE_THRESHOLD)]
        pub(crate) threshold: f64,

        #[arg(short = 'k', long, default_value_t = 3)]
        pub(crate) components: usize,

        #[arg(long)]
        pub(crate) seed: Option<u64>,

        #[arg(long)]
        pub(crate) parallel_iterations: bool,

        /// Also write the full report, collections included, as JSON.
        #[arg(long)]
        pub(crate) json: bool,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,
    }

    #[derive(Args, Debug)]
    pub(crate) struct IntegrateArgs {
        #[arg(short = 'd', long, required = true)]
        pub(crate) dir: PathBuf,

        #[arg(long, value_delimiter = ',', required = true)]
        pub(crate) datasets: Vec<String>,

        /// Probe -> gene table applied to every loaded dataset.
        #[arg(long)]
        pub(crate) probe_mapping: Option<PathBuf>,

        /// Sample annotation tables to merge alongside.
        #[arg(long, value_delimiter = ',')]
        pub(crate) annotations: Vec<PathBuf>,

        /// Rank-transform the merged table before writing it.
        #[arg(long)]
        pub(crate) percentile: bool,

        /// Keep only samples whose annotations match the built-in blood cell-type patterns.
        #[arg(long)]
        pub(crate) select_blood_cells: bool,

        /// Custom sample selection patterns (regular expressions), replacing the built-in ones.
        #[arg(long, value_delimiter = ',')]
        pub(crate) patterns: Vec<String>,

        /// Annotation columns searched by the selection patterns (default: all).
        #[arg(long, value_delimiter = ',')]
        pub(crate) match_columns: Vec<String>,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,
    }

    #[derive(Args, Debug)]
    pub(crate) struct SimulateArgs {
        #[arg(long, default_value_t = 3)]
        pub(crate) platforms: usize,

        #[arg(long, default_value_t = 20)]
        pub(crate) samples_per_platform: usize,

        #[arg(long, default_value_t = 30)]
        pub(crate) platform_genes: usize,

        #[arg(long, default_value_t = 70)]
        pub(crate) biological_genes: usize,

        #[arg(long, default_value_t = 3)]
        pub(crate) groups: usize,

        #[arg(long, default_value_t = 4.0)]
        pub(crate) platform_effect: f64,

        #[arg(long, default_value_t = 3.0)]
        pub(crate) group_effect: f64,

        #[arg(long, default_value_t = 0.5)]
        pub(crate) noise_sd: f64,

        #[arg(long, default_value_t = 42)]
        pub(crate) seed: u64,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,
    }
}

mod output_writer {
    use super::{anyhow, info, BufWriter, File, Path, PathBuf, Result, Write};
    use blood_atlas::platform::{GeneFitOutcome, VarianceFractionTable};
    use blood_atlas::resample::StabilityReport;
    use blood_atlas::threshold_scan::ThresholdScanRow;
    use std::collections::{BTreeMap, BTreeSet, HashSet};

    pub(crate) fn output_path(prefix: &str, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}.{}", prefix, suffix))
    }

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = output_path(prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename.display(), e))
    }

    pub(crate) fn prepare_prefix(prefix: &str) -> Result<()> {
        let output_prefix_path = Path::new(prefix);
        if let Some(parent) = output_prefix_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("Failed to create output directory {}: {}", parent.display(), e)
                })?;
                info!("Created output directory: {}", parent.display());
            }
        }
        Ok(())
    }

    pub(crate) fn write_var_fraction(prefix: &str, table: &VarianceFractionTable) -> Result<()> {
        let mut writer = create_output_file(prefix, "var_fraction.tsv")?;
        info!("Writing variance fractions to {}.var_fraction.tsv", prefix);

        writeln!(writer, "gene\tVarFraction\tstatus")?;
        for (gene, outcome) in table.iter() {
            match outcome {
                GeneFitOutcome::Fitted { fraction, warning } => {
                    let status = warning.map_or_else(|| "ok".to_string(), |w| w.to_string());
                    writeln!(writer, "{}\t{:.6}\t{}", gene, fraction, status)?;
                }
                GeneFitOutcome::Failed { reason } => {
                    writeln!(writer, "{}\tNA\tfailed: {}", gene, reason)?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_gene_selection(
        prefix: &str,
        table: &VarianceFractionTable,
        selected: &[String],
    ) -> Result<()> {
        let mut writer = create_output_file(prefix, "genes.tsv")?;
        info!("Writing gene inclusion to {}.genes.tsv", prefix);

        let selected: HashSet<&str> = selected.iter().map(String::as_str).collect();
        writeln!(writer, "gene\tinclusion")?;
        for (gene, _) in table.iter() {
            writeln!(writer, "{}\t{}", gene, selected.contains(gene))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_threshold_scan(prefix: &str, rows: &[ThresholdScanRow]) -> Result<()> {
        if rows.is_empty() {
            info!("No threshold kept enough genes; nothing to write.");
            return Ok(());
        }
        let mut writer = create_output_file(prefix, "threshold_scan.tsv")?;
        info!("Writing threshold scan to {}.threshold_scan.tsv", prefix);

        let n_components = rows.iter().map(|r| r.tests.len()).max().unwrap_or(0);
        write!(writer, "threshold\tn_genes")?;
        for i in 1..=n_components {
            write!(writer, "\tPC{}_H", i)?;
        }
        for i in 1..=n_components {
            write!(writer, "\tPC{}_p", i)?;
        }
        writeln!(writer)?;

        for row in rows {
            write!(writer, "{:.2}\t{}", row.threshold, row.n_genes)?;
            for i in 0..n_components {
                match row.tests.get(i) {
                    Some(t) => write!(writer, "\t{:.6}", t.statistic)?,
                    None => write!(writer, "\tNA")?,
                }
            }
            for i in 0..n_components {
                match row.tests.get(i) {
                    Some(t) => write!(writer, "\t{:.6e}", t.p_value)?,
                    None => write!(writer, "\tNA")?,
                }
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_h_index(prefix: &str, report: &StabilityReport) -> Result<()> {
        let mut writer = create_output_file(prefix, "h_index.tsv")?;
        info!("Writing H-index scores to {}.h_index.tsv", prefix);

        writeln!(writer, "n_clusters\tcluster\tsize\tH_index")?;
        for stability in &report.per_k {
            let base = &stability.collection.base;
            for (i, (label, score)) in base
                .labels_in_order()
                .into_iter()
                .zip(&stability.scores)
                .enumerate()
            {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{:.3}",
                    stability.n_clusters,
                    i + 1,
                    base.members(label).len(),
                    score
                )?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_retained_genes(prefix: &str, report: &StabilityReport) -> Result<()> {
        let mut writer = create_output_file(prefix, "retained_genes.tsv")?;
        info!("Writing retained genes per iteration to {}.retained_genes.tsv", prefix);

        writeln!(writer, "iteration\tgene")?;
        for (iteration, genes) in report.retained_genes.iter().enumerate() {
            for gene in genes {
                writeln!(writer, "{}\t{}", iteration, gene)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_match_report(
        prefix: &str,
        report: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<()> {
        let mut writer = create_output_file(prefix, "matches.tsv")?;
        info!("Writing pattern matches to {}.matches.tsv", prefix);

        writeln!(writer, "pattern\tmatched_value")?;
        for (pattern, values) in report {
            for value in values {
                writeln!(writer, "{}\t{}", pattern, value)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_report_json(prefix: &str, report: &StabilityReport) -> Result<()> {
        let writer = create_output_file(prefix, "report.json")?;
        info!("Writing full stability report to {}.report.json", prefix);
        serde_json::to_writer_pretty(writer, report)
            .map_err(|e| anyhow!("Failed to serialise stability report: {}", e))
    }
}
