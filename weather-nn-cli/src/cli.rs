use std::{fs, path::PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use weather_nn_core::{
    PipelineConfig, QuantizedModel,
    curves::render_accuracy_chart,
    export::QuantLayer,
    pipeline::{self, PipelineReport},
};

/// Width and height of the accuracy chart in characters.
const CHART_SIZE: (usize, usize) = (60, 12);

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(
    name = "weather-nn",
    version,
    about = "Train a weather condition classifier and export it as an int8 model"
)]
pub struct Cli {
    /// Log debug output (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load data, train, and export the quantized model.
    Train {
        /// Config file; defaults to the platform config file if present.
        #[arg(long)]
        config: Option<PathBuf>,

        /// CSV with hourly observations.
        #[arg(long)]
        data: Option<PathBuf>,

        /// Where to write the quantized model.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of past rows per sample.
        #[arg(long)]
        window: Option<usize>,

        #[arg(long)]
        epochs: Option<usize>,

        /// Split rows chronologically and fit the scaler on training rows only.
        #[arg(long)]
        strict: bool,

        /// Skip the accuracy chart.
        #[arg(long)]
        no_plot: bool,

        /// Also write the model as a C array.
        #[arg(long, value_name = "PATH")]
        c_header: Option<PathBuf>,

        /// Write per-epoch metrics as JSON.
        #[arg(long, value_name = "PATH")]
        history: Option<PathBuf>,
    },

    /// Print the layers and quantization parameters of a model file.
    Inspect {
        /// Path to a `.wxq` model.
        artifact: PathBuf,
    },

    /// Show the effective configuration or write it to the config file.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Only print the config file location.
        #[arg(long)]
        path: bool,

        /// Save the effective configuration to the config file.
        #[arg(long)]
        write: bool,
    },
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Train {
                config,
                data,
                output,
                window,
                epochs,
                strict,
                no_plot,
                c_header,
                history,
            } => {
                let mut cfg = PipelineConfig::load(config.as_deref())?;
                if let Some(data) = data {
                    cfg.data.path = data;
                }
                if let Some(output) = output {
                    cfg.export.model_path = output;
                }
                if let Some(window) = window {
                    cfg.data.window_size = window;
                }
                if let Some(epochs) = epochs {
                    cfg.train.epochs = epochs;
                }
                if strict {
                    cfg.train.strict_split = true;
                }
                if c_header.is_some() {
                    cfg.export.c_header_path = c_header;
                }
                if history.is_some() {
                    cfg.train.history_path = history;
                }

                debug!(?cfg, "effective configuration");
                let report = pipeline::run(&cfg)?;
                print_report(&report, !no_plot);
            }
            Command::Inspect { artifact } => {
                let bytes = fs::read(&artifact)
                    .with_context(|| format!("Failed to read model file: {}", artifact.display()))?;
                let model = QuantizedModel::from_bytes(&bytes).with_context(|| {
                    format!("Failed to parse model file: {}", artifact.display())
                })?;
                print_model(&model, bytes.len());
            }
            Command::Config {
                config,
                path,
                write,
            } => {
                let file = match &config {
                    Some(path) => path.clone(),
                    None => PipelineConfig::config_file_path()?,
                };
                if path {
                    println!("{}", file.display());
                    return Ok(());
                }

                let cfg = PipelineConfig::load(config.as_deref())?;
                if write {
                    if let Err(err) = cfg.validate() {
                        bail!("Refusing to write invalid configuration: {err}");
                    }
                    cfg.save(&file)?;
                    println!("Configuration written to {}", file.display());
                } else {
                    print!("{}", cfg.to_toml()?);
                }
            }
        }

        Ok(())
    }
}

fn print_report(report: &PipelineReport, plot: bool) {
    println!("Weather code mapping:");
    print!("{}", report.mapping.render_table());
    println!(
        "Rows: {} (dropped {}), features: {}",
        report.rows,
        report.dropped_rows,
        report.feature_names.join(", ")
    );
    println!(
        "Samples: {} train / {} validation, {} parameters",
        report.train_samples, report.validation_samples, report.num_parameters
    );

    let history = &report.history;
    println!(
        "Trained {} epochs{}, best epoch {}",
        history.epochs.len(),
        if history.stopped_early {
            " (stopped early)"
        } else {
            ""
        },
        history.best_epoch
    );
    println!("Validation loss: {:.4}", report.evaluation.loss);
    println!("Validation accuracy: {:.4}", report.evaluation.accuracy);

    println!(
        "Model saved: {} ({:.1} KB, calibrated on {} samples)",
        report.model_path.display(),
        report.export.size_kb,
        report.export.calibration_samples
    );
    println!("int8/float agreement: {:.1}%", report.agreement * 100.0);
    if let Some(path) = &report.labels_path {
        println!("Labels: {}", path.display());
    }
    if let Some(path) = &report.header_path {
        println!("C header: {}", path.display());
    }

    if plot {
        println!();
        print!(
            "{}",
            render_accuracy_chart(history, CHART_SIZE.0, CHART_SIZE.1)
        );
    }
}

fn print_model(model: &QuantizedModel, size: usize) {
    println!("Size: {size} bytes ({:.1} KB)", size as f64 / 1024.0);
    println!(
        "Input: int8 [{} x {}] scale={:.6} zero_point={}",
        model.window_size, model.num_features, model.input.scale, model.input.zero_point
    );
    println!(
        "Output: int8 [{}] scale={:.6} zero_point={}",
        model.num_classes, model.output.scale, model.output.zero_point
    );
    println!("Layers:");
    for (i, layer) in model.layers.iter().enumerate() {
        let params = layer.output_params();
        let shape = match layer {
            QuantLayer::Conv1d {
                kernel_size,
                linear,
            } => format!(
                "kernel {kernel_size}, {} -> {} channels{}",
                linear.inputs / (*kernel_size).max(1),
                linear.outputs,
                if linear.relu { ", relu" } else { "" }
            ),
            QuantLayer::Dense(linear) => format!(
                "{} -> {} units{}",
                linear.inputs,
                linear.outputs,
                if linear.relu { ", relu" } else { "" }
            ),
            QuantLayer::GlobalAveragePool1d { .. } | QuantLayer::Softmax { .. } => String::new(),
        };
        println!(
            "  {i}: {:<22} {shape:<32} out scale={:.6} zp={}",
            layer.name(),
            params.scale,
            params.zero_point
        );
    }
    if !model.feature_min.is_empty() {
        println!("Feature ranges:");
        for (lo, hi) in model.feature_min.iter().zip(&model.feature_max) {
            println!("  [{lo}, {hi}]");
        }
    }
}
