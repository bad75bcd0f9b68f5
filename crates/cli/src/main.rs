mod logging;
mod simulate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use moe_comm_core::{ConfigOverrides, MoeCommConfig};

use simulate::SimulationParams;

#[derive(Parser)]
#[command(name = "moe-comm", about = "Expert-parallel MoE communication driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one forward/backward MoE step across an in-process rank group
    Simulate {
        #[command(flatten)]
        overrides: OverrideArgs,

        /// Tokens per rank
        #[arg(long, default_value_t = 64)]
        tokens: usize,

        /// Hidden size of every token
        #[arg(long, default_value_t = 32)]
        hidden: usize,

        /// Experts across the expert-parallel group
        #[arg(long, default_value_t = 8)]
        experts: usize,

        /// Per-expert capacity as a multiple of an even token split
        #[arg(long, default_value_t = 1.25)]
        capacity_factor: f64,

        /// Default log level when RUST_LOG is not set
        #[arg(long, default_value = "info", env = "MOE_LOG_LEVEL")]
        log_level: String,
    },
    /// Print the resolved configuration, or write it to a file
    Config {
        #[command(flatten)]
        overrides: OverrideArgs,

        /// Write the TOML here instead of printing it
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Options shared by every subcommand; each one replaces the file value.
#[derive(Args, Debug, Default)]
struct OverrideArgs {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ranks the experts are sharded across
    #[arg(long)]
    ep_size: Option<usize>,

    /// Data-parallel replicas
    #[arg(long)]
    dp_size: Option<usize>,

    /// Tensor-parallel ranks
    #[arg(long)]
    tp_size: Option<usize>,

    /// Experts per token used by the data-parallel gradient scalers
    #[arg(long)]
    activated_experts: Option<usize>,

    /// Route the all-to-all through one rank per local group
    #[arg(long)]
    hierarchical: bool,

    /// Ranks per local group for the hierarchical exchange
    #[arg(long)]
    local_group_size: Option<usize>,

    /// Issue the dispatch all-to-all without blocking
    #[arg(long)]
    overlap: bool,

    /// Always use the reference cumulative sum
    #[arg(long)]
    no_cumsum_kernel: bool,
}

impl OverrideArgs {
    fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            expert_parallel_size: self.ep_size,
            data_parallel_size: self.dp_size,
            tensor_parallel_size: self.tp_size,
            activated_experts: self.activated_experts,
            use_cumsum_kernel: self.no_cumsum_kernel.then_some(false),
            hierarchical: self.hierarchical.then_some(true),
            local_group_size: self.local_group_size,
            overlap: self.overlap.then_some(true),
        }
    }

    /// File (if any) merged with the command-line overrides.
    fn resolve(&self) -> anyhow::Result<MoeCommConfig> {
        let mut config = match &self.config {
            Some(path) => MoeCommConfig::load_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => MoeCommConfig::default(),
        };
        config.merge(&self.to_overrides());
        config.validate()?;
        Ok(config)
    }
}

fn write_config(config: &MoeCommConfig, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            config
                .save_to(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Wrote config to: {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            overrides,
            tokens,
            hidden,
            experts,
            capacity_factor,
            log_level,
        } => {
            let config = overrides.resolve()?;
            logging::init_with_level(&log_level);
            if let Some(path) = &overrides.config {
                tracing::info!(path = %path.display(), "loaded config");
            }

            let params = SimulationParams {
                tokens,
                hidden,
                experts,
                capacity_factor,
            };
            let reports = simulate::run(&config, &params)?;
            let dropped: usize = reports.iter().map(|r| r.dropped).sum();
            println!(
                "simulated {} ranks: {} tokens dropped of {}",
                reports.len(),
                dropped,
                tokens * reports.len()
            );
        }
        Command::Config { overrides, output } => {
            let config = overrides.resolve()?;
            write_config(&config, output.as_deref())?;
        }
    }

    Ok(())
}
