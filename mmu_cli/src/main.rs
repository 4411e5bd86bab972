#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod error_fmt;
mod logging;
mod run;

use std::fs;

use clap::Parser;
use eyre::WrapErr;

use crate::cli::{Cli, JSON_MODE, json_mode};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn load_config(cli: &Cli) -> eyre::Result<mmu_config::Config> {
    let text = fs::read_to_string(&cli.config)
        .wrap_err_with(|| format!("read config {:?}", cli.config))?;
    let cfg = mmu_config::load_toml(&text)
        .wrap_err_with(|| format!("parse config {:?}", cli.config))?;
    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

fn real_main(cli: &Cli) -> eyre::Result<()> {
    color_eyre::install()?;
    let cfg = load_config(cli)?;
    logging::init_logging(cli.json, &cli.log_level, &cfg.logging)?;
    tracing::debug!(
        config = %cli.config.display(),
        selector = %cfg.unit.selector,
        gates = cfg.unit.num_gates,
        "configuration loaded"
    );
    run::execute(cli, &cfg)
}

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(err) = real_main(&cli) {
        tracing::error!(error = %err, "command failed");
        if json_mode() {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}
