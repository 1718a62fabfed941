//! `arduwrap compile <args...>`: compile and upload through the daemon.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use arduwrap_core::args::prepare_compile_args;
use arduwrap_daemon::request_compile;

use super::ClientContext;

/// Everything after `compile` goes to the build tool; `--upload` is added.
#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Arguments for `arduino-cli compile` (e.g. --fqbn esp32:esp32:esp32 sketch/).
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 0..,
        value_name = "ARGS"
    )]
    pub args: Vec<String>,
}

impl CompileArgs {
    pub fn run(self, context: &ClientContext) -> Result<()> {
        let cwd = std::env::current_dir().context("could not determine current directory")?;
        let args = prepare_compile_args(&self.args, &cwd);

        let response = request_compile(&context.socket, args)
            .map_err(|err| context.daemon_error(err, "compile request failed"))?;

        if let Some(output) = response.output.as_deref().filter(|o| !o.is_empty()) {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(output.as_bytes())
                .and_then(|()| stdout.flush())
                .context("failed to write compile output")?;
        }
        if !response.success {
            if let Some(error) = response.error.as_deref() {
                eprintln!("{} {error}", "Error:".red().bold());
            }
        }

        let exit_code = response.exit_code.unwrap_or(1);
        if exit_code != 0 || !response.success {
            std::process::exit(if exit_code == 0 { 1 } else { exit_code });
        }
        Ok(())
    }
}
