//! CLI command definitions and dispatch.

pub mod config;
pub mod plan;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use convoy_common::config::ResolveOptions;
use convoy_compose::{Project, ProjectResolver};

/// Convoy: compose-file resolver.
#[derive(Parser, Debug)]
#[command(name = "convoy", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Project selection shared by every command.
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Options selecting and shaping the project.
#[derive(Args, Debug, Default)]
pub struct ProjectArgs {
    /// Compose file; repeat to merge several, `-` reads stdin.
    #[arg(short = 'f', long = "file", global = true)]
    pub files: Vec<PathBuf>,

    /// Project name.
    #[arg(short = 'p', long, global = true)]
    pub project_name: Option<String>,

    /// Profile to enable; repeatable, `*` enables all.
    #[arg(long = "profile", global = true)]
    pub profiles: Vec<String>,

    /// Dotenv file, relative to the project directory.
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Project directory; defaults to the first file's directory.
    #[arg(long, global = true)]
    pub project_directory: Option<PathBuf>,

    /// Replica count override, `SERVICE=N`; repeatable.
    #[arg(long, global = true, value_parser = parse_scale)]
    pub scale: Vec<(String, u32)>,

    /// Attach every container to one project pod.
    #[arg(long, global = true)]
    pub in_pod: bool,
}

impl ProjectArgs {
    /// Converts the arguments to resolver options.
    #[must_use]
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            files: self.files.clone(),
            project_name: self.project_name.clone(),
            project_dir: self.project_directory.clone(),
            profiles: self.profiles.iter().cloned().collect::<BTreeSet<_>>(),
            scale: self.scale.iter().cloned().collect::<BTreeMap<_, _>>(),
            env_file: self.env_file.clone(),
            in_pod: self.in_pod,
            ..ResolveOptions::default()
        }
    }

    /// Resolves the selected project.
    ///
    /// # Errors
    ///
    /// Returns an error if any resolution stage fails.
    pub fn load(&self) -> anyhow::Result<Project> {
        let project = ProjectResolver::new(self.resolve_options()).resolve()?;
        tracing::debug!(project = %project.name, "project loaded");
        Ok(project)
    }
}

fn parse_scale(raw: &str) -> Result<(String, u32), String> {
    let (service, count) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SERVICE=N, got \"{raw}\""))?;
    if service.is_empty() {
        return Err(format!("missing service name in \"{raw}\""));
    }
    let count = count
        .parse()
        .map_err(|e| format!("invalid replica count in \"{raw}\": {e}"))?;
    Ok((service.to_owned(), count))
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the resolved, merged compose document.
    Config(config::ConfigArgs),
    /// Print the containers that would be created, in start order.
    Plan(plan::PlanArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Config(args) => config::execute(&cli.project, &args),
        Command::Plan(args) => plan::execute(&cli.project, &args),
    }
}
