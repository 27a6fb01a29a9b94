//! `convoy config`: print the resolved compose document.

use clap::Args;

use super::ProjectArgs;

/// Arguments for the `config` command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print service names only.
    #[arg(long)]
    pub services: bool,

    /// Print volume names only.
    #[arg(long)]
    pub volumes: bool,

    /// Print each service's configuration hash.
    #[arg(long)]
    pub hash: bool,
}

/// Executes the `config` command.
///
/// # Errors
///
/// Returns an error if the project cannot be resolved or serialized.
pub fn execute(project_args: &ProjectArgs, args: &ConfigArgs) -> anyhow::Result<()> {
    let project = project_args.load()?;

    if args.services {
        for name in project.services.keys() {
            println!("{name}");
        }
        return Ok(());
    }
    if args.volumes {
        for name in project.volumes.keys() {
            println!("{name}");
        }
        return Ok(());
    }
    if args.hash {
        for (name, service) in &project.services {
            let hash = service
                .fingerprint
                .as_ref()
                .map_or_else(String::new, ToString::to_string);
            println!("{name} {hash}");
        }
        return Ok(());
    }

    print!("{}", project.config_yaml()?);
    Ok(())
}
