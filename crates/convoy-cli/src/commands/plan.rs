//! `convoy plan`: show the containers a project resolves to.

use clap::Args;
use convoy_compose::Project;
use convoy_compose::model::ContainerRecord;

use super::ProjectArgs;
use crate::output::{format_dependencies, format_mount, short_hash};

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Services to show; all when empty.
    pub services: Vec<String>,

    /// Print the container records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `plan` command.
///
/// Resolves the project and lists its services in start order, each with
/// the containers it expands to.
///
/// # Errors
///
/// Returns an error if resolution fails or a requested service does not
/// exist.
pub fn execute(project_args: &ProjectArgs, args: &PlanArgs) -> anyhow::Result<()> {
    let project = project_args.load()?;
    project.assert_services(&args.services)?;

    let selected: Vec<String> = project
        .start_order()
        .into_iter()
        .filter(|name| args.services.is_empty() || args.services.contains(name))
        .collect();

    if args.json {
        let records: Vec<&ContainerRecord> = selected
            .iter()
            .flat_map(|name| project.containers_of(name))
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    print_plan(&project, &selected);
    Ok(())
}

fn print_plan(project: &Project, selected: &[String]) {
    println!("Plan for project: {}", project.name);
    println!("  directory:   {}", project.dir.display());
    println!("  config hash: {}", short_hash(&project.config_hash));
    if let Some(pod) = project.pods.first() {
        println!("  pod:         {}", pod.name);
    }
    println!();

    for name in selected {
        let Some(service) = project.service(name) else {
            continue;
        };
        println!("  + {name}");
        println!("      depends on: {}", format_dependencies(&service.deps));
        if let Some(build) = &service.build {
            if let Some(context) = &build.context {
                println!("      build:      {context}");
            }
            if !build.build_deps.is_empty() {
                println!("      build deps: {}", build.build_deps.join(", "));
            }
        }
        for container in project.containers_of(name) {
            println!(
                "      container:  {} ({}, {})",
                container.name,
                container.image,
                short_hash(&container.config_hash)
            );
        }
        for mount in &service.mounts {
            println!("      mount:      {}", format_mount(mount));
        }
        if !service.ports.is_empty() {
            println!("      ports:      {}", service.ports.join(", "));
        }
    }

    println!();
    println!(
        "  {} service(s), {} container(s).",
        selected.len(),
        selected
            .iter()
            .map(|name| project.containers_of(name).count())
            .sum::<usize>()
    );
}
