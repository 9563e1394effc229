use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cyris::cli::{Cli, Command};
use cyris::config;
use cyris::error::RangeError;
use cyris::init;
use cyris::model;
use cyris::orchestrator::RangeOrchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("cyris=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if verbose {
                if let Some(source) = std::error::Error::source(&e) {
                    eprintln!("caused by: {source}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), RangeError> {
    let Cli { settings: settings_path, command, .. } = cli;

    // `config-init` creates the settings file, so it must not require one
    // to already exist.
    let settings = match &command {
        Command::ConfigInit { out } => return init::run_config_init(out).await,
        _ => config::load_env_settings(&settings_path)?,
    };

    match command {
        Command::ConfigInit { .. } => unreachable!(),

        Command::Validate => init::run_validate(&settings).await,

        Command::SetupPermissions => init::run_setup_permissions(&settings).await,

        Command::ConfigShow => {
            let yaml = facet_yaml::to_string(&settings).expect("valid YAML serialization");
            print!("{yaml}");
            Ok(())
        }

        Command::Create {
            description,
            range_id,
            dry_run,
            network_mode,
            enable_ssh,
        } => {
            let orchestrator = RangeOrchestrator::new(settings).await?;
            let description = model::load_description(&description)?;
            let outcome = orchestrator
                .create(&description, range_id, dry_run, network_mode, enable_ssh)
                .await?;

            if outcome.dry_run {
                println!("Dry run OK: range '{}' would be created.", outcome.metadata.range_id);
            } else {
                println!(
                    "Range '{}' is {}.",
                    outcome.metadata.range_id, outcome.metadata.status
                );
                print!("{}", outcome.notification);
            }
            Ok(())
        }

        Command::List { range_id, all, verbose } => {
            let orchestrator = RangeOrchestrator::new(settings).await?;
            let ranges = match range_id {
                Some(id) => vec![orchestrator.status(&id)?],
                None => orchestrator.list(all),
            };
            for r in ranges {
                println!("{}\t{}\t{}", r.range_id, r.status, r.display_name);
                if verbose {
                    for (guest, ip) in &r.ip_assignments {
                        println!("  {guest}: {ip}");
                    }
                    for t in &r.task_results {
                        println!(
                            "  task {} ({}) on {}: {}",
                            t.task_id,
                            t.kind,
                            t.guest,
                            if t.success { "ok" } else { "failed" }
                        );
                    }
                }
            }
            Ok(())
        }

        Command::Status { range_id, verbose } => {
            let orchestrator = RangeOrchestrator::new(settings).await?;
            let r = orchestrator.status(&range_id)?;
            println!("range_id: {}", r.range_id);
            println!("status: {}", r.status);
            println!("display_name: {}", r.display_name);
            println!("created_at: {}", r.created_at);
            println!("last_modified: {}", r.last_modified);
            if verbose {
                for (guest, ip) in &r.ip_assignments {
                    println!("  {guest}: {ip}");
                }
                for t in &r.task_results {
                    println!(
                        "  task {} ({}) on {}: {} ({})",
                        t.task_id, t.kind, t.guest, t.message, t.elapsed_ms
                    );
                }
            }
            Ok(())
        }

        Command::Destroy { range_id, force, rm } => {
            let orchestrator = RangeOrchestrator::new(settings).await?;
            let outcome = orchestrator.destroy(&range_id, force).await?;
            if outcome.already_destroyed {
                println!("Range '{range_id}' was already destroyed.");
            } else {
                println!("Range '{range_id}' destroyed.");
            }
            if rm {
                orchestrator.remove(&range_id, true).await?;
                println!("Range '{range_id}' removed.");
            }
            Ok(())
        }

        Command::Rm { range_id, force } => {
            let orchestrator = RangeOrchestrator::new(settings).await?;
            orchestrator.remove(&range_id, force).await?;
            println!("Range '{range_id}' removed.");
            Ok(())
        }

        Command::SshInfo { range_id } => {
            let orchestrator = RangeOrchestrator::new(settings).await?;
            for info in orchestrator.ssh_info(&range_id)? {
                println!("{}\t{}\t{}", info.guest_id, info.host, info.port);
            }
            Ok(())
        }
    }
}
