use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use agent_host::{
    Config, EnvComposer, Provisioner, Supervisor,
    cli::{Cli, Commands, ConfigCommands, RunArgs},
    config::ConfigProfileSource,
    core::augment::{EnvAugmenter, process_env},
    core::compose::CredentialKey,
    core::python::{ProvisionEvent, resolve_source_path},
    core::secret::{describe, mask_secrets},
    core::types::{EnvMap, RuntimeStatus, SpawnRequest},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load()?;

    match cli.command {
        Commands::Check => {
            let supervisor = build_supervisor(&config, &cli.source)?;
            let status = provision(&supervisor).await;
            println!("{}", serde_json::to_string_pretty(status.as_ref())?);
            Ok(exit_code(status.ready))
        }

        Commands::Env {
            origins,
            show_secrets,
            overrides,
        } => {
            let supervisor = build_supervisor(&config, &cli.source)?;
            let status = provision(&supervisor).await;
            if let Some(error) = &status.error {
                eprintln!("warning: {error}");
            }
            print_env(&supervisor, overrides.into_iter().collect(), origins, show_secrets).await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run(args) => {
            let supervisor = build_supervisor(&config, &cli.source)?;
            run_process(&supervisor, args).await
        }

        Commands::Which { name } => {
            let augmenter = EnvAugmenter::for_host();
            let env = augmenter.augment(&process_env(), &config.augment.extra_paths);
            match augmenter.find_executable_in(&name, &env) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(ExitCode::SUCCESS)
                }
                None => anyhow::bail!("{name} not found on the augmented search path"),
            }
        }

        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => println!("{}", toml::to_string_pretty(&config)?),
                ConfigCommands::Path => println!("{}", Config::config_path()?.display()),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_supervisor(config: &Config, source: &Path) -> anyhow::Result<Supervisor> {
    let source = resolve_source_path(source)?;
    let provisioner = Provisioner::new(config.provisioner_settings());
    let credentials = ConfigProfileSource::new(config.profile.clone());
    let composer = EnvComposer::new(Arc::new(credentials));

    Ok(Supervisor::new(provisioner, composer, source)
        .with_timeouts(config.spawn_timeouts())
        .with_extra_paths(config.augment.extra_paths.clone()))
}

/// Provision with progress on stderr.
async fn provision(supervisor: &Supervisor) -> Arc<RuntimeStatus> {
    let provisioner = supervisor.provisioner();
    let mut events = provisioner.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ProvisionEvent::Status(message) => eprintln!("{message}..."),
                ProvisionEvent::Ready | ProvisionEvent::Failed(_) => break,
            }
        }
    });

    let status = provisioner.ensure_ready(supervisor.source_path()).await;
    // The terminal event is already queued; the printer only needs to drain it
    let _ = tokio::time::timeout(Duration::from_secs(1), progress).await;
    status
}

async fn print_env(supervisor: &Supervisor, overrides: EnvMap, origins: bool, show_secrets: bool) {
    let env = supervisor.compose_env(overrides).await;
    let secret_keys: Vec<&str> = CredentialKey::ALL
        .iter()
        .filter(|key| key.is_secret())
        .map(|key| key.env_name())
        .collect();

    for (key, value) in env.iter() {
        let shown = if show_secrets {
            value.to_string()
        } else if secret_keys.contains(&key) {
            describe(Some(value))
        } else {
            mask_secrets(value).into_owned()
        };

        match env.origin(key).filter(|_| origins) {
            Some(origin) => println!("{key}={shown}  [{origin}]"),
            None => println!("{key}={shown}"),
        }
    }
}

async fn run_process(supervisor: &Supervisor, args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut command = args.command.into_iter();
    let executable = command.next().unwrap_or_default();
    let cwd = args
        .cwd
        .unwrap_or_else(|| supervisor.source_path().to_path_buf());

    let mut request = SpawnRequest::new(args.purpose, cwd, executable, command.collect());
    request.extra_env = args.overrides.into_iter().collect();
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let spawn = supervisor.spawn(request);
    tokio::pin!(spawn);

    let outcome = tokio::select! {
        outcome = &mut spawn => outcome,
        _ = tokio::signal::ctrl_c() => {
            supervisor.shutdown();
            (&mut spawn).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(exit_code(outcome.succeeded()))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
