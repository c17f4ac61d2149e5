use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use kubeport_k8s::{ContextInfo, DeploymentInfo, KubeClient, TargetSelector};
use kubeport_tunnel::KubeConnector;

mod config;
mod control;

use config::Config;
use control::{ControlRequest, ControlResponse, Controller, ForwardSettings};

/// Kubeport - manage Kubernetes deployments and forward local ports into them
#[derive(Parser, Debug)]
#[command(name = "kubeport")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to <config dir>/kubeport/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Kubernetes context name (defaults to the current context)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace to work in
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Print lists as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List kubeconfig contexts
    Contexts,

    /// List deployments in the namespace
    Deployments,

    /// Create a single-replica deployment
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        image: String,
    },

    /// Forward a local port to a deployment until interrupted
    Forward {
        deployment: String,

        /// Local port (overrides forward.local_port)
        #[arg(long)]
        local_port: Option<u16>,

        /// Container port (overrides forward.remote_port)
        #[arg(long)]
        remote_port: Option<u16>,

        /// Pick the pod through pod/NAME, svc/NAME or deploy/NAME instead of
        /// the deployment's service
        #[arg(long, value_name = "KIND/NAME")]
        target: Option<TargetSelector>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if args.context.is_some() {
        config.context = args.context;
    }

    let kube_client = KubeClient::new()?;

    if let Command::Contexts = args.command {
        print_contexts(&kube_client.get_contexts(), args.json)?;
        return Ok(());
    }

    if let Command::Forward {
        remote_port: Some(port),
        ..
    } = args.command
    {
        config.forward.remote_port = port;
    }

    let cluster = kube_client
        .connect(config.context.as_deref(), Some(&config.namespace))
        .await?;

    let mut controller = Controller::new(
        cluster.clone(),
        cluster.clone(),
        KubeConnector::new(cluster),
        ForwardSettings::from_config(&config),
    );

    match args.command {
        Command::Contexts => Ok(()),
        Command::Deployments => {
            let response = controller.handle(ControlRequest::RequestDeployments).await?;
            print_response(&response, args.json)
        }
        Command::Create { name, image } => {
            let response = controller
                .handle(ControlRequest::CreateDeployment { image, name })
                .await?;
            print_response(&response, args.json)
        }
        Command::Forward {
            deployment,
            local_port,
            target,
            ..
        } => {
            let response = controller
                .handle(ControlRequest::PortForward {
                    deployment: deployment.clone(),
                    local_port,
                    target,
                })
                .await?;
            print_response(&response, args.json)?;

            let ended = match controller.forward(&deployment) {
                Some(handle) => tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("Failed to listen for Ctrl-C")?;
                        false
                    }
                    _ = handle.wait() => true,
                },
                None => false,
            };

            if ended {
                controller.shutdown().await;
                anyhow::bail!("Forward to '{}' ended: the pod is gone", deployment);
            }

            let response = controller
                .handle(ControlRequest::StopForward { deployment })
                .await?;
            print_response(&response, args.json)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_contexts(contexts: &[ContextInfo], json: bool) -> Result<()> {
    if json {
        return print_json(&contexts);
    }

    println!("{:<2}{:<32} {:<32} NAMESPACE", "", "NAME", "CLUSTER");
    for ctx in contexts {
        println!(
            "{:<2}{:<32} {:<32} {}",
            if ctx.is_current { "*" } else { "" },
            ctx.name,
            ctx.cluster,
            ctx.namespace.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_deployments(deployments: &[DeploymentInfo]) {
    println!("{:<32} {:<8} {:<12} IMAGE", "NAME", "READY", "STATUS");
    for deploy in deployments {
        println!(
            "{:<32} {:<8} {:<12} {}",
            deploy.name,
            deploy.replica_status(),
            deploy.status,
            deploy.image.as_deref().unwrap_or("<none>")
        );
    }
}

fn print_response(response: &ControlResponse, json: bool) -> Result<()> {
    if json {
        return print_json(response);
    }

    match response {
        ControlResponse::Deployments { deployments } => print_deployments(deployments),
        ControlResponse::ForwardStarted(forward) => println!(
            "Forwarding {} -> {}:{} (pod {}), Ctrl-C to stop",
            forward.local_addr, forward.deployment, forward.remote_port, forward.pod
        ),
        ControlResponse::ForwardStopped { deployment } => {
            println!("Stopped forwarding {}", deployment)
        }
        ControlResponse::Forwards { forwards } => {
            for forward in forwards {
                println!(
                    "{} -> {}:{} (pod {})",
                    forward.local_addr, forward.deployment, forward.remote_port, forward.pod
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_target_flag() {
        let args = Args::try_parse_from(["kubeport", "forward", "web", "--target", "pod/web-0"]).unwrap();
        let Command::Forward { target, .. } = args.command else {
            panic!("expected forward, got {:?}", args.command);
        };
        assert_eq!(target, Some(TargetSelector::Pod("web-0".to_string())));

        let args = Args::try_parse_from(["kubeport", "forward", "web"]).unwrap();
        assert!(matches!(args.command, Command::Forward { target: None, .. }));
    }

    #[test]
    fn test_forward_rejects_unknown_target_kind() {
        assert!(Args::try_parse_from(["kubeport", "forward", "web", "--target", "cm/config"]).is_err());
    }
}
