#![deny(unsafe_code)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wokwigw::{
    stack::launch_config, start_server, Args, Backend, BackendConfig, GatewayConfig, GATEWAY_VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match args.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let print_stack_config = args.print_stack_config;
    let config = GatewayConfig::from_args(args).context("invalid configuration")?;
    if print_stack_config {
        let BackendConfig::Stack(options) = &config.backend else {
            anyhow::bail!("--print-stack-config only applies to stack mode");
        };
        println!("{}", launch_config(&options.stack)?);
        return Ok(());
    }
    banner(config.listen_addr);

    let backend = Arc::new(Backend::from_config(config.backend));

    if let Err(err) = backend.setup().await {
        if let Err(cleanup) = backend.cleanup().await {
            tracing::warn!("{cleanup}");
        }
        return Err(err).context("backend setup failed");
    }

    let handle = match start_server(config.listen_addr, backend.clone()).await {
        Ok(handle) => handle,
        Err(err) => {
            if let Err(cleanup) = backend.cleanup().await {
                tracing::warn!("{cleanup}");
            }
            return Err(err).with_context(|| format!("failed to listen on {}", config.listen_addr));
        }
    };
    tracing::info!(
        backend = backend.name(),
        "wokwigw listening on ws://{}",
        handle.local_addr()
    );

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    backend.cleanup().await.context("cleanup")?;
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            },
            Err(err) => {
                tracing::warn!("SIGTERM handler unavailable, waiting for Ctrl+C only: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn banner(listen_addr: SocketAddr) {
    println!(
        r#"
       __              ,
|  |  /  \  |_/  |  |  |
|/\|  \__/  | \  |/\|  |

    Wokwi IoT Gateway

Version: {GATEWAY_VERSION}

Listening on TCP Port {}
"#,
        listen_addr.port()
    );
}
