use std::io::IsTerminal;
use std::sync::Arc;

use termhost_cli::{print_events, LogLayer, LogsCommand, Shell, LOG_BUFFER};
use termhost_runtime::{EventKind, Runtime, RuntimeConfig};
use tokio::io::BufReader;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(LogLayer::new())
        .init();

    let config = RuntimeConfig::from_env();
    tracing::info!(
        plugin_dir = %config.plugin_dir.display(),
        builtins = config.builtins,
        "starting termhost"
    );

    let runtime = Runtime::builder()
        .config(config)
        .handle(tokio::runtime::Handle::current())
        .build()
        .expect("failed to assemble runtime");

    runtime
        .commands()
        .register_builtin(Arc::new(LogsCommand::new(&LOG_BUFFER)))
        .expect("failed to register logs command");

    let interactive = std::io::stdin().is_terminal();
    if interactive {
        print_events(
            &runtime,
            &[
                EventKind::CommandCompleted,
                EventKind::CommandFailed,
                EventKind::PluginEnabled,
                EventKind::PluginDisabled,
                EventKind::PluginUnloaded,
                EventKind::ConfigChanged,
            ],
        );
    }

    let report = runtime.load_plugins().await;
    for failure in &report.failed {
        eprintln!("plugin {} failed to load: {}", failure.source, failure.error);
    }
    if interactive {
        println!(
            "termhost {}: {} plugin(s) loaded, type `help` for commands",
            env!("CARGO_PKG_VERSION"),
            report.loaded.len()
        );
    }

    let shell = if interactive {
        Shell::interactive(&runtime)
    } else {
        Shell::scripted(&runtime)
    };
    let mut stdout = std::io::stdout();
    if let Err(e) = shell.run(BufReader::new(tokio::io::stdin()), &mut stdout).await {
        tracing::error!("shell input error: {e}");
    }

    runtime.shutdown().await;
}
