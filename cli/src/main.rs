use std::sync::Arc;

use clap::Parser;

use bb7_core::App;
use bb7_core::Config;
use bb7_core::DebugLog;
use bb7_core::ModelClient;

/// Backend process of the bb7 editor assistant. Without flags the
/// process speaks newline-delimited JSON on stdin/stdout until EOF.
#[derive(Debug, Parser)]
#[command(name = "bb7", disable_version_flag = true)]
struct Cli {
    /// Print version (and short commit, when built with one) and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Print the build commit only and exit.
    #[arg(long = "build")]
    build: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        match option_env!("BB7_BUILD_COMMIT") {
            Some(commit) => println!("bb7 {} ({commit})", env!("CARGO_PKG_VERSION")),
            None => println!("bb7 {}", env!("CARGO_PKG_VERSION")),
        }
        return Ok(());
    }
    if cli.build {
        println!("{}", option_env!("BB7_BUILD_COMMIT").unwrap_or("unknown"));
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let config = Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
        let client = ModelClient::new(&config);
        let debug = DebugLog::new(&config);
        let app = Arc::new(App::new(config, client, debug));

        // Release the chat lock on Ctrl-C as well as on clean EOF.
        tokio::spawn({
            let app = Arc::clone(&app);
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    app.shutdown();
                    std::process::exit(130);
                }
            }
        });

        bb7_server::run_main(app).await?;
        Ok(())
    })
}
