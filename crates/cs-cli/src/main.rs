mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::develop::DevelopArgs;
use commands::Exit;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// code-squad CLI -- generate, build and test code with language workers.
#[derive(Parser)]
#[command(name = "cs", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Develop a task from a description (in-process unless --api-url).
    Develop {
        /// What the code should do.
        #[arg(short, long)]
        description: String,
        /// Target language tag (python, js, go, ...).
        #[arg(short, long, default_value = "python")]
        language: String,
        /// Augment generation with retrieval context.
        #[arg(long)]
        rag: bool,
        /// Build and test in the container sandbox.
        #[arg(long)]
        test: bool,
        /// Send the task to a running daemon instead.
        #[arg(long)]
        api_url: Option<String>,
        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Show daemon status (default when no subcommand is given).
    Status {
        #[arg(long, default_value = "http://localhost:8503")]
        api_url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                Exit::Usage.into()
            } else {
                Exit::Success.into()
            };
        }
    };
    cs_telemetry::logging::init_logging("cs", "warn");

    let outcome = match cli.command {
        None => commands::status::run("http://localhost:8503").await,
        Some(Commands::Status { api_url }) => commands::status::run(&api_url).await,
        Some(Commands::Develop {
            description,
            language,
            rag,
            test,
            api_url,
            json,
        }) => {
            let args = DevelopArgs {
                description,
                language,
                rag,
                test,
                json,
            };
            match api_url {
                Some(url) => commands::develop::run_remote(&url, &args).await,
                None => commands::develop::run(&args).await,
            }
        }
    };

    match outcome {
        Ok(exit) => exit.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            Exit::Usage.into()
        }
    }
}
