#[cfg(feature = "cli")]
mod cli {
    use std::path::PathBuf;
    use std::process::ExitCode;

    use clap::{Parser, Subcommand};
    use sqlpilot::{config::Config, run_worker_server, CoreServices, SchemaSnapshot};

    #[derive(Parser)]
    #[command(name = "sqlpilot", version, about = "Natural language to safety-gated SQL")]
    struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Consume queued chat turns until Ctrl-C
        Worker,
        /// Generate a SQL statement for a question
        Generate {
            /// Schema snapshot JSON file
            #[arg(long)]
            schema: PathBuf,
            /// Dialect tag (mssql, postgres, mysql, sqlite, oracle, ...)
            #[arg(long, default_value = "mssql")]
            dialect: String,
            question: String,
        },
        /// Decide whether a chat message needs a database query
        NeedsQuery {
            #[arg(long)]
            schema: Option<PathBuf>,
            message: String,
        },
        /// Record a user turn and queue it for the worker
        Chat {
            #[arg(long)]
            conversation: String,
            #[arg(long, default_value = "default")]
            owner: String,
            text: String,
        },
        /// Print the ordered history of a conversation
        History {
            #[arg(long)]
            conversation: String,
        },
    }

    pub async fn run() -> anyhow::Result<ExitCode> {
        let cli = Cli::parse();
        sqlpilot::telemetry::init_tracing();
        let cfg = Config::from_env()?;

        if let Command::Worker = cli.command {
            run_worker_server(cfg).await?;
            return Ok(ExitCode::SUCCESS);
        }

        sqlpilot::metrics::init_metrics();
        let services = CoreServices::from_config(&cfg)?;

        match cli.command {
            Command::Worker => {}
            Command::Generate {
                schema,
                dialect,
                question,
            } => {
                let schema = SchemaSnapshot::from_json_file(&schema)?;
                match services.assistant.generate_sql(&question, &schema, &dialect).await {
                    Ok(sql) => println!("{}", sql),
                    Err(e) => {
                        eprintln!("error [{}]: {}", e.code(), e);
                        return Ok(ExitCode::FAILURE);
                    }
                }
            }
            Command::NeedsQuery { schema, message } => {
                let schema = schema
                    .map(|path| SchemaSnapshot::from_json_file(&path))
                    .transpose()?;
                let needed = services
                    .assistant
                    .needs_query_execution(&message, schema.as_ref())
                    .await;
                println!("{}", needed);
            }
            Command::Chat {
                conversation,
                owner,
                text,
            } => {
                let envelope = services.submit_turn(&conversation, &owner, &text, None).await?;
                println!("queued turn for {} at {}", envelope.conversation_id, envelope.enqueued_at);
            }
            Command::History { conversation } => {
                for message in services.conversations.get_history(&conversation).await {
                    println!(
                        "[{}] {}: {}",
                        message.timestamp.to_rfc3339(),
                        message.role,
                        message.content
                    );
                }
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<std::process::ExitCode> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
