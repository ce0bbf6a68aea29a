use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use querydeck::api::{Credentials, HttpApi};
use querydeck::persistence::FileStore;
use querydeck::query::{Execution, QueryOutcome, QueryResult};
use querydeck::{logging, Config, Workspace};

#[derive(Parser)]
#[command(name = "querydeck")]
#[command(about = "SQL workspace for a database proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run SQL against a server, service or listener of the proxy
    Run {
        #[arg(short, long)]
        target: String,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        password: String,
        /// SQL text; several statements may be separated by `;`
        sql: String,
    },
    /// Show or prune the query history
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,
    },
    /// Manage saved snippets
    Snippets {
        #[command(subcommand)]
        action: SnippetAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Remove the entry at INDEX, newest first
    Remove { index: usize },
    Clear,
}

#[derive(Subcommand)]
enum SnippetAction {
    List,
    Add { name: String, sql: String },
    /// Remove the snippet at INDEX as shown by `list`
    Remove { index: usize },
}

fn print_result(result: &QueryResult) {
    for outcome in &result.outcomes {
        match outcome {
            QueryOutcome::ResultSet(rs) => {
                println!("{}", rs.fields.join("\t"));
                for row in &rs.data {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    println!("{}", cells.join("\t"));
                }
                if !rs.complete {
                    println!("(result truncated)");
                }
            }
            QueryOutcome::RowCount { affected_rows, .. } => {
                println!("{} rows affected", affected_rows)
            }
            QueryOutcome::Error(err) => eprintln!("{}", err.describe()),
            QueryOutcome::Canceled => eprintln!("Query was interrupted"),
        }
    }
    if let Some(time) = result.execution_time {
        println!("({:.4} sec)", time);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logger().context("Failed to initialize logger")?;
    logging::info("Starting querydeck");

    let cli = Cli::parse();
    let config = Config::new();
    let api = Arc::new(HttpApi::new(&config.api).context("Failed to create API client")?);
    let backend = Arc::new(FileStore::new(&config.workspace.storage_dir));
    let workspace = Workspace::open(api, backend, &config.workspace).await;

    let outcome = dispatch(&workspace, cli.command).await;

    workspace.shutdown().await;
    if let Err(err) = &outcome {
        logging::error(&format!("Command failed: {:#}", err));
    }
    outcome
}

async fn dispatch(workspace: &Workspace, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            target,
            user,
            password,
            sql,
        } => run(workspace, &target, &Credentials::new(&user, &password), &sql).await,
        Commands::History { action } => {
            match action {
                None => {
                    for (index, entry) in workspace.history().iter().enumerate() {
                        println!(
                            "{}: {} [{}] {} -> {}",
                            index,
                            entry.time,
                            entry.connection_name,
                            entry.action.name,
                            entry.action.response.replace('\n', "; ")
                        );
                    }
                }
                Some(HistoryAction::Remove { index }) => {
                    workspace
                        .remove_history_entry(index)
                        .context("Failed to remove history entry")?;
                }
                Some(HistoryAction::Clear) => workspace.clear_history(),
            }
            Ok(())
        }
        Commands::Snippets { action } => {
            match action {
                SnippetAction::List => {
                    for (index, snippet) in workspace.snippets().iter().enumerate() {
                        println!("{}: {}\t{}", index, snippet.name, snippet.sql);
                    }
                }
                SnippetAction::Add { name, sql } => {
                    workspace.add_snippet(&name, &sql);
                }
                SnippetAction::Remove { index } => {
                    workspace
                        .remove_snippet(index)
                        .context("Failed to remove snippet")?;
                }
            }
            Ok(())
        }
    }
}

async fn run(workspace: &Workspace, target: &str, credentials: &Credentials, sql: &str) -> Result<()> {
    let worksheet = workspace.new_query_worksheet(Some("querydeck run"));
    let tab = workspace
        .read(|store| store.active_query_tab().map(|t| t.id.clone()))
        .context("Worksheet has no query tab")?;

    let outcome = async {
        workspace
            .connect_query_tab(&tab, target, credentials)
            .await
            .with_context(|| format!("Failed to connect to {}", target))?;
        workspace.run_query(&tab, sql).await.context("Query failed")
    }
    .await;
    workspace.close_worksheet(&worksheet).await?;

    match outcome? {
        Execution::Completed(result) => print_result(&result),
        Execution::Canceled | Execution::Superseded => eprintln!("Query did not complete"),
    }
    Ok(())
}
