use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use taskmesh::api::create_router;
use taskmesh::nodes::memory::DEFAULT_CAPACITY;
use taskmesh::nodes::tool::ToolNodeConfig;
use taskmesh::nodes::{
    EchoBackend, MemoryStore, NodeAnnouncer, NodeProfile, OllamaBackend, ReasoningBackend,
    ToolRegistry, memory_router, reasoning_router, tool_router,
};
use taskmesh::protocol::{AcceleratorType, ContextEntry, NodeType, TaskSubmission};
use taskmesh::{OrchestratorClient, TaskId, TaskmeshConfig, create_orchestrator, hardware};

const REASONING_BIND: &str = "0.0.0.0:8001";
const TOOL_BIND: &str = "0.0.0.0:8002";
const MEMORY_BIND: &str = "0.0.0.0:8003";

#[derive(Parser)]
#[command(name = "taskmesh")]
#[command(about = "Distributed task orchestration across reasoning, tool and memory nodes")]
struct Cli {
    /// Path to taskmesh.json (otherwise TASKMESH_CONFIG, XDG config dir, ./taskmesh.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator HTTP API
    Orchestrator {
        #[arg(long, env = "TASKMESH_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
    },
    /// Run a reasoning node
    ReasoningNode {
        #[command(flatten)]
        node: NodeArgs,
        #[arg(long, value_enum, default_value_t = Backend::Ollama)]
        backend: Backend,
        #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
        ollama_url: String,
        #[arg(long, env = "TASKMESH_MODEL", default_value = "mistral:latest")]
        model: String,
    },
    /// Run a tool node
    ToolNode {
        #[command(flatten)]
        node: NodeArgs,
        /// Tools this node advertises
        #[arg(long, value_delimiter = ',', default_value = "file_ops,code_tools,automation,echo")]
        tools: Vec<String>,
        /// Directory file tools are confined to
        #[arg(long, default_value = "./sandbox")]
        sandbox_dir: PathBuf,
    },
    /// Run a memory node
    MemoryNode {
        #[command(flatten)]
        node: NodeArgs,
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
    },
    /// Submit a task and print the result
    Submit {
        user_input: String,
        #[arg(long, env = "TASKMESH_ORCHESTRATOR", default_value = "127.0.0.1:8000")]
        orchestrator: String,
        #[arg(long)]
        task_id: Option<String>,
        /// JSON array of {"input", "output"} pairs
        #[arg(short, long)]
        context: Option<String>,
    },
    /// Show a stored task result
    Status {
        task_id: String,
        #[arg(long, env = "TASKMESH_ORCHESTRATOR", default_value = "127.0.0.1:8000")]
        orchestrator: String,
    },
    /// List registered nodes
    Nodes {
        #[arg(long, env = "TASKMESH_ORCHESTRATOR", default_value = "127.0.0.1:8000")]
        orchestrator: String,
    },
}

#[derive(Args)]
struct NodeArgs {
    #[arg(long, env = "TASKMESH_NODE_ID")]
    node_id: Option<String>,
    /// Bind address (defaults to the node type's standard port)
    #[arg(long)]
    bind: Option<String>,
    /// Address announced to the orchestrator (defaults to the bind address)
    #[arg(long)]
    advertise: Option<String>,
    /// Orchestrator to register with. Without it the node runs standalone.
    #[arg(long, env = "TASKMESH_ORCHESTRATOR")]
    orchestrator: Option<String>,
    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,
    #[arg(long, value_delimiter = ',')]
    specializations: Vec<String>,
    #[arg(long, default_value = "cpu", value_parser = parse_accelerator)]
    accelerator: AcceleratorType,
    #[arg(long)]
    vram_gb: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Echo,
    Ollama,
}

fn parse_accelerator(raw: &str) -> Result<AcceleratorType, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .map_err(|_| format!("unknown accelerator `{}` (cpu, cuda, mps, other)", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskmesh=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TaskmeshConfig::load_from(path)?,
        None => TaskmeshConfig::load()?,
    };

    match cli.command {
        Commands::Orchestrator { bind } => {
            let service = create_orchestrator(&config);
            let cancel = CancellationToken::new();
            let monitor = service
                .health_monitor()
                .map(|monitor| monitor.spawn(cancel.clone()));

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Orchestrator listening on http://{}", bind);

            axum::serve(listener, create_router(service))
                .with_graceful_shutdown(shutdown_signal(cancel.clone()))
                .await?;

            if let Some(handle) = monitor {
                handle.await?;
            }
        }
        Commands::ReasoningNode {
            node,
            backend,
            ollama_url,
            model,
        } => {
            let backend: Arc<dyn ReasoningBackend> = match backend {
                Backend::Echo => Arc::new(EchoBackend),
                Backend::Ollama => {
                    info!("Using Ollama at {} with model {}", ollama_url, model);
                    Arc::new(OllamaBackend::new(
                        &ollama_url,
                        model,
                        config.timeouts.reasoning(),
                    ))
                }
            };
            let mut specializations = node.specializations.clone();
            if specializations.is_empty() {
                specializations.push("general".to_string());
            }
            let profile = Arc::new(
                node.profile(NodeType::Reasoning, REASONING_BIND)
                    .with_specializations(specializations),
            );
            let router = reasoning_router(profile.clone(), backend);
            serve_node(&node, REASONING_BIND, profile, router, &config).await?;
        }
        Commands::ToolNode {
            node,
            tools,
            sandbox_dir,
        } => {
            let profile = Arc::new(
                node.profile(NodeType::Tool, TOOL_BIND)
                    .with_specializations(node.specializations.clone()),
            );
            info!("Tool sandbox at {}", sandbox_dir.display());
            let tool_config = ToolNodeConfig {
                available_tools: tools.into_iter().collect(),
                sandbox_dir,
            };
            let router = tool_router(profile.clone(), ToolRegistry::builtin(), tool_config);
            serve_node(&node, TOOL_BIND, profile, router, &config).await?;
        }
        Commands::MemoryNode { node, capacity } => {
            let profile = Arc::new(
                node.profile(NodeType::Memory, MEMORY_BIND)
                    .with_specializations(node.specializations.clone()),
            );
            let router = memory_router(profile.clone(), Arc::new(MemoryStore::new(capacity)));
            serve_node(&node, MEMORY_BIND, profile, router, &config).await?;
        }
        Commands::Submit {
            user_input,
            orchestrator,
            task_id,
            context,
        } => {
            let context: Vec<ContextEntry> = match context {
                Some(raw) => serde_json::from_str(&raw).context("--context must be a JSON array")?,
                None => Vec::new(),
            };
            let client = OrchestratorClient::new(&orchestrator, config.timeouts);
            let response = client
                .submit_task(&TaskSubmission {
                    task_id: task_id.map(TaskId::from),
                    user_input,
                    context,
                })
                .await?;
            print_json(&response)?;
        }
        Commands::Status {
            task_id,
            orchestrator,
        } => {
            let client = OrchestratorClient::new(&orchestrator, config.timeouts);
            let task = client.task_status(&TaskId::from(task_id)).await?;
            print_json(&task)?;
        }
        Commands::Nodes { orchestrator } => {
            let client = OrchestratorClient::new(&orchestrator, config.timeouts);
            let nodes = client.list_nodes().await?;
            if nodes.is_empty() {
                println!("No nodes registered.");
                return Ok(());
            }

            println!(
                "{:<20} {:<12} {:<22} {:<6} {:<10}",
                "NODE", "TYPE", "ADDRESS", "LOAD", "AVAILABLE"
            );
            println!("{}", "-".repeat(74));
            for node in nodes {
                println!(
                    "{:<20} {:<12} {:<22} {:<6.2} {:<10}",
                    node.node_id,
                    node.node_type,
                    node.address,
                    node.capabilities.current_load,
                    node.capabilities.available
                );
            }
        }
    }

    Ok(())
}

impl NodeArgs {
    fn bind_address(&self, default_bind: &str) -> String {
        self.bind.clone().unwrap_or_else(|| default_bind.to_string())
    }

    fn profile(&self, node_type: NodeType, default_bind: &str) -> NodeProfile {
        let bind = self.bind_address(default_bind);
        let advertise = self
            .advertise
            .clone()
            .unwrap_or_else(|| bind.replace("0.0.0.0", "127.0.0.1"));
        let node_id = self.node_id.clone().unwrap_or_else(|| {
            format!("{}-{}", node_type, &uuid::Uuid::new_v4().simple().to_string()[..8])
        });

        NodeProfile::new(node_id, node_type, advertise)
            .with_capabilities(hardware::detect(self.accelerator, self.vram_gb))
    }
}

/// Serve a node router until Ctrl-C, announcing it to the orchestrator when
/// one is configured.
async fn serve_node(
    args: &NodeArgs,
    default_bind: &str,
    profile: Arc<NodeProfile>,
    router: axum::Router,
    config: &TaskmeshConfig,
) -> Result<()> {
    let bind = args.bind_address(default_bind);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        "{} node {} listening on http://{} (advertised as {})",
        profile.node_type, profile.node_id, bind, profile.address
    );

    let cancel = CancellationToken::new();
    let announcer = args.orchestrator.as_ref().map(|address| {
        let client = OrchestratorClient::new(address, config.timeouts);
        NodeAnnouncer::new(
            client,
            profile.clone(),
            Duration::from_secs(args.heartbeat_secs.max(1)),
        )
        .spawn(cancel.clone())
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    if let Some(handle) = announcer {
        handle.await?;
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    cancel.cancel();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
