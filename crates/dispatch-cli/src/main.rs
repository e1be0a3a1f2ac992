// Minimal smoke-test harness for the dispatch core: wires up one on-disk
// conversation/settings/audit/profile store, a couple of builtin tools, and
// the local backend adapter, then runs a single non-streaming chat turn.
// Not a product CLI — argument parsing beyond this smoke test is out of
// scope.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use dispatch_core::adapters::LocalAdapter;
use dispatch_core::audit::AuditLog;
use dispatch_core::config::EngineConfig;
use dispatch_core::conversation::ConversationStore;
use dispatch_core::crypto::MasterKey;
use dispatch_core::degradation::DegradationManager;
use dispatch_core::error::EngineResult;
use dispatch_core::profile::ProfileAggregator;
use dispatch_core::safety::PermissionAuditLog;
use dispatch_core::settings::SettingsStore;
use dispatch_core::tool_runner::ToolRunner;
use dispatch_core::tools::{ToolCategory, ToolContext, ToolHandler, ToolParam, ToolRegistry, ToolSpec};
use dispatch_core::types::PermissionLevel;
use dispatch_core::{Context, Dispatcher, SendOutcome};

#[derive(Parser, Debug)]
#[command(about = "Send one message through the dispatch core and print the reply")]
struct Args {
    /// The message to send.
    message: String,

    #[arg(long, env = "DISPATCH_CONVERSATION_ID", default_value = "cli")]
    conversation_id: String,

    #[arg(long, env = "DISPATCH_DB_PATH", default_value = "dispatch-core.db")]
    db_path: String,
}

struct CurrentTime;

#[async_trait::async_trait]
impl ToolHandler for CurrentTime {
    async fn call(&self, _args: serde_json::Value, _ctx: &ToolContext) -> EngineResult<serde_json::Value> {
        Ok(serde_json::json!({ "now": dispatch_core::util::now_rfc3339() }))
    }
}

fn build_context(args: &Args) -> EngineResult<Arc<Context>> {
    let mut config = EngineConfig::from_env();
    // This harness only wires up the local backend adapter, so pin
    // backend selection to it regardless of the configured default.
    config.local_only_mode = true;

    let conversation = Arc::new(ConversationStore::open(rusqlite::Connection::open(&args.db_path)?)?);

    let salt_path = std::path::Path::new(&args.db_path).with_extension("salt");
    let master_key = MasterKey::load_or_create(&salt_path)?;
    let settings = Arc::new(SettingsStore::open(rusqlite::Connection::open(&args.db_path)?, master_key)?);

    let tools = Arc::new(ToolRegistry::new());
    tools.register(ToolSpec::new(
        "current_time",
        "Returns the current UTC time in RFC 3339 format.",
        vec![],
        PermissionLevel::Sandbox,
        ToolCategory::Builtin,
        false,
        false,
        Arc::new(CurrentTime),
    ));
    tools.register(ToolSpec::new(
        "run_shell_command",
        "Runs a shell command inside the sandbox and returns stdout/stderr.",
        vec![ToolParam::required("command", "string", "the command to run")],
        PermissionLevel::System,
        ToolCategory::Shell,
        false,
        false,
        Arc::new(CurrentTime), // unused: the Tool Runner special-cases ToolCategory::Shell before invoking any handler
    ));

    let degradation = Arc::new(DegradationManager::new());
    let audit = Arc::new(AuditLog::open(rusqlite::Connection::open(&args.db_path)?)?);
    let tool_runner = Arc::new(ToolRunner::new(tools.clone(), degradation.clone(), audit.clone()));
    let profile = Arc::new(ProfileAggregator::open(rusqlite::Connection::open(&args.db_path)?)?);
    let permission_audit = Arc::new(PermissionAuditLog::new());

    let mut adapters: HashMap<_, Arc<dyn dispatch_core::adapters::BackendAdapter>> = HashMap::new();
    adapters.insert(
        dispatch_core::ProviderKind::Local,
        Arc::new(LocalAdapter::new(config.local_backend_host.clone(), config.local_backend_model.clone())),
    );

    Ok(Arc::new(Context::new(
        conversation,
        settings,
        tools,
        tool_runner,
        degradation,
        audit,
        profile,
        permission_audit,
        adapters,
        config,
    )))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let ctx = match build_context(&args) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("failed to initialize dispatch core: {e}");
            std::process::exit(1);
        }
    };

    let dispatcher = Dispatcher::new(ctx);
    let outcome = dispatcher
        .send_nonstreaming(Some(args.conversation_id), args.message, vec![])
        .await;

    match outcome {
        SendOutcome::Response(response) => {
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or(response.response));
        }
        SendOutcome::Error(e) => {
            eprintln!("error[{}]: {}", e.kind.as_str(), e.message);
            std::process::exit(1);
        }
    }
}
