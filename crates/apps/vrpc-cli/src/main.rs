use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use comfy_table::Table;
use serde_json::{json, Value};
use vrpc_broker::MemoryBroker;
use vrpc_remote::{CallArg, CallRequest, InstanceRequest, Remote};

mod demo;
mod profile;

use profile::{Overrides, Profile, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "vrpc",
    version,
    about = "Operator CLI for the vrpc runtime",
    long_about = "Discovers agents and invokes remote functions over a pub/sub broker.\n\
                  Socket broker bindings are deployment-specific; this build ships the\n\
                  embedded demo transport (--broker memory://), which serves a Counter\n\
                  and a Foo class on domain/agent \"demo\"."
)]
struct Cli {
    #[arg(long)]
    broker: Option<String>,

    #[arg(long)]
    token: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    domain: Option<String>,

    #[arg(long)]
    agent: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// TOML file carrying the same fields as the flags; flags win.
    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List discovered domains.
    Domains,
    /// List agents of the configured domain.
    Agents,
    /// List classes served by the configured domain/agent.
    Classes,
    /// List live instances of a class.
    Instances { class: String },
    /// List member and static functions of a class.
    Functions { class: String },
    /// Invoke a static function; arguments are parsed as JSON, falling back
    /// to plain strings.
    Call {
        class: String,
        function: String,
        args: Vec<String>,
    },
    /// Invoke a member function on a named instance.
    CallInstance {
        class: String,
        instance: String,
        function: String,
        args: Vec<String>,
    },
    /// Emit shell completions.
    Completions { shell: Shell },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            broker: self.broker.clone(),
            token: self.token.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            domain: self.domain.clone(),
            agent: self.agent.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "vrpc", &mut std::io::stdout());
        return Ok(());
    }

    let profile = match &cli.profile {
        Some(path) => Profile::load(path)?,
        None => Profile::default(),
    };
    let mut settings = Settings::resolve(profile, cli.overrides());

    if !settings.broker.broker_url.starts_with("memory://") {
        // Validate the endpoint so configuration mistakes surface as such
        // before we report the missing binding.
        settings.broker.endpoint()?;
        bail!(
            "no socket broker binding is linked into this build; \
             use --broker memory://demo for the embedded demo transport"
        );
    }

    let memory_broker = MemoryBroker::new();
    let _demo_agent = demo::start(&memory_broker).context("failed to start the demo agent")?;
    if settings.domain == "*" {
        settings.domain = demo::DEMO_DOMAIN.to_owned();
    }
    if settings.agent == "*" {
        settings.agent = demo::DEMO_AGENT.to_owned();
    }

    let remote = Remote::connect(Arc::new(memory_broker), settings.remote_options()).await?;
    let json_output = cli.json;
    match cli.command {
        Command::Domains => {
            print_names(json_output, "domain", &remote.available_domains().await)?;
        }
        Command::Agents => {
            print_names(json_output, "agent", &remote.available_agents(&settings.domain).await)?;
        }
        Command::Classes => {
            print_names(
                json_output,
                "class",
                &remote.available_classes(&settings.domain, &settings.agent).await,
            )?;
        }
        Command::Instances { class } => {
            print_names(
                json_output,
                "instance",
                &remote.available_instances(&settings.domain, &settings.agent, &class).await,
            )?;
        }
        Command::Functions { class } => {
            let members =
                remote.available_member_functions(&settings.domain, &settings.agent, &class).await;
            let statics =
                remote.available_static_functions(&settings.domain, &settings.agent, &class).await;
            print_functions(json_output, &members, &statics)?;
        }
        Command::Call { class, function, args } => {
            let value = remote
                .call_static(CallRequest {
                    class_name: class,
                    function_name: function,
                    args: parse_args(&args),
                    ..CallRequest::default()
                })
                .await?;
            print_value(&value)?;
        }
        Command::CallInstance { class, instance, function, args } => {
            let proxy = remote
                .get_instance(InstanceRequest {
                    class_name: class,
                    instance,
                    ..InstanceRequest::default()
                })
                .await?;
            let value = proxy.call(&function, parse_args(&args)).await?;
            print_value(&value)?;
        }
        Command::Completions { .. } => unreachable!("handled before connecting"),
    }
    remote.end().await?;
    Ok(())
}

/// Each argument is tried as JSON first, so `42`, `true` and `{"a":1}` come
/// through typed while bare words stay strings.
fn parse_args(raw: &[String]) -> Vec<CallArg> {
    raw.iter()
        .map(|arg| match serde_json::from_str::<Value>(arg) {
            Ok(value) => CallArg::Value(value),
            Err(_) => CallArg::Value(json!(arg)),
        })
        .collect()
}

fn print_names(json_output: bool, header: &str, names: &[String]) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(names)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec![header]);
    for name in names {
        table.add_row(vec![name.as_str()]);
    }
    println!("{table}");
    Ok(())
}

fn print_functions(json_output: bool, members: &[String], statics: &[String]) -> Result<()> {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "memberFunctions": members,
                "staticFunctions": statics,
            }))?
        );
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["function", "kind"]);
    for name in members {
        table.add_row(vec![name.as_str(), "member"]);
    }
    for name in statics {
        table.add_row(vec![name.as_str(), "static"]);
    }
    println!("{table}");
    Ok(())
}

fn print_value(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
