use clap::{Parser, Subcommand};
use dlm_audit_log::{verify_log, AuditAppender};
use dlm_audit_spec as spec;
use dlm_mediator::{MediationDiagnostic, Mediator, QLLM_TOOL_NAME};
use dlm_policy::{PolicyDecision, PolicyGate};
use dlm_providers::{OpenAICompatProvider, Provider, QllmRequest};
use dlm_registry::{Key, KeyRegistry};
use dlm_schema::{Format, TypeTag};
use dotenvy::from_path as dotenv_from_path;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] dlm_common::CanonError),
    #[error("registry error: {0}")]
    Registry(#[from] dlm_registry::RegistryError),
    #[error("mediator error: {0}")]
    Mediator(#[from] dlm_mediator::MediatorError),
    #[error("audit error: {0}")]
    Audit(#[from] dlm_audit_log::AuditLogError),
    #[error("{0}")]
    Policy(#[from] dlm_policy::PolicyViolation),
    #[error("schema error: {0}")]
    Schema(#[from] dlm_schema::SchemaError),
    #[error("provider error: {0}")]
    Provider(#[from] dlm_providers::ProviderError),
    #[error("bank error: {0}")]
    Bank(#[from] demo_tools::BankError),
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
}

#[derive(Parser)]
#[command(name = "dlm-control", version, about = "Dual-LLM mediation control-plane utilities")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-scripted sequence of tool calls through
    /// before_tool/PolicyGate/after_tool/(SchemaValidator), printing the
    /// sanitized planner-visible result per step.
    RunTrace {
        #[arg(long)]
        trace: PathBuf,

        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Write the final KeyRegistry snapshot here (for `resolve-final`).
        #[arg(long)]
        dump_registry: Option<PathBuf>,
    },

    /// Run the canned banking scenarios (spec.md §8 seed cases 1-3) against
    /// the in-memory mock bank, printing PASS/BLOCKED per scenario.
    DemoBanking,

    /// Run FinalResolver (the `after_agent` hook) over a piece of text using
    /// a previously dumped KeyRegistry snapshot.
    ResolveFinal {
        #[arg(long)]
        text: String,

        #[arg(long)]
        registry_dump: PathBuf,

        #[arg(long)]
        audit_log: Option<PathBuf>,
    },

    /// Verify a hash-chained audit log JSONL and print the final hash.
    VerifyAudit {
        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Dispatch a resolved `qllm_remote` argument `{request, source, format}`
    /// to a live OpenAI-compatible backend and print the normalized reply.
    /// This is the one code path that actually exercises `dlm-providers`
    /// rather than merely linking it — the blocking "HTTP call to the Q-LLM
    /// service" spec.md §5 calls out as outside the core's control.
    DispatchQllm {
        /// Path to a JSON file shaped `{request, source, format}` — the
        /// resolved `qllm_remote` argument, post-`before_tool`.
        #[arg(long)]
        request_json: PathBuf,

        /// Can be supplied via env QLLM_BASE_URL instead.
        #[arg(long)]
        base_url: Option<String>,

        /// Can be supplied via env QLLM_API_KEY instead.
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,
    },
}

#[derive(Debug, Deserialize)]
struct TraceStep {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    result: Value,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    load_dotenv();
    let args = Args::parse();
    match args.cmd {
        Command::RunTrace { trace, audit_log, dump_registry } => run_trace(trace, audit_log, dump_registry),
        Command::DemoBanking => demo_banking(),
        Command::ResolveFinal { text, registry_dump, audit_log } => resolve_final(text, registry_dump, audit_log),
        Command::VerifyAudit { audit_log } => {
            let last = verify_log(audit_log)?;
            println!("{last}");
            Ok(())
        }
        Command::DispatchQllm { request_json, base_url, api_key, model } => {
            dispatch_qllm(request_json, base_url, api_key, model).await
        }
    }
}

fn load_dotenv() {
    if Path::new(".env").exists() {
        let _ = dotenv_from_path(".env");
    }
}

/// A `send_money` policy mirroring `original_source/benchmarks/banking/policy.py`:
/// trusted-IBAN allowlist plus a $2000 transfer limit.
fn banking_policy() -> PolicyGate {
    PolicyGate::all(vec![
        PolicyGate::allowlist(
            "send_money",
            "recipient",
            demo_tools::TRUSTED_IBANS.iter().map(|s| s.to_string()).collect(),
        ),
        PolicyGate::scalar_threshold("send_money", "amount", 2000.0),
    ])
}

fn run_trace(trace_path: PathBuf, audit_log: Option<PathBuf>, dump_registry: Option<PathBuf>) -> Result<(), CliError> {
    let bytes = fs::read(&trace_path)?;
    let steps: Vec<TraceStep> = serde_json::from_slice(&bytes)?;

    let registry = Arc::new(KeyRegistry::new());
    let mediator = Mediator::new(Arc::clone(&registry));
    let policy = banking_policy();
    let session_id = spec::SessionId("run-trace".to_string());
    mediator.before_agent(&session_id.0);

    let mut audit = audit_log.map(AuditAppender::open).transpose()?;

    for (idx, step) in steps.into_iter().enumerate() {
        let mut resolved_args = step.args.clone();
        let diagnostics = mediator.before_tool(&step.tool, &mut resolved_args)?;
        if let Some(app) = audit.as_mut() {
            for diagnostic in &diagnostics {
                app.append(diagnostic_event(diagnostic, &session_id, idx as f64, "argument_resolution", &step.tool))?;
            }
            let evt = spec::AuditEvent::ToolInvocationResolved(spec::ToolInvocationResolved {
                schema_version: 1,
                session_id: session_id.clone(),
                ts: idx as f64,
                tool_name: step.tool.clone(),
                args_hash: KeyRegistry::hash_value(&resolved_args)?,
            });
            app.append(evt)?;
        }

        if let PolicyDecision::Deny(reason) = policy.check(&step.tool, &resolved_args) {
            println!("{{\"step\":{idx},\"tool\":\"{}\",\"status\":\"BLOCKED\",\"reason\":\"{reason}\"}}", step.tool);
            if let Some(app) = audit.as_mut() {
                let evt = spec::AuditEvent::PolicyDecided(spec::PolicyDecided {
                    schema_version: 1,
                    session_id: session_id.clone(),
                    ts: idx as f64,
                    tool_name: step.tool.clone(),
                    verdict: spec::PolicyVerdict::Deny,
                    risk_class: spec::RiskClass::Write,
                    reason: Some(reason),
                });
                app.append(evt)?;
            }
            continue;
        }

        if step.tool == QLLM_TOOL_NAME {
            if let Some(format_value) = resolved_args.get("format") {
                let format: Format = serde_json::from_value(format_value.clone())
                    .map_err(|e| CliError::MalformedTrace(format!("invalid format map: {e}")))?;
                if let Err(violation) = dlm_schema::validate(&step.result, &format) {
                    println!("{{\"step\":{idx},\"tool\":\"{}\",\"status\":\"SCHEMA_REJECTED\",\"reason\":\"{violation}\"}}", step.tool);
                    if let Some(app) = audit.as_mut() {
                        let fields = match &violation {
                            dlm_schema::SchemaError::Violation(v) => {
                                v.missing_fields.iter().chain(v.type_mismatches.iter()).cloned().collect()
                            }
                            dlm_schema::SchemaError::NotAnObject => format.keys().cloned().collect(),
                        };
                        let evt = spec::AuditEvent::QllmResponseRejected(spec::QllmResponseRejected {
                            schema_version: 1,
                            session_id: session_id.clone(),
                            ts: idx as f64,
                            failing_fields: fields,
                        });
                        app.append(evt)?;
                    }
                    continue;
                }
                if let Some(app) = audit.as_mut() {
                    let evt = spec::AuditEvent::QllmResponseValidated(spec::QllmResponseValidated {
                        schema_version: 1,
                        session_id: session_id.clone(),
                        ts: idx as f64,
                        fields: format.keys().cloned().collect(),
                    });
                    app.append(evt)?;
                }
            }
        }

        let sanitized = mediator.after_tool(&step.tool, step.result.clone())?;
        println!(
            "{{\"step\":{idx},\"tool\":\"{}\",\"status\":\"OK\",\"result\":{}}}",
            step.tool, sanitized
        );
        if let Some(app) = audit.as_mut() {
            let keys = extract_keys(&sanitized);
            // One KeyCreated event per key actually minted this step (spec.md
            // §3: "entries are added on every tool return"), in addition to
            // the coarser ToolInvocationSanitized summary below.
            for key in &keys {
                let evt = spec::AuditEvent::KeyCreated(spec::KeyCreated {
                    schema_version: 1,
                    session_id: session_id.clone(),
                    ts: idx as f64,
                    key: spec::KeyId(key.id()),
                    type_hint: registry.type_hint(*key)?,
                    value_hash: KeyRegistry::hash_value(&registry.resolve(*key)?)?,
                });
                app.append(evt)?;
            }
            let keys_issued = keys.iter().map(|k| spec::KeyId(k.id())).collect();
            let evt = spec::AuditEvent::ToolInvocationSanitized(spec::ToolInvocationSanitized {
                schema_version: 1,
                session_id: session_id.clone(),
                ts: idx as f64,
                tool_name: step.tool.clone(),
                result_hash: KeyRegistry::hash_value(&step.result)?,
                keys_issued,
            });
            app.append(evt)?;
        }
    }

    if let Some(dump_path) = dump_registry {
        let dump = registry.dump()?;
        fs::write(dump_path, serde_json::to_vec(&dump)?)?;
    }

    Ok(())
}

/// Turn a `MediationDiagnostic` from `before_tool`/`resolve_final` into its
/// audit-log counterpart. `site` distinguishes the two call sites spec.md
/// §7's error table lists separately: `before_tool`'s argument resolution
/// (`"argument_resolution"`) vs. `resolve_final`'s end-of-turn resolution
/// (`"final_resolution"`). `tool_name` is only meaningful for
/// `MalformedQllmRequest`, which only ever arises from `before_tool`.
fn diagnostic_event(
    diagnostic: &MediationDiagnostic,
    session_id: &spec::SessionId,
    ts: f64,
    site: &str,
    tool_name: &str,
) -> spec::AuditEvent {
    match diagnostic {
        MediationDiagnostic::UnknownKey { token } => {
            spec::AuditEvent::KeyResolutionFailed(spec::KeyResolutionFailed {
                schema_version: 1,
                session_id: session_id.clone(),
                ts,
                token: token.clone(),
                site: site.to_string(),
            })
        }
        MediationDiagnostic::MalformedQllmRequest => {
            spec::AuditEvent::MalformedQllmRequest(spec::MalformedQllmRequest {
                schema_version: 1,
                session_id: session_id.clone(),
                ts,
                tool_name: tool_name.to_string(),
            })
        }
    }
}

fn extract_keys(value: &Value) -> Vec<Key> {
    let mut out = Vec::new();
    collect_keys(value, &mut out);
    out
}

fn collect_keys(value: &Value, out: &mut Vec<Key>) {
    match value {
        Value::String(s) => {
            if let Some(key) = Key::parse_exact(s) {
                out.push(key);
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_keys(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_keys(v, out)),
        _ => {}
    }
}

fn demo_banking() -> Result<(), CliError> {
    let bank = demo_tools::MockBank::new();
    let policy = banking_policy();
    let registry = Arc::new(KeyRegistry::new());
    let mediator = Mediator::new(Arc::clone(&registry));
    mediator.before_agent("demo-banking");

    let scenarios: &[(&str, &str, f64)] = &[
        ("allowlisted_transfer", "CH9300762011623852957", 500.0),
        ("non_allowlisted_transfer", "US133000000121212121212", 500.0),
        ("amount_limit_transfer", "CH9300762011623852957", 5000.0),
    ];

    for (name, recipient, amount) in scenarios {
        let key = registry.create(Value::from(*recipient), "tool:get_account")?;
        let mut args = serde_json::json!({ "recipient": key.to_string(), "amount": amount });
        // Scripted inputs here are always known keys; any diagnostic would
        // indicate a bug in this demo itself, not something to audit.
        let _diagnostics = mediator.before_tool("send_money", &mut args)?;

        match policy.check("send_money", &args) {
            PolicyDecision::Allow => {
                bank.send_money("CH9300762011623852957", recipient, *amount)?;
                println!("{name}: PASS");
            }
            PolicyDecision::Deny(reason) => {
                println!("{name}: BLOCKED ({reason})");
            }
        }
    }

    Ok(())
}

fn resolve_final(text: String, registry_dump: PathBuf, audit_log: Option<PathBuf>) -> Result<(), CliError> {
    let bytes = fs::read(&registry_dump)?;
    let dump: Value = serde_json::from_slice(&bytes)?;
    let registry = Arc::new(KeyRegistry::load(&dump)?);
    let mediator = Mediator::new(registry);
    let session_id = spec::SessionId("resolve-final".to_string());
    let (resolved, diagnostics, resolved_count) = mediator.after_agent(&session_id.0, &text)?;
    println!("{resolved}");

    if let Some(path) = audit_log {
        let mut app = AuditAppender::open(path)?;
        for diagnostic in &diagnostics {
            app.append(diagnostic_event(diagnostic, &session_id, 0.0, "final_resolution", ""))?;
        }
        let evt = spec::AuditEvent::FinalResolutionPerformed(spec::FinalResolutionPerformed {
            schema_version: 1,
            session_id,
            ts: 0.0,
            keys_resolved: resolved_count as u32,
            keys_unresolved: diagnostics.len() as u32,
        });
        app.append(evt)?;
    }

    Ok(())
}

/// Dispatch a resolved `qllm_remote` request to a live OpenAI-compatible
/// backend and print the normalized reply. The one call site in this
/// workspace that actually exercises `dlm-providers::OpenAICompatProvider`.
async fn dispatch_qllm(
    request_json: PathBuf,
    base_url: Option<String>,
    api_key: Option<String>,
    model: String,
) -> Result<(), CliError> {
    let bytes = fs::read(&request_json)?;
    let req: QllmRequest = serde_json::from_slice(&bytes)?;

    let base_url = base_url
        .or_else(|| std::env::var("QLLM_BASE_URL").ok())
        .unwrap_or_else(|| "https://api.openai.com".to_string());
    let api_key = api_key.or_else(|| std::env::var("QLLM_API_KEY").ok());

    let provider = OpenAICompatProvider::new(base_url, api_key, model);
    let response = provider.dispatch(&req).await?;
    println!(
        "{{\"finish_reason\":{},\"content\":{}}}",
        serde_json::to_string(&response.normalized.finish_reason)?,
        serde_json::to_string(&response.normalized.content)?
    );
    Ok(())
}
