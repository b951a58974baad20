use std::path::{Path, PathBuf};

use concierge_agent::retrieval::RetrievalError;
use concierge_agent::runtime::{AgentRuntime, RunReport, RunRequest};
use concierge_core::config::AppConfig;
use concierge_core::errors::ApplicationError;
use concierge_core::{DomainError, FlowTransitionError};
use tracing::error;
use uuid::Uuid;

use crate::commands::{
    init_logging, load_options, CommandResult, EXIT_COLLABORATOR_FAILURE, EXIT_CONFIG_FAILURE,
};

#[derive(Debug, Clone, Default)]
pub struct AskArgs {
    pub query: String,
    pub json: bool,
    pub trace: bool,
    pub files: Vec<PathBuf>,
}

pub fn run(args: AskArgs, config_path: Option<&Path>) -> CommandResult {
    let config = match AppConfig::load(load_options(config_path)) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "config_validation",
                error.to_string(),
                EXIT_CONFIG_FAILURE,
            )
        }
    };
    init_logging(&config);
    execute(&config, args)
}

pub fn execute(config: &AppConfig, args: AskArgs) -> CommandResult {
    let correlation_id = format!("req-{}", Uuid::new_v4());

    if args.query.trim().is_empty() {
        return CommandResult::failure("ask", "bad_request", "query must not be empty", 1);
    }

    let runtime = match AgentRuntime::from_config(config) {
        Ok(runtime) => runtime,
        Err(error) => {
            return interface_failure(
                ApplicationError::Configuration(format!("{error:#}")),
                &correlation_id,
                EXIT_CONFIG_FAILURE,
            )
        }
    };

    let executor = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(executor) => executor,
        Err(error) => {
            return interface_failure(
                ApplicationError::Integration(format!("failed to initialize async runtime: {error}")),
                &correlation_id,
                EXIT_COLLABORATOR_FAILURE,
            )
        }
    };

    let mut request = RunRequest::new(args.query.trim());
    request.file_paths = args.files.clone();

    match executor.block_on(runtime.run_request(request)) {
        Ok(report) => CommandResult { exit_code: 0, output: render(&report, args.json, args.trace) },
        Err(error) => {
            let application_error = classify_run_error(&error);
            let exit_code = match application_error {
                ApplicationError::Domain(_) => 1,
                _ => EXIT_COLLABORATOR_FAILURE,
            };
            interface_failure(application_error, &correlation_id, exit_code)
        }
    }
}

/// Run-state invariant breaches are internal faults; everything else came from a collaborator.
fn classify_run_error(error: &anyhow::Error) -> ApplicationError {
    if let Some(domain) = error.downcast_ref::<DomainError>() {
        return ApplicationError::Domain(domain.clone());
    }
    if let Some(flow) = error.downcast_ref::<FlowTransitionError>() {
        return ApplicationError::Domain(DomainError::from(flow.clone()));
    }
    if error.chain().any(|cause| cause.is::<RetrievalError>()) {
        ApplicationError::Retrieval(format!("{error:#}"))
    } else {
        ApplicationError::Integration(format!("{error:#}"))
    }
}

fn interface_failure(error: ApplicationError, correlation_id: &str, exit_code: u8) -> CommandResult {
    error!(
        event_name = "cli.ask_failed",
        correlation_id = %correlation_id,
        error = %error,
        "ask command failed"
    );
    let class = error_class(&error);
    let mapped = error.into_interface(correlation_id);
    CommandResult::failure_with_correlation(
        "ask",
        class,
        format!("{} ({mapped})", mapped.user_message()),
        exit_code,
        Some(mapped.correlation_id().to_owned()),
    )
}

fn error_class(error: &ApplicationError) -> &'static str {
    match error {
        ApplicationError::Domain(_) => "internal",
        ApplicationError::Retrieval(_) | ApplicationError::Integration(_) => {
            "collaborator_unavailable"
        }
        ApplicationError::Configuration(_) => "configuration",
    }
}

/// Human output is the answer, then sources, then optionally the trace summary.
pub fn render(report: &RunReport, json: bool, trace: bool) -> String {
    if json {
        return serde_json::to_string_pretty(report).unwrap_or_else(|error| {
            format!("{{\"status\":\"error\",\"message\":\"run serialization failed: {error}\"}}")
        });
    }

    let mut out = report.final_answer().to_owned();
    let citations = report.state.citations();
    if !citations.is_empty() {
        out.push_str("\n\nSources:");
        for source in citations {
            out.push_str(&format!("\n- {source}"));
        }
    }
    if trace {
        out.push_str("\n\n");
        out.push_str(&report.trace_summary());
    }
    out
}

#[cfg(test)]
mod tests {
    use concierge_agent::runtime::RunReport;
    use concierge_core::{AppConfig, Chunk, RunState};
    use serde_json::Value;

    use anyhow::anyhow;
    use concierge_agent::retrieval::RetrievalError;
    use concierge_core::errors::ApplicationError;
    use concierge_core::{DomainError, FlowTransitionError, Node, NodeEvent};

    use super::{classify_run_error, error_class, execute, render, AskArgs};

    fn report() -> RunReport {
        let mut state = RunState::new("What is the relocation allowance?");
        state.set_retrieval(vec![Chunk::new("$5,000 relocation allowance", "relocation.md")]);
        state.cite_retrieved_sources();
        state.set_answer("It is $5,000 [Source: relocation.md].").expect("unsealed");
        state.seal_answer(|text| text.to_owned(), "fallback");
        RunReport { state, trace: Vec::new() }
    }

    #[test]
    fn human_output_lists_sources_and_optional_trace() {
        let report = report();
        assert_eq!(
            render(&report, false, false),
            "It is $5,000 [Source: relocation.md].\n\nSources:\n- relocation.md"
        );
        assert!(render(&report, false, true).ends_with("No trace data"));
    }

    #[test]
    fn json_output_carries_the_run_state() {
        let output = render(&report(), true, false);
        let value: Value = serde_json::from_str(&output).expect("valid json");
        assert_eq!(value["state"]["final_answer"], "It is $5,000 [Source: relocation.md].");
        assert_eq!(value["state"]["citations"][0], "relocation.md");
    }

    #[test]
    fn missing_api_key_is_a_configuration_failure() {
        let result = execute(
            &AppConfig::default(),
            AskArgs { query: "hello".to_owned(), ..AskArgs::default() },
        );
        assert_eq!(result.exit_code, 2);
        let payload: Value = serde_json::from_str(&result.output).expect("valid json");
        assert_eq!(payload["error_class"], "configuration");
        assert!(payload["correlation_id"].as_str().unwrap_or_default().starts_with("req-"));
    }

    #[test]
    fn run_errors_are_classified_by_origin() {
        let sealed = anyhow::Error::from(DomainError::AnswerSealed { run_id: "run-1".to_owned() });
        let classified = classify_run_error(&sealed);
        assert!(matches!(classified, ApplicationError::Domain(DomainError::AnswerSealed { .. })));
        assert_eq!(error_class(&classified), "internal");

        let flow = anyhow::Error::from(FlowTransitionError::InvalidTransition {
            node: Node::Done,
            event: NodeEvent::Initialized,
        });
        assert!(matches!(
            classify_run_error(&flow),
            ApplicationError::Domain(DomainError::FlowTransition(_))
        ));

        let index = anyhow::Error::from(RetrievalError::DimensionMismatch {
            context: "query embedding".to_owned(),
            expected: 2,
            found: 3,
        })
        .context("retrieval node failed");
        assert!(matches!(classify_run_error(&index), ApplicationError::Retrieval(_)));

        let http = anyhow!("completion endpoint returned 502");
        let classified = classify_run_error(&http);
        assert!(matches!(classified, ApplicationError::Integration(_)));
        assert_eq!(error_class(&classified), "collaborator_unavailable");
    }
}
