use std::fs;
use std::path::Path;

use concierge_agent::retrieval::CorpusFile;
use concierge_core::config::AppConfig;
use serde::Serialize;

use crate::commands::{load_options, CommandResult, EXIT_CONFIG_FAILURE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const CHECKS_AFTER_CONFIG: [&str; 4] =
    ["llm_credentials", "corpus_index", "sandbox_root", "calendar_store"];

pub fn run(json_output: bool, config_path: Option<&Path>) -> CommandResult {
    let report = match AppConfig::load(load_options(config_path)) {
        Ok(config) => build_report(&config),
        Err(error) => {
            let mut checks = vec![DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            }];
            checks.extend(CHECKS_AFTER_CONFIG.iter().map(|&name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
            summarize(checks)
        }
    };

    let exit_code = match report.overall_status {
        CheckStatus::Pass => 0,
        _ if report.checks[0].status == CheckStatus::Fail => EXIT_CONFIG_FAILURE,
        _ => 1,
    };
    CommandResult { exit_code, output: render(&report, json_output) }
}

fn render(report: &DoctorReport, json_output: bool) -> String {
    if json_output {
        return serde_json::to_string_pretty(report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(report)
}

fn build_report(config: &AppConfig) -> DoctorReport {
    let checks = vec![
        DoctorCheck {
            name: "config_validation",
            status: CheckStatus::Pass,
            details: "configuration loaded and validated".to_string(),
        },
        check_llm_credentials(config),
        check_corpus_index(&config.retrieval.index_path),
        check_sandbox_root(&config.guard.sandbox_root),
        check_calendar_store(&config.tools.calendar_path),
    ];
    summarize(checks)
}

fn summarize(checks: Vec<DoctorCheck>) -> DoctorReport {
    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_credentials(config: &AppConfig) -> DoctorCheck {
    if config.has_llm_api_key() {
        DoctorCheck {
            name: "llm_credentials",
            status: CheckStatus::Pass,
            details: format!("api key present for `{}`", config.llm.base_url),
        }
    } else {
        DoctorCheck {
            name: "llm_credentials",
            status: CheckStatus::Fail,
            details: "no api key; export OPENAI_API_KEY or CONCIERGE_LLM_API_KEY".to_string(),
        }
    }
}

fn check_corpus_index(path: &Path) -> DoctorCheck {
    let result = fs::read_to_string(path)
        .map_err(|error| format!("cannot read `{}`: {error}", path.display()))
        .and_then(|raw| {
            serde_json::from_str::<CorpusFile>(&raw)
                .map_err(|error| format!("cannot parse `{}`: {error}", path.display()))
        })
        .and_then(|file| {
            let entries = file.entries.len();
            file.into_corpus().map(|_| entries).map_err(|error| error.to_string())
        });

    match result {
        Ok(entries) => DoctorCheck {
            name: "corpus_index",
            status: CheckStatus::Pass,
            details: format!("{entries} chunk(s) indexed in `{}`", path.display()),
        },
        Err(details) => DoctorCheck { name: "corpus_index", status: CheckStatus::Fail, details },
    }
}

fn check_sandbox_root(path: &Path) -> DoctorCheck {
    if path.is_dir() {
        DoctorCheck {
            name: "sandbox_root",
            status: CheckStatus::Pass,
            details: format!("sandbox directory `{}` exists", path.display()),
        }
    } else {
        DoctorCheck {
            name: "sandbox_root",
            status: CheckStatus::Fail,
            details: format!("sandbox directory `{}` does not exist", path.display()),
        }
    }
}

fn check_calendar_store(path: &Path) -> DoctorCheck {
    let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    match parent {
        Some(parent) if !parent.is_dir() => DoctorCheck {
            name: "calendar_store",
            status: CheckStatus::Fail,
            details: format!("calendar directory `{}` does not exist", parent.display()),
        },
        _ => DoctorCheck {
            name: "calendar_store",
            status: CheckStatus::Pass,
            details: format!("calendar store at `{}`", path.display()),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::TempDir;

    use super::{check_calendar_store, check_corpus_index, check_sandbox_root, CheckStatus};

    #[test]
    fn corpus_index_must_parse_with_consistent_dimensions() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("corpus.json");
        assert_eq!(check_corpus_index(&path).status, CheckStatus::Fail);

        let valid = json!({
            "dimension": 2,
            "entries": [{"content": "a", "source": "a.md", "embedding": [0.0, 1.0]}]
        });
        fs::write(&path, valid.to_string()).expect("write");
        let check = check_corpus_index(&path);
        assert_eq!(check.status, CheckStatus::Pass);
        assert!(check.details.starts_with("1 chunk(s)"));

        let mismatched = json!({
            "dimension": 3,
            "entries": [{"content": "a", "source": "a.md", "embedding": [0.0, 1.0]}]
        });
        fs::write(&path, mismatched.to_string()).expect("write");
        assert_eq!(check_corpus_index(&path).status, CheckStatus::Fail);
    }

    #[test]
    fn directory_checks_follow_the_filesystem() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(check_sandbox_root(dir.path()).status, CheckStatus::Pass);
        assert_eq!(check_sandbox_root(&dir.path().join("missing")).status, CheckStatus::Fail);

        assert_eq!(check_calendar_store(&dir.path().join("calendar.json")).status, CheckStatus::Pass);
        assert_eq!(
            check_calendar_store(&dir.path().join("missing/calendar.json")).status,
            CheckStatus::Fail
        );
    }
}
